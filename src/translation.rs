//! Payload translation between CoAP payloads and twin events
//!
//! Translators are plain functions behind traits so hosts can pass closures. A
//! [`TranslatorSet`] holds the defaults plus per-resource overrides and guards every
//! call: a failing or panicking translator yields an empty result instead of taking
//! the calling thread down.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::coap_types::ContentFormat;
use crate::error::{AdapterError, Result};

/// Property update produced from a resource payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyEvent {
    pub key: String,
    pub value: Value,
    /// Left empty by translators that do not pin an output type; filled from the
    /// response content format before publishing
    pub content_type: Option<String>,
}

impl PropertyEvent {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Event notification, used for errors and action outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    pub key: String,
    pub body: Value,
    pub content_type: Option<String>,
}

impl EventNotification {
    pub fn new(key: impl Into<String>, body: Value) -> Self {
        Self {
            key: key.into(),
            body,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Action requested by the twin, keyed `"<METHOD> <uri>"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionIntent {
    pub key: String,
    #[serde(default)]
    pub body: Value,
}

impl ActionIntent {
    pub fn new(key: impl Into<String>, body: Value) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }
}

/// Encoded outbound action body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedAction {
    pub payload: Vec<u8>,
    /// Format the payload was encoded in
    pub content_format: ContentFormat,
}

/// Converts a resource payload into property updates
pub trait PropertyTranslator: Send + Sync {
    fn translate(&self, key: &str, payload: &[u8], format: ContentFormat) -> Result<Vec<PropertyEvent>>;
}

impl<F> PropertyTranslator for F
where
    F: Fn(&str, &[u8], ContentFormat) -> Result<Vec<PropertyEvent>> + Send + Sync,
{
    fn translate(&self, key: &str, payload: &[u8], format: ContentFormat) -> Result<Vec<PropertyEvent>> {
        self(key, payload, format)
    }
}

/// Converts a resource message (error text, action outcome) into events
pub trait EventTranslator: Send + Sync {
    fn translate(&self, key: &str, message: &str) -> Result<Vec<EventNotification>>;
}

impl<F> EventTranslator for F
where
    F: Fn(&str, &str) -> Result<Vec<EventNotification>> + Send + Sync,
{
    fn translate(&self, key: &str, message: &str) -> Result<Vec<EventNotification>> {
        self(key, message)
    }
}

/// Converts a twin action into a request body
///
/// `format` is the resource's configured action content type.
pub trait ActionTranslator: Send + Sync {
    fn translate(&self, action: &ActionIntent, format: ContentFormat) -> Result<Vec<u8>>;

    /// Content format of the produced body; `None` keeps the resource's action content type
    fn content_format(&self) -> Option<ContentFormat> {
        None
    }
}

impl<F> ActionTranslator for F
where
    F: Fn(&ActionIntent, ContentFormat) -> Result<Vec<u8>> + Send + Sync,
{
    fn translate(&self, action: &ActionIntent, format: ContentFormat) -> Result<Vec<u8>> {
        self(action, format)
    }
}

/// Default property translator: decodes the payload by content format
///
/// text/plain becomes a number when it parses as one, JSON and CBOR (including
/// their SenML variants) become structured values, anything else is base64-encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadPropertyTranslator;

impl PropertyTranslator for PayloadPropertyTranslator {
    fn translate(&self, key: &str, payload: &[u8], format: ContentFormat) -> Result<Vec<PropertyEvent>> {
        Ok(vec![PropertyEvent::new(key, decode_payload(payload, format)?)])
    }
}

/// Default event translator: the message as a text/plain string body
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageEventTranslator;

impl EventTranslator for MessageEventTranslator {
    fn translate(&self, key: &str, message: &str) -> Result<Vec<EventNotification>> {
        Ok(vec![
            EventNotification::new(key, Value::String(message.to_string()))
                .with_content_type(ContentFormat::TextPlain.mime_type()),
        ])
    }
}

/// Default action translator: encodes the action body
///
/// Without a pinned format the body follows the resource's action content type.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodingActionTranslator {
    pub format: Option<ContentFormat>,
}

impl EncodingActionTranslator {
    /// Always encode in `format`, whatever the resource is configured with
    pub fn new(format: ContentFormat) -> Self {
        Self {
            format: Some(format),
        }
    }
}

impl ActionTranslator for EncodingActionTranslator {
    fn translate(&self, action: &ActionIntent, format: ContentFormat) -> Result<Vec<u8>> {
        encode_body(&action.body, self.format.unwrap_or(format))
    }

    fn content_format(&self) -> Option<ContentFormat> {
        self.format
    }
}

/// Decode a payload into a JSON value according to its content format
pub fn decode_payload(payload: &[u8], format: ContentFormat) -> Result<Value> {
    match format {
        ContentFormat::TextPlain => {
            let text = String::from_utf8_lossy(payload);
            let text = text.trim();
            Ok(text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(text.to_string())))
        }
        ContentFormat::Json | ContentFormat::SenmlJson => Ok(serde_json::from_slice(payload)?),
        ContentFormat::Cbor | ContentFormat::SenmlCbor => ciborium::de::from_reader(payload)
            .map_err(|e| AdapterError::Translation(format!("invalid CBOR payload: {:?}", e))),
        ContentFormat::LinkFormat | ContentFormat::Xml => {
            Ok(Value::String(String::from_utf8_lossy(payload).into_owned()))
        }
        ContentFormat::OctetStream | ContentFormat::Exi | ContentFormat::Other(_) => {
            Ok(Value::String(BASE64.encode(payload)))
        }
    }
}

/// Encode a JSON value as a request body in the given content format
pub fn encode_body(body: &Value, format: ContentFormat) -> Result<Vec<u8>> {
    match format {
        ContentFormat::Json | ContentFormat::SenmlJson => Ok(serde_json::to_vec(body)?),
        ContentFormat::Cbor | ContentFormat::SenmlCbor => {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(body, &mut buf)
                .map_err(|e| AdapterError::Translation(format!("cannot encode CBOR body: {:?}", e)))?;
            Ok(buf)
        }
        ContentFormat::OctetStream | ContentFormat::Exi | ContentFormat::Other(_) => match body {
            Value::String(encoded) => BASE64
                .decode(encoded)
                .map_err(|e| AdapterError::Translation(format!("invalid base64 body: {}", e))),
            Value::Null => Ok(Vec::new()),
            other => Ok(other.to_string().into_bytes()),
        },
        _ => match body {
            Value::Null => Ok(Vec::new()),
            Value::String(text) => Ok(text.as_bytes().to_vec()),
            other => Ok(other.to_string().into_bytes()),
        },
    }
}

/// Default translators plus per-resource overrides
///
/// Overrides are looked up by resource key first, then by URI. The set is built once
/// and shared read-only by every resource.
#[derive(Clone, Default)]
pub struct TranslatorSet {
    property: Option<Arc<dyn PropertyTranslator>>,
    event: Option<Arc<dyn EventTranslator>>,
    action: Option<Arc<dyn ActionTranslator>>,
    property_overrides: HashMap<String, Arc<dyn PropertyTranslator>>,
    event_overrides: HashMap<String, Arc<dyn EventTranslator>>,
    action_overrides: HashMap<String, Arc<dyn ActionTranslator>>,
}

impl TranslatorSet {
    /// Empty set, no translators at all
    pub fn new() -> Self {
        Self::default()
    }

    /// Set with the built-in default translators
    pub fn with_defaults() -> Self {
        let mut set = Self::new();
        set.fill_defaults();
        set
    }

    /// Install built-in translators where no default was configured
    pub fn fill_defaults(&mut self) {
        if self.property.is_none() {
            self.property = Some(Arc::new(PayloadPropertyTranslator));
        }
        if self.event.is_none() {
            self.event = Some(Arc::new(MessageEventTranslator));
        }
        if self.action.is_none() {
            self.action = Some(Arc::new(EncodingActionTranslator::default()));
        }
    }

    pub fn set_default_property(&mut self, translator: impl PropertyTranslator + 'static) {
        self.property = Some(Arc::new(translator));
    }

    pub fn set_default_event(&mut self, translator: impl EventTranslator + 'static) {
        self.event = Some(Arc::new(translator));
    }

    pub fn set_default_action(&mut self, translator: impl ActionTranslator + 'static) {
        self.action = Some(Arc::new(translator));
    }

    pub fn add_property_override(
        &mut self,
        resource: impl Into<String>,
        translator: impl PropertyTranslator + 'static,
    ) {
        self.property_overrides
            .insert(resource.into(), Arc::new(translator));
    }

    pub fn add_event_override(
        &mut self,
        resource: impl Into<String>,
        translator: impl EventTranslator + 'static,
    ) {
        self.event_overrides.insert(resource.into(), Arc::new(translator));
    }

    pub fn add_action_override(
        &mut self,
        resource: impl Into<String>,
        translator: impl ActionTranslator + 'static,
    ) {
        self.action_overrides
            .insert(resource.into(), Arc::new(translator));
    }

    fn property_for(&self, key: &str, uri: &str) -> Option<&Arc<dyn PropertyTranslator>> {
        lookup(&self.property_overrides, key, uri).or(self.property.as_ref())
    }

    fn event_for(&self, key: &str, uri: &str) -> Option<&Arc<dyn EventTranslator>> {
        lookup(&self.event_overrides, key, uri).or(self.event.as_ref())
    }

    fn action_for(&self, key: &str, uri: &str) -> Option<&Arc<dyn ActionTranslator>> {
        lookup(&self.action_overrides, key, uri).or(self.action.as_ref())
    }

    pub fn has_property_translator(&self, key: &str, uri: &str) -> bool {
        self.property_for(key, uri).is_some()
    }

    pub fn has_event_translator(&self, key: &str, uri: &str) -> bool {
        self.event_for(key, uri).is_some()
    }

    pub fn has_action_translator(&self, key: &str, uri: &str) -> bool {
        self.action_for(key, uri).is_some()
    }

    /// Translate a payload into property updates
    ///
    /// Events without an explicit content type get the payload's format as a media type string.
    pub fn translate_property(
        &self,
        key: &str,
        uri: &str,
        payload: &[u8],
        format: ContentFormat,
    ) -> Vec<PropertyEvent> {
        let Some(translator) = self.property_for(key, uri) else {
            warn!(resource = %uri, "no property translator configured");
            return Vec::new();
        };
        guarded(uri, "property", || translator.translate(key, payload, format))
            .into_iter()
            .map(|mut event| {
                if event.content_type.is_none() {
                    event.content_type = Some(format.mime_type());
                }
                event
            })
            .collect()
    }

    /// Translate a message into event notifications
    pub fn translate_event(&self, key: &str, uri: &str, message: &str) -> Vec<EventNotification> {
        let Some(translator) = self.event_for(key, uri) else {
            warn!(resource = %uri, "no event translator configured");
            return Vec::new();
        };
        guarded(uri, "event", || translator.translate(key, message))
            .into_iter()
            .map(|mut event| {
                if event.content_type.is_none() {
                    event.content_type = Some(ContentFormat::TextPlain.mime_type());
                }
                event
            })
            .collect()
    }

    /// Encode an action body for a resource whose action content type is `format`
    ///
    /// `None` when no translator exists or it failed.
    pub fn translate_action(
        &self,
        key: &str,
        uri: &str,
        action: &ActionIntent,
        format: ContentFormat,
    ) -> Option<EncodedAction> {
        let Some(translator) = self.action_for(key, uri) else {
            warn!(resource = %uri, "no action translator configured");
            return None;
        };
        let payload = guarded(uri, "action", || {
            translator.translate(action, format).map(|p| vec![p])
        })
        .into_iter()
        .next()?;
        Some(EncodedAction {
            payload,
            content_format: translator.content_format().unwrap_or(format),
        })
    }
}

impl fmt::Debug for TranslatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslatorSet")
            .field("property", &self.property.is_some())
            .field("event", &self.event.is_some())
            .field("action", &self.action.is_some())
            .field("property_overrides", &self.property_overrides.keys().collect::<Vec<_>>())
            .field("event_overrides", &self.event_overrides.keys().collect::<Vec<_>>())
            .field("action_overrides", &self.action_overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn lookup<'a, T: ?Sized>(
    overrides: &'a HashMap<String, Arc<T>>,
    key: &str,
    uri: &str,
) -> Option<&'a Arc<T>> {
    overrides.get(key).or_else(|| overrides.get(uri))
}

/// Run a translator, turning errors and panics into an empty result
fn guarded<T>(uri: &str, what: &str, translate: impl FnOnce() -> Result<Vec<T>>) -> Vec<T> {
    match catch_unwind(AssertUnwindSafe(translate)) {
        Ok(Ok(items)) => items,
        Ok(Err(e)) => {
            warn!(resource = %uri, "{} translation failed: {}", what, e);
            Vec::new()
        }
        Err(_) => {
            error!(resource = %uri, "{} translator panicked", what);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_payload_becomes_number() {
        let set = TranslatorSet::with_defaults();
        let events = set.translate_property("temp.sensortemp", "/sensor/temp", b"22.5", ContentFormat::TextPlain);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "temp.sensortemp");
        assert_eq!(events[0].value, json!(22.5));
        assert_eq!(events[0].content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_decode_payload_formats() {
        assert_eq!(decode_payload(b"on", ContentFormat::TextPlain).unwrap(), json!("on"));
        assert_eq!(
            decode_payload(br#"{"v":23}"#, ContentFormat::Json).unwrap(),
            json!({"v": 23})
        );
        // {"v": 23}
        let cbor = hex::decode("a1617617").unwrap();
        assert_eq!(decode_payload(&cbor, ContentFormat::Cbor).unwrap(), json!({"v": 23}));
        assert_eq!(
            decode_payload(&[0xde, 0xad], ContentFormat::OctetStream).unwrap(),
            json!("3q0=")
        );
        assert!(decode_payload(b"{", ContentFormat::Json).is_err());
    }

    #[test]
    fn test_encode_body_formats() {
        assert_eq!(encode_body(&json!("on"), ContentFormat::TextPlain).unwrap(), b"on");
        assert_eq!(encode_body(&json!(21.5), ContentFormat::TextPlain).unwrap(), b"21.5");
        assert!(encode_body(&Value::Null, ContentFormat::TextPlain).unwrap().is_empty());
        assert_eq!(
            encode_body(&json!({"v": 23}), ContentFormat::Json).unwrap(),
            br#"{"v":23}"#
        );
        assert_eq!(
            encode_body(&json!({"v": 23}), ContentFormat::Cbor).unwrap(),
            hex::decode("a1617617").unwrap()
        );
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut set = TranslatorSet::with_defaults();
        set.add_property_override("light", |key: &str, _: &[u8], _: ContentFormat| -> Result<Vec<PropertyEvent>> {
            Ok(vec![
                PropertyEvent::new(key, json!(true)).with_content_type("application/x-switch"),
            ])
        });

        let overridden = set.translate_property("light", "/light", b"1", ContentFormat::TextPlain);
        assert_eq!(overridden[0].value, json!(true));
        assert_eq!(overridden[0].content_type.as_deref(), Some("application/x-switch"));

        // lookup by uri
        set.add_property_override("/heater", |key: &str, _: &[u8], _: ContentFormat| -> Result<Vec<PropertyEvent>> {
            Ok(vec![PropertyEvent::new(key, json!("custom"))])
        });
        let by_uri = set.translate_property("heater", "/heater", b"1", ContentFormat::Json);
        assert_eq!(by_uri[0].value, json!("custom"));
        assert_eq!(by_uri[0].content_type.as_deref(), Some("application/json"));

        let fallback = set.translate_property("other", "/other", b"1", ContentFormat::TextPlain);
        assert_eq!(fallback[0].value, json!(1.0));
    }

    #[test]
    fn test_failing_translators_yield_nothing() {
        let mut set = TranslatorSet::with_defaults();
        set.add_property_override("broken", |_: &str, _: &[u8], _: ContentFormat| -> Result<Vec<PropertyEvent>> {
            Err(AdapterError::Translation("boom".into()))
        });
        set.add_event_override("panicky", |_: &str, _: &str| -> Result<Vec<EventNotification>> {
            panic!("translator bug")
        });

        assert!(set.translate_property("broken", "/broken", b"1", ContentFormat::TextPlain).is_empty());
        assert!(set.translate_event("panicky", "/panicky", "oops").is_empty());
        assert!(set.translate_property("bad", "/bad", b"{", ContentFormat::Json).is_empty());
    }

    #[test]
    fn test_event_and_action_defaults() {
        let set = TranslatorSet::with_defaults();
        let events = set.translate_event("light", "/light", "Response code: 2.04");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body, json!("Response code: 2.04"));
        assert_eq!(events[0].content_type.as_deref(), Some("text/plain"));

        let action = ActionIntent::new("PUT /heater", json!(21));
        let encoded = set
            .translate_action("heater", "/heater", &action, ContentFormat::TextPlain)
            .unwrap();
        assert_eq!(encoded.payload, b"21");
        assert_eq!(encoded.content_format, ContentFormat::TextPlain);
    }

    #[test]
    fn test_default_action_encoding_follows_resource_format() {
        let set = TranslatorSet::with_defaults();
        let action = ActionIntent::new("PUT /heater", json!({"t": 21}));

        let encoded = set
            .translate_action("heater", "/heater", &action, ContentFormat::Json)
            .unwrap();
        assert_eq!(encoded.content_format, ContentFormat::Json);
        assert_eq!(encoded.payload, br#"{"t":21}"#);

        let encoded = set
            .translate_action("heater", "/heater", &action, ContentFormat::Cbor)
            .unwrap();
        assert_eq!(encoded.content_format, ContentFormat::Cbor);
        let decoded: Value = ciborium::de::from_reader(encoded.payload.as_slice()).unwrap();
        assert_eq!(decoded, json!({"t": 21}));
    }

    #[test]
    fn test_pinned_action_format_wins() {
        let mut set = TranslatorSet::with_defaults();
        set.add_action_override("/heater", EncodingActionTranslator::new(ContentFormat::Json));
        set.add_action_override(
            "valve",
            |action: &ActionIntent, format: ContentFormat| -> Result<Vec<u8>> {
                Ok(format!("{}:{}", format.as_u16(), action.body).into_bytes())
            },
        );

        let heat = ActionIntent::new("PUT /heater", json!(21));
        let encoded = set
            .translate_action("heater", "/heater", &heat, ContentFormat::TextPlain)
            .unwrap();
        assert_eq!(encoded.content_format, ContentFormat::Json);

        let open = ActionIntent::new("PUT /valve", json!(1));
        let encoded = set
            .translate_action("valve", "/valve", &open, ContentFormat::Cbor)
            .unwrap();
        assert_eq!(encoded.content_format, ContentFormat::Cbor);
        assert_eq!(encoded.payload, b"60:1");
    }

    #[test]
    fn test_empty_set_has_no_translators() {
        let set = TranslatorSet::new();
        assert!(!set.has_property_translator("a", "/a"));
        assert!(set.translate_property("a", "/a", b"1", ContentFormat::TextPlain).is_empty());
        assert!(set
            .translate_action("a", "/a", &ActionIntent::new("PUT /a", json!(1)), ContentFormat::TextPlain)
            .is_none());
    }
}
