//! Outbound action dispatch (twin → device)
//!
//! Actions arrive keyed `"<METHOD> <uri>"`. The dispatcher checks the target's
//! capabilities, encodes the body through the translator set, sends the request and
//! records the outcome on the resource.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::coap_types::{CoapRequest, CoapResponse, ContentFormat, Method, ResponseCode};
use crate::discovery;
use crate::error::{AdapterError, Result};
use crate::resource::{ResourceDescriptor, SyncUpdate, UpdateSource};
use crate::translation::{ActionIntent, TranslatorSet};
use crate::transport::CoapTransport;

/// Rejection recorded for a default PUT without body
pub const PUT_BODY_REQUIRED: &str = "Body is necessary for default PUT operations";
/// Rejection recorded for a default POST with body
pub const POST_BODY_NOT_SUPPORTED: &str = "Body not supported for default POST operations";

/// Custom POST/PUT handler owning request construction and response interpretation
///
/// Receives the resource, the encoded body and its content format; the returned
/// text becomes the resource's last event.
pub type MethodFunction =
    Arc<dyn Fn(&ResourceDescriptor, &[u8], ContentFormat) -> String + Send + Sync>;

/// Replaces the transport for action requests
pub type ActionSendFunction =
    Arc<dyn Fn(&CoapRequest) -> Result<Option<CoapResponse>> + Send + Sync>;

/// What happened to an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not sent: malformed key, unknown resource, unsupported method or failed translation
    Dropped(String),
    /// Rejected locally, recorded as a resource error
    Rejected(String),
    /// Sent and answered with a success code
    Sent(ResponseCode),
    /// Sent but failed: transport error, no response or error code
    Failed(String),
    /// Handled by a custom method function
    Custom(String),
}

/// A resource that can receive actions
#[derive(Clone)]
pub struct ActionTarget {
    pub resource: Arc<ResourceDescriptor>,
    /// Content format used when the action translator does not pin one
    pub action_format: ContentFormat,
    pub post_function: Option<MethodFunction>,
    pub put_function: Option<MethodFunction>,
}

impl ActionTarget {
    pub fn new(resource: Arc<ResourceDescriptor>) -> Self {
        Self {
            resource,
            action_format: ContentFormat::TextPlain,
            post_function: None,
            put_function: None,
        }
    }

    pub fn with_action_format(mut self, format: ContentFormat) -> Self {
        self.action_format = format;
        self
    }

    pub fn with_method_function(mut self, method: Method, function: MethodFunction) -> Self {
        match method {
            Method::Post => self.post_function = Some(function),
            Method::Put => self.put_function = Some(function),
            Method::Get => warn!(
                resource = %self.resource.uri(),
                "ignoring custom GET function for actions"
            ),
        }
        self
    }

    fn method_function(&self, method: Method) -> Option<&MethodFunction> {
        match method {
            Method::Post => self.post_function.as_ref(),
            Method::Put => self.put_function.as_ref(),
            Method::Get => None,
        }
    }
}

impl fmt::Debug for ActionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTarget")
            .field("resource", &self.resource.uri())
            .field("action_format", &self.action_format)
            .field("post_function", &self.post_function.is_some())
            .field("put_function", &self.put_function.is_some())
            .finish()
    }
}

/// Split an action key into method and resource path
///
/// Only POST and PUT are actions. The path is normalized like resource URIs.
pub fn parse_action_key(key: &str) -> Result<(Method, String)> {
    let (method, target) = key
        .trim()
        .split_once(char::is_whitespace)
        .ok_or_else(|| AdapterError::InvalidActionKey(key.to_string()))?;
    let target = target.trim();
    if target.is_empty() {
        return Err(AdapterError::InvalidActionKey(key.to_string()));
    }
    match Method::parse(method) {
        Some(method @ (Method::Post | Method::Put)) => Ok((method, target.to_string())),
        _ => Err(AdapterError::InvalidActionKey(key.to_string())),
    }
}

/// Routes twin actions to resources
pub struct ActionDispatcher {
    transport: Arc<dyn CoapTransport>,
    translators: Arc<TranslatorSet>,
    sender: Option<ActionSendFunction>,
    targets: HashMap<String, ActionTarget>,
    keys: HashMap<String, String>,
}

impl ActionDispatcher {
    pub fn new(
        transport: Arc<dyn CoapTransport>,
        translators: Arc<TranslatorSet>,
    ) -> Self {
        Self {
            transport,
            translators,
            sender: None,
            targets: HashMap::new(),
            keys: HashMap::new(),
        }
    }

    /// Send action requests through `sender` instead of the transport
    pub fn with_sender(mut self, sender: ActionSendFunction) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Make a resource addressable by its URI and by its key
    pub fn register(&mut self, target: ActionTarget) {
        let uri = target.resource.uri().to_string();
        self.keys
            .insert(target.resource.key().to_string(), uri.clone());
        self.targets.insert(uri, target);
    }

    /// Look up a target by URI (any form) or resource key
    pub fn target(&self, uri_or_key: &str) -> Option<&ActionTarget> {
        self.targets
            .get(&discovery::uri_path(uri_or_key))
            .or_else(|| {
                self.keys
                    .get(uri_or_key)
                    .and_then(|uri| self.targets.get(uri))
            })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Dispatch one action
    ///
    /// Nothing here is fatal: every failure is logged, recorded on the resource where
    /// one exists and reported through the returned outcome.
    pub fn dispatch(&self, action: &ActionIntent) -> DispatchOutcome {
        let (method, target_uri) = match parse_action_key(&action.key) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(action = %action.key, "dropping action: {}", e);
                return DispatchOutcome::Dropped(e.to_string());
            }
        };

        let Some(target) = self.target(&target_uri) else {
            let e = AdapterError::UnknownResource(target_uri);
            error!(action = %action.key, "dropping action: {}", e);
            return DispatchOutcome::Dropped(e.to_string());
        };
        let resource = &target.resource;

        if !resource.supports(method) {
            let e = AdapterError::UnsupportedMethod {
                method,
                uri: resource.uri().to_string(),
            };
            error!(action = %action.key, "dropping action: {}", e);
            return DispatchOutcome::Dropped(e.to_string());
        }

        let Some(encoded) = self
            .translators
            .translate_action(resource.key(), resource.uri(), action, target.action_format)
        else {
            warn!(action = %action.key, "dropping action: body translation failed");
            return DispatchOutcome::Dropped("action translation failed".to_string());
        };
        let format = encoded.content_format;
        let payload = encoded.payload;

        if let Some(function) = target.method_function(method) {
            debug!(resource = %resource.uri(), %method, "using custom request function");
            let message = function(resource, &payload, format);
            resource.set_last_event(message.clone());
            return DispatchOutcome::Custom(message);
        }

        match method {
            Method::Put if payload.is_empty() => {
                warn!(resource = %resource.uri(), "{}", PUT_BODY_REQUIRED);
                resource.record_error(PUT_BODY_REQUIRED);
                return DispatchOutcome::Rejected(PUT_BODY_REQUIRED.to_string());
            }
            Method::Post if !payload.is_empty() => {
                warn!(resource = %resource.uri(), "{}", POST_BODY_NOT_SUPPORTED);
                resource.record_error(POST_BODY_NOT_SUPPORTED);
                return DispatchOutcome::Rejected(POST_BODY_NOT_SUPPORTED.to_string());
            }
            _ => {}
        }

        let mut request = resource.request(method);
        if method == Method::Put {
            request = request.with_payload(payload, format);
        }

        let response = match &self.sender {
            Some(send) => send(&request),
            None => self.transport.send(&request),
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(resource = %resource.uri(), %method, "CoAP action failed: {}", e);
                resource.record_error(e.to_string());
                return DispatchOutcome::Failed(e.to_string());
            }
        };

        let code = response.as_ref().map(|r| r.code);
        match (SyncUpdate::from_response(response, UpdateSource::Action), code) {
            (SyncUpdate::Property { payload, .. }, Some(code)) => {
                let message = if payload.is_empty() {
                    format!("Response code: {}", code)
                } else {
                    String::from_utf8_lossy(&payload).into_owned()
                };
                info!(resource = %resource.uri(), %method, %code, "CoAP action completed");
                resource.set_last_event(message);
                DispatchOutcome::Sent(code)
            }
            (SyncUpdate::Error { message }, _) => {
                warn!(resource = %resource.uri(), %method, "{}", message);
                resource.record_error(message.clone());
                DispatchOutcome::Failed(message)
            }
            (update, _) => {
                debug!(resource = %resource.uri(), "unexpected action update {:?}", update);
                DispatchOutcome::Failed("unexpected response".to_string())
            }
        }
    }
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .field("custom_sender", &self.sender.is_some())
            .finish()
    }
}
