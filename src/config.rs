//! Adapter configuration
//!
//! [`AdapterSettings`] is the plain-data part and can be loaded from YAML.
//! [`AdapterConfigurationBuilder`] adds translators, manual resources and custom
//! request functions, and validates everything before any network activity.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coap_types::{ContentFormat, Method};
use crate::discovery::{self, DiscoveryFunction};
use crate::dispatcher::{ActionSendFunction, MethodFunction};
use crate::error::{AdapterError, Result};
use crate::resource::{Capabilities, MethodSupport, ResourceDescriptor, ResourceKind};
use crate::scheduler::GetFunction;
use crate::translation::{ActionTranslator, EventTranslator, PropertyTranslator, TranslatorSet};

/// Default CoAP port
pub const DEFAULT_COAP_PORT: u16 = 5683;

/// Which translated results of a resource reach the event sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationMode {
    Property,
    Event,
    #[default]
    All,
    None,
}

impl NotificationMode {
    pub fn properties(self) -> bool {
        matches!(self, Self::Property | Self::All)
    }

    pub fn events(self) -> bool {
        matches!(self, Self::Event | Self::All)
    }
}

/// A resource configured by hand instead of discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub uri: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    pub kind: ResourceKind,
    #[serde(default)]
    pub observable: bool,
    /// Content format to request; the adapter's preferred format when absent
    #[serde(default)]
    pub content_format: Option<u16>,
    /// Overrides the adapter-wide method support
    #[serde(default)]
    pub method_support: Option<MethodSupport>,
}

impl ResourceSpec {
    pub fn new(uri: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            uri: uri.into(),
            resource_type: None,
            kind,
            observable: false,
            content_format: None,
            method_support: None,
        }
    }

    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self
    }

    pub fn observable(mut self, observable: bool) -> Self {
        self.observable = observable;
        self
    }

    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.content_format = Some(format.as_u16());
        self
    }

    pub fn with_method_support(mut self, support: MethodSupport) -> Self {
        self.method_support = Some(support);
        self
    }

    pub fn path(&self) -> String {
        discovery::uri_path(&self.uri)
    }

    pub fn key(&self) -> String {
        discovery::resource_key(self.resource_type.as_deref(), &self.uri)
    }

    /// Build the descriptor for this resource
    pub fn descriptor(&self, settings: &AdapterSettings) -> ResourceDescriptor {
        let support = self.method_support.unwrap_or(settings.method_support);
        let format = self
            .content_format
            .map(ContentFormat::from_u16)
            .unwrap_or_else(|| settings.preferred_format());
        ResourceDescriptor::new(
            &self.uri,
            self.resource_type.clone(),
            self.kind,
            self.kind.capabilities(self.observable, support),
            format,
        )
    }
}

/// Serializable adapter settings
///
/// Per-resource maps are keyed by resource key or URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    pub host: String,
    pub port: u16,
    /// Content-Format ID requested from resources when they advertise it
    pub preferred_content_format: u16,
    pub observability: bool,
    pub auto_update: bool,
    pub auto_update_interval_ms: u64,
    pub resource_discovery: bool,
    pub ignored_resources: Vec<String>,
    /// Initial ACK timeout of confirmable requests
    pub request_timeout_ms: u64,
    pub max_retransmit: u32,
    pub method_support: MethodSupport,

    pub default_event_type: String,
    pub event_types: BTreeMap<String, String>,

    pub default_actuator_action_type: String,
    pub default_post_action_type: String,
    pub default_put_action_type: String,
    pub action_types: BTreeMap<String, String>,

    pub default_actuator_action_content_type: String,
    pub default_post_action_content_type: String,
    pub default_put_action_content_type: String,
    pub action_content_types: BTreeMap<String, String>,

    pub notification_mode: NotificationMode,
    pub notification_modes: BTreeMap<String, NotificationMode>,

    pub resources: Vec<ResourceSpec>,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        let text_plain = ContentFormat::TextPlain.mime_type();
        Self {
            host: String::new(),
            port: DEFAULT_COAP_PORT,
            preferred_content_format: ContentFormat::TextPlain.as_u16(),
            observability: true,
            auto_update: true,
            auto_update_interval_ms: 5000,
            resource_discovery: true,
            ignored_resources: Vec::new(),
            request_timeout_ms: 2000,
            max_retransmit: 4,
            method_support: MethodSupport::default(),
            default_event_type: "event".to_string(),
            event_types: BTreeMap::new(),
            default_actuator_action_type: "action".to_string(),
            default_post_action_type: "toggle".to_string(),
            default_put_action_type: "parameter".to_string(),
            action_types: BTreeMap::new(),
            default_actuator_action_content_type: text_plain.clone(),
            default_post_action_content_type: text_plain.clone(),
            default_put_action_content_type: text_plain,
            action_content_types: BTreeMap::new(),
            notification_mode: NotificationMode::All,
            notification_modes: BTreeMap::new(),
            resources: Vec::new(),
        }
    }
}

impl AdapterSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading adapter settings");
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn preferred_format(&self) -> ContentFormat {
        ContentFormat::from_u16(self.preferred_content_format)
    }

    pub fn auto_update_interval(&self) -> Duration {
        Duration::from_millis(self.auto_update_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Whether discovery must skip this resource
    pub fn is_ignored(&self, uri: &str, key: &str) -> bool {
        let path = discovery::uri_path(uri);
        self.ignored_resources
            .iter()
            .any(|ignored| ignored == key || discovery::uri_path(ignored) == path)
    }

    pub fn event_type(&self, key: &str, uri: &str) -> &str {
        lookup(&self.event_types, key, uri).unwrap_or(self.default_event_type.as_str())
    }

    /// Action type: actuator default for POST+PUT resources, otherwise the POST- or PUT-only default
    pub fn action_type(&self, key: &str, uri: &str, capabilities: Capabilities) -> &str {
        lookup(&self.action_types, key, uri).unwrap_or(match (capabilities.post, capabilities.put) {
            (true, false) => self.default_post_action_type.as_str(),
            (false, true) => self.default_put_action_type.as_str(),
            _ => self.default_actuator_action_type.as_str(),
        })
    }

    pub fn action_content_type(&self, key: &str, uri: &str, capabilities: Capabilities) -> &str {
        lookup(&self.action_content_types, key, uri).unwrap_or(
            match (capabilities.post, capabilities.put) {
                (true, false) => self.default_post_action_content_type.as_str(),
                (false, true) => self.default_put_action_content_type.as_str(),
                _ => self.default_actuator_action_content_type.as_str(),
            },
        )
    }

    pub fn notification_mode(&self, key: &str, uri: &str) -> NotificationMode {
        self.notification_modes
            .get(key)
            .or_else(|| self.notification_modes.get(uri))
            .copied()
            .unwrap_or(self.notification_mode)
    }
}

fn lookup<'a>(map: &'a BTreeMap<String, String>, key: &str, uri: &str) -> Option<&'a str> {
    map.get(key).or_else(|| map.get(uri)).map(String::as_str)
}

/// Validated adapter configuration
pub struct AdapterConfiguration {
    settings: AdapterSettings,
    translators: Arc<TranslatorSet>,
    discovery_function: Option<DiscoveryFunction>,
    get_function: Option<GetFunction>,
    action_sender: Option<ActionSendFunction>,
    method_functions: HashMap<(Method, String), MethodFunction>,
}

impl AdapterConfiguration {
    pub fn builder(host: impl Into<String>, port: u16) -> AdapterConfigurationBuilder {
        AdapterConfigurationBuilder::from_settings(AdapterSettings::new(host, port))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<AdapterConfigurationBuilder> {
        Ok(AdapterConfigurationBuilder::from_settings(
            AdapterSettings::from_yaml_file(path)?,
        ))
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    pub fn translators(&self) -> &Arc<TranslatorSet> {
        &self.translators
    }

    pub fn discovery_function(&self) -> Option<&DiscoveryFunction> {
        self.discovery_function.as_ref()
    }

    pub fn get_function(&self) -> Option<&GetFunction> {
        self.get_function.as_ref()
    }

    pub fn action_sender(&self) -> Option<&ActionSendFunction> {
        self.action_sender.as_ref()
    }

    /// Custom POST/PUT function of a resource, by key then URI
    pub fn method_function(&self, method: Method, key: &str, uri: &str) -> Option<&MethodFunction> {
        self.method_functions
            .get(&(method, key.to_string()))
            .or_else(|| self.method_functions.get(&(method, uri.to_string())))
    }
}

impl fmt::Debug for AdapterConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterConfiguration")
            .field("settings", &self.settings)
            .field("translators", &self.translators)
            .field("discovery_function", &self.discovery_function.is_some())
            .field("get_function", &self.get_function.is_some())
            .field("action_sender", &self.action_sender.is_some())
            .field("method_functions", &self.method_functions.len())
            .finish()
    }
}

/// Builder for [`AdapterConfiguration`]
pub struct AdapterConfigurationBuilder {
    settings: AdapterSettings,
    translators: TranslatorSet,
    discovery_function: Option<DiscoveryFunction>,
    get_function: Option<GetFunction>,
    action_sender: Option<ActionSendFunction>,
    method_functions: HashMap<(Method, String), MethodFunction>,
}

impl AdapterConfigurationBuilder {
    pub fn from_settings(settings: AdapterSettings) -> Self {
        Self {
            settings,
            translators: TranslatorSet::new(),
            discovery_function: None,
            get_function: None,
            action_sender: None,
            method_functions: HashMap::new(),
        }
    }

    pub fn preferred_content_format(mut self, format: ContentFormat) -> Self {
        self.settings.preferred_content_format = format.as_u16();
        self
    }

    pub fn observability(mut self, enabled: bool) -> Self {
        self.settings.observability = enabled;
        self
    }

    pub fn auto_update(mut self, enabled: bool, interval: Duration) -> Self {
        self.settings.auto_update = enabled;
        self.settings.auto_update_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn resource_discovery(mut self, enabled: bool) -> Self {
        self.settings.resource_discovery = enabled;
        self
    }

    pub fn ignore_resource(mut self, resource: impl Into<String>) -> Self {
        self.settings.ignored_resources.push(resource.into());
        self
    }

    pub fn retransmission(mut self, timeout: Duration, max_retransmit: u32) -> Self {
        self.settings.request_timeout_ms = timeout.as_millis() as u64;
        self.settings.max_retransmit = max_retransmit;
        self
    }

    pub fn method_support(mut self, support: MethodSupport) -> Self {
        self.settings.method_support = support;
        self
    }

    pub fn notification_mode(mut self, mode: NotificationMode) -> Self {
        self.settings.notification_mode = mode;
        self
    }

    pub fn resource_notification_mode(mut self, resource: impl Into<String>, mode: NotificationMode) -> Self {
        self.settings.notification_modes.insert(resource.into(), mode);
        self
    }

    pub fn event_type(mut self, resource: impl Into<String>, event_type: impl Into<String>) -> Self {
        self.settings
            .event_types
            .insert(resource.into(), event_type.into());
        self
    }

    pub fn action_type(mut self, resource: impl Into<String>, action_type: impl Into<String>) -> Self {
        self.settings
            .action_types
            .insert(resource.into(), action_type.into());
        self
    }

    pub fn action_content_type(mut self, resource: impl Into<String>, content_type: impl Into<String>) -> Self {
        self.settings
            .action_content_types
            .insert(resource.into(), content_type.into());
        self
    }

    pub fn add_resource(mut self, resource: ResourceSpec) -> Self {
        self.settings.resources.push(resource);
        self
    }

    pub fn default_property_translator(mut self, translator: impl PropertyTranslator + 'static) -> Self {
        self.translators.set_default_property(translator);
        self
    }

    pub fn default_event_translator(mut self, translator: impl EventTranslator + 'static) -> Self {
        self.translators.set_default_event(translator);
        self
    }

    pub fn default_action_translator(mut self, translator: impl ActionTranslator + 'static) -> Self {
        self.translators.set_default_action(translator);
        self
    }

    /// Use the built-in translators wherever no default is set
    pub fn default_translators(mut self) -> Self {
        self.translators.fill_defaults();
        self
    }

    pub fn property_translator(
        mut self,
        resource: impl Into<String>,
        translator: impl PropertyTranslator + 'static,
    ) -> Self {
        self.translators.add_property_override(resource, translator);
        self
    }

    pub fn event_translator(
        mut self,
        resource: impl Into<String>,
        translator: impl EventTranslator + 'static,
    ) -> Self {
        self.translators.add_event_override(resource, translator);
        self
    }

    pub fn action_translator(
        mut self,
        resource: impl Into<String>,
        translator: impl ActionTranslator + 'static,
    ) -> Self {
        self.translators.add_action_override(resource, translator);
        self
    }

    pub fn discovery_function(mut self, function: DiscoveryFunction) -> Self {
        self.discovery_function = Some(function);
        self
    }

    pub fn get_function(mut self, function: GetFunction) -> Self {
        self.get_function = Some(function);
        self
    }

    pub fn action_sender(mut self, function: ActionSendFunction) -> Self {
        self.action_sender = Some(function);
        self
    }

    /// Custom POST or PUT function for one resource
    pub fn method_function(
        mut self,
        resource: impl Into<String>,
        method: Method,
        function: MethodFunction,
    ) -> Self {
        self.method_functions.insert((method, resource.into()), function);
        self
    }

    /// Validate and build the configuration
    pub fn build(mut self) -> Result<AdapterConfiguration> {
        let settings = &self.settings;
        let mut errors = Vec::new();

        if settings.host.trim().is_empty() {
            errors.push("server host may not be empty".to_string());
        }
        if settings.port == 0 {
            errors.push("server port may not be 0".to_string());
        }
        if settings.auto_update && settings.auto_update_interval_ms == 0 {
            errors.push("auto update interval must be greater than zero".to_string());
        }
        if settings.request_timeout_ms == 0 {
            errors.push("request timeout must be greater than zero".to_string());
        }
        if !settings.resource_discovery && settings.resources.is_empty() {
            errors.push("resource discovery is disabled and no resource is configured".to_string());
        }
        if let Some((method, resource)) = self.method_functions.keys().find(|(m, _)| *m == Method::Get) {
            errors.push(format!("custom {} function for {} is not an action", method, resource));
        }

        if settings.resource_discovery {
            self.translators.fill_defaults();
        }

        let mut seen = HashSet::new();
        for resource in &settings.resources {
            let path = resource.path();
            let key = resource.key();
            if !seen.insert(path.clone()) {
                errors.push(format!("resource {} is configured twice", path));
            }
            if !self.translators.has_property_translator(&key, &path) {
                errors.push(format!("resource {} has no property translator", path));
            }
            let capabilities = resource.kind.capabilities(
                resource.observable,
                resource.method_support.unwrap_or(settings.method_support),
            );
            if capabilities.accepts_actions() && !self.translators.has_action_translator(&key, &path) {
                errors.push(format!("resource {} has no action translator", path));
            }
        }

        if !errors.is_empty() {
            return Err(AdapterError::Configuration(errors.join("; ")));
        }

        Ok(AdapterConfiguration {
            settings: self.settings,
            translators: Arc::new(self.translators),
            discovery_function: self.discovery_function,
            get_function: self.get_function,
            action_sender: self.action_sender,
            method_functions: self.method_functions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::translation::{PayloadPropertyTranslator, EncodingActionTranslator};

    const YAML: &str = r#"
host: 192.168.1.20
port: 5683
preferred_content_format: 50
auto_update_interval_ms: 1000
resource_discovery: false
ignored_resources: ["/debug"]
event_types:
  temp.sensortemp: overheat
notification_modes:
  /light: property
resources:
  - uri: /sensor/temp
    resource_type: temp
    kind: sensor
    observable: true
  - uri: /light
    kind: actuator
    method_support: { post: true, put: false }
"#;

    #[test]
    fn test_settings_defaults() {
        let settings = AdapterSettings::default();
        assert_eq!(settings.port, 5683);
        assert_eq!(settings.preferred_format(), ContentFormat::TextPlain);
        assert!(settings.observability && settings.auto_update && settings.resource_discovery);
        assert_eq!(settings.auto_update_interval(), Duration::from_millis(5000));
        assert_eq!(settings.max_retransmit, 4);
        assert_eq!(settings.default_event_type, "event");
        assert_eq!(settings.default_actuator_action_type, "action");
        assert_eq!(settings.default_post_action_type, "toggle");
        assert_eq!(settings.default_put_action_type, "parameter");
        assert_eq!(settings.default_put_action_content_type, "text/plain");
        assert_eq!(settings.notification_mode, NotificationMode::All);
    }

    #[test]
    fn test_settings_from_yaml() {
        let settings = AdapterSettings::from_yaml_str(YAML).unwrap();
        assert_eq!(settings.host, "192.168.1.20");
        assert_eq!(settings.preferred_format(), ContentFormat::Json);
        assert!(!settings.resource_discovery);
        // unspecified fields keep their defaults
        assert!(settings.observability);
        assert_eq!(settings.resources.len(), 2);

        let temp = &settings.resources[0];
        assert_eq!(temp.kind, ResourceKind::Sensor);
        assert_eq!(temp.key(), "temp.sensortemp");
        assert_eq!(settings.event_type(&temp.key(), &temp.path()), "overheat");

        let light = &settings.resources[1];
        assert_eq!(
            light.method_support,
            Some(MethodSupport {
                post: true,
                put: false
            })
        );
        assert_eq!(settings.notification_mode("light", "/light"), NotificationMode::Property);
        assert!(settings.is_ignored("coap://192.168.1.20/debug", "debug"));
        assert!(!settings.is_ignored("/light", "light"));
    }

    #[test]
    fn test_settings_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();

        let builder = AdapterConfiguration::from_yaml_file(file.path()).unwrap();
        let config = builder.default_translators().build().unwrap();
        assert_eq!(config.settings().resources.len(), 2);

        assert!(matches!(
            AdapterSettings::from_yaml_file("/nonexistent/adapter.yaml"),
            Err(AdapterError::Io(_))
        ));
        assert!(matches!(
            AdapterSettings::from_yaml_str("port: [1, 2]"),
            Err(AdapterError::Yaml(_))
        ));
    }

    #[test]
    fn test_action_type_resolution() {
        let settings = AdapterSettings::default();
        let both = ResourceKind::Actuator.capabilities(false, MethodSupport::default());
        let put_only = ResourceKind::Parameter.capabilities(false, MethodSupport::default());
        let post_only = ResourceKind::Actuator.capabilities(
            false,
            MethodSupport {
                post: true,
                put: false,
            },
        );
        assert_eq!(settings.action_type("light", "/light", both), "action");
        assert_eq!(settings.action_type("heater", "/heater", put_only), "parameter");
        assert_eq!(settings.action_type("bell", "/bell", post_only), "toggle");
        assert_eq!(settings.action_content_type("heater", "/heater", put_only), "text/plain");
    }

    #[test]
    fn test_discovery_fills_default_translators() {
        let config = AdapterConfiguration::builder("127.0.0.1", 5683).build().unwrap();
        assert!(config.translators().has_property_translator("any", "/any"));
        assert!(config.translators().has_event_translator("any", "/any"));
        assert!(config.translators().has_action_translator("any", "/any"));
    }

    #[test]
    fn test_invalid_server_rejected() {
        let err = AdapterConfiguration::builder("  ", 0).build().unwrap_err();
        let AdapterError::Configuration(message) = err else {
            panic!("expected configuration error, got {:?}", err);
        };
        assert!(message.contains("host"));
        assert!(message.contains("port"));
    }

    #[test]
    fn test_no_resources_without_discovery_rejected() {
        assert!(matches!(
            AdapterConfiguration::builder("127.0.0.1", 5683)
                .resource_discovery(false)
                .default_translators()
                .build(),
            Err(AdapterError::Configuration(_))
        ));
        assert!(matches!(
            AdapterConfiguration::builder("127.0.0.1", 5683)
                .auto_update(true, Duration::ZERO)
                .build(),
            Err(AdapterError::Configuration(_))
        ));
    }

    #[test]
    fn test_manual_resources_need_translators() {
        let light = ResourceSpec::new("/light", ResourceKind::Actuator);

        // discovery disabled: defaults are not filled in
        let missing = AdapterConfiguration::builder("127.0.0.1", 5683)
            .resource_discovery(false)
            .add_resource(light.clone())
            .build();
        let Err(AdapterError::Configuration(message)) = missing else {
            panic!("expected configuration error");
        };
        assert!(message.contains("no property translator"));
        assert!(message.contains("no action translator"));

        let config = AdapterConfiguration::builder("127.0.0.1", 5683)
            .resource_discovery(false)
            .add_resource(light)
            .property_translator("light", PayloadPropertyTranslator)
            .action_translator("/light", EncodingActionTranslator::new(ContentFormat::Json))
            .build()
            .unwrap();
        assert!(config.translators().has_property_translator("light", "/light"));

        // sensors need no action translator
        assert!(
            AdapterConfiguration::builder("127.0.0.1", 5683)
                .resource_discovery(false)
                .add_resource(ResourceSpec::new("/temp", ResourceKind::Sensor))
                .default_property_translator(PayloadPropertyTranslator)
                .build()
                .is_ok()
        );
    }

    #[test]
    fn test_duplicate_manual_resource_rejected() {
        let result = AdapterConfiguration::builder("127.0.0.1", 5683)
            .add_resource(ResourceSpec::new("/light", ResourceKind::Actuator))
            .add_resource(ResourceSpec::new("coap://127.0.0.1/light", ResourceKind::Actuator))
            .build();
        assert!(matches!(result, Err(AdapterError::Configuration(_))));
    }

    #[test]
    fn test_manual_descriptor() {
        let settings = AdapterSettings::new("127.0.0.1", 5683);
        let spec = ResourceSpec::new("/heater", ResourceKind::Parameter)
            .with_resource_type("heater")
            .observable(true)
            .with_content_format(ContentFormat::Cbor);
        let descriptor = spec.descriptor(&settings);
        assert_eq!(descriptor.key(), "heater.heater");
        assert_eq!(descriptor.preferred_format(), ContentFormat::Cbor);
        assert!(descriptor.supports(Method::Put));
        assert!(!descriptor.supports(Method::Post));
        assert!(descriptor.capabilities().observable);
    }
}
