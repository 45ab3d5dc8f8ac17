//! Resource descriptor: one remote CoAP resource and its cached state
//!
//! The descriptor is shared between the scheduler (which mutates the cache), the
//! dispatcher and the adapter's delivery thread. Classified updates are pushed onto a
//! per-resource channel instead of calling listeners from the network thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coap_types::{CoapRequest, CoapResponse, ContentFormat, Method};
use crate::discovery::{self, DiscoveredResource, InterfaceKind};

/// Supported resource behaviours, selected once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Sensor,
    Actuator,
    Parameter,
    ReadOnly,
}

impl ResourceKind {
    /// `None` for interfaces the adapter does not handle
    pub fn from_interface(kind: InterfaceKind) -> Option<Self> {
        match kind {
            InterfaceKind::Sensor => Some(Self::Sensor),
            InterfaceKind::Actuator => Some(Self::Actuator),
            InterfaceKind::Parameter => Some(Self::Parameter),
            InterfaceKind::ReadOnly => Some(Self::ReadOnly),
            InterfaceKind::Unknown => None,
        }
    }

    /// Capability flags for this kind, narrowed by the configured method support
    pub fn capabilities(self, observable: bool, support: MethodSupport) -> Capabilities {
        let (post, put) = match self {
            Self::Sensor | Self::ReadOnly => (false, false),
            Self::Actuator => (true, true),
            Self::Parameter => (false, true),
        };
        Capabilities {
            observable,
            post: post && support.post,
            put: put && support.put,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sensor => "sensor",
            Self::Actuator => "actuator",
            Self::Parameter => "parameter",
            Self::ReadOnly => "read-only",
        };
        f.write_str(name)
    }
}

/// Which action methods the configuration allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodSupport {
    pub post: bool,
    pub put: bool,
}

impl Default for MethodSupport {
    fn default() -> Self {
        Self {
            post: true,
            put: true,
        }
    }
}

/// Orthogonal capability flags of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub observable: bool,
    pub post: bool,
    pub put: bool,
}

impl Capabilities {
    /// GET is always allowed
    pub fn supports(&self, method: Method) -> bool {
        match method {
            Method::Get => true,
            Method::Post => self.post,
            Method::Put => self.put,
        }
    }

    /// Whether any action method is available
    pub fn accepts_actions(&self) -> bool {
        self.post || self.put
    }
}

/// Active update mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Idle,
    Observe,
    Poll,
}

/// Where a response came from; only changes the error wording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Poll,
    Observe,
    Action,
}

/// Classified result pushed to the resource's outbound channel
#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    /// New payload to cache and translate into properties
    Property {
        payload: Vec<u8>,
        content_format: ContentFormat,
    },
    /// Null or failed response, or a locally rejected action
    Error { message: String },
    /// Outcome of an action
    Event { message: String },
}

impl SyncUpdate {
    /// Classify a response: missing → error, non-success → error, success → property
    pub fn from_response(response: Option<CoapResponse>, source: UpdateSource) -> Self {
        match response {
            None => Self::Error {
                message: match source {
                    UpdateSource::Observe => "Observed null CoAP response".to_string(),
                    UpdateSource::Poll | UpdateSource::Action => {
                        "CoAP request got null response".to_string()
                    }
                },
            },
            Some(response) if !response.is_success() => Self::Error {
                message: match source {
                    UpdateSource::Observe => {
                        format!("Observed CoAP response with code={}", response.code)
                    }
                    UpdateSource::Poll | UpdateSource::Action => {
                        format!("CoAP request failed with code={}", response.code)
                    }
                },
            },
            Some(response) => Self::Property {
                content_format: response.content_format.unwrap_or_default(),
                payload: response.payload,
            },
        }
    }
}

/// Consistent copy of a resource's cached state
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceSnapshot {
    pub last_payload: Vec<u8>,
    pub last_content_format: ContentFormat,
    pub last_error: Option<String>,
    pub last_event: Option<String>,
    pub sync_mode: SyncMode,
}

/// One remote resource
pub struct ResourceDescriptor {
    uri: String,
    key: String,
    resource_type: Option<String>,
    kind: ResourceKind,
    capabilities: Capabilities,
    preferred_format: ContentFormat,
    state: Mutex<ResourceSnapshot>,
    closed: AtomicBool,
    outbox: Mutex<Option<Sender<SyncUpdate>>>,
    inbox: Mutex<Option<Receiver<SyncUpdate>>>,
}

impl ResourceDescriptor {
    /// Create a descriptor; `uri` is reduced to its path
    pub fn new(
        uri: &str,
        resource_type: Option<String>,
        kind: ResourceKind,
        capabilities: Capabilities,
        preferred_format: ContentFormat,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let path = discovery::uri_path(uri);
        Self {
            key: discovery::resource_key(resource_type.as_deref(), &path),
            uri: path,
            resource_type,
            kind,
            capabilities,
            preferred_format,
            state: Mutex::new(ResourceSnapshot::default()),
            closed: AtomicBool::new(false),
            outbox: Mutex::new(Some(tx)),
            inbox: Mutex::new(Some(rx)),
        }
    }

    /// Build a descriptor from a discovery entry, negotiating its content format
    pub fn from_discovered(
        resource: &DiscoveredResource,
        preferred: ContentFormat,
        support: MethodSupport,
    ) -> Option<Self> {
        let kind = ResourceKind::from_interface(resource.interface_kind)?;
        Some(Self::new(
            &resource.uri,
            resource.resource_type.clone(),
            kind,
            kind.capabilities(resource.observable, support),
            resource.negotiate_content_format(preferred),
        ))
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.resource_type.as_deref()
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn preferred_format(&self) -> ContentFormat {
        self.preferred_format
    }

    pub fn supports(&self, method: Method) -> bool {
        self.capabilities.supports(method)
    }

    /// Copy of the cached state, taken under one lock
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.state.lock().clone()
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.state.lock().sync_mode
    }

    pub(crate) fn set_sync_mode(&self, mode: SyncMode) {
        self.state.lock().sync_mode = mode;
    }

    /// Base request for `method`: resource path, Accept set to the negotiated format, confirmable
    pub fn request(&self, method: Method) -> CoapRequest {
        CoapRequest::new(method, self.uri.clone()).with_accept(self.preferred_format)
    }

    pub fn get_request(&self) -> CoapRequest {
        self.request(Method::Get)
    }

    /// Update the cache and forward the update
    ///
    /// Returns `false` without touching anything once the descriptor is closed.
    pub fn apply(&self, update: SyncUpdate) -> bool {
        if self.is_closed() {
            debug!(resource = %self.uri, "ignoring update after teardown");
            return false;
        }

        {
            let mut state = self.state.lock();
            match &update {
                SyncUpdate::Property {
                    payload,
                    content_format,
                } => {
                    state.last_payload = payload.clone();
                    state.last_content_format = *content_format;
                    state.last_error = None;
                }
                SyncUpdate::Error { message } => state.last_error = Some(message.clone()),
                SyncUpdate::Event { message } => state.last_event = Some(message.clone()),
            }
        }

        if let Some(tx) = self.outbox.lock().as_ref() {
            // Receiver gone means nobody is delivering; the cache is still current
            let _ = tx.send(update);
        }
        true
    }

    /// Classify a response and apply it
    pub fn record_response(&self, response: Option<CoapResponse>, source: UpdateSource) -> bool {
        self.apply(SyncUpdate::from_response(response, source))
    }

    pub fn record_error(&self, message: impl Into<String>) -> bool {
        self.apply(SyncUpdate::Error {
            message: message.into(),
        })
    }

    pub fn set_last_event(&self, message: impl Into<String>) -> bool {
        self.apply(SyncUpdate::Event {
            message: message.into(),
        })
    }

    /// Take the receiving end of the update channel; only the first call gets it
    pub fn updates(&self) -> Option<Receiver<SyncUpdate>> {
        self.inbox.lock().take()
    }

    /// Refuse further updates and close the channel
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.outbox.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("uri", &self.uri)
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .field("preferred_format", &self.preferred_format)
            .field("closed", &self.is_closed())
            .finish()
    }
}
