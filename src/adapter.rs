//! CoAP physical adapter
//!
//! Ties discovery, per-resource synchronization, translation and action dispatch
//! together and reports the result to an [`EventSink`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::coap_types::{ContentFormat, Method};
use crate::config::{AdapterConfiguration, NotificationMode};
use crate::discovery;
use crate::dispatcher::{ActionDispatcher, ActionTarget, DispatchOutcome};
use crate::error::{AdapterError, Result};
use crate::resource::{ResourceDescriptor, SyncMode, SyncUpdate};
use crate::scheduler::SyncScheduler;
use crate::transport::{CoapTransport, UdpTransport};
use crate::translation::{ActionIntent, EventNotification, PropertyEvent, TranslatorSet};

/// Receiver of everything the adapter produces
pub trait EventSink: Send + Sync {
    fn publish_property(&self, event: PropertyEvent);

    fn publish_event(&self, event: EventNotification);

    /// Called once the adapter has started with at least one resource
    fn bound(&self, _description: &PhysicalAssetDescription) {}

    fn unbound(&self, _reason: &str) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadProperty {
    pub key: String,
    pub initial_value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadEvent {
    pub key: String,
    pub event_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadAction {
    /// `<METHOD> <uri>`, the key incoming actions must use
    pub key: String,
    pub action_type: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PadRelationship {
    pub resource: String,
    /// `observation`, `polling` or `none`
    pub mechanism: String,
}

/// What the adapter exposes to the digital twin
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhysicalAssetDescription {
    pub properties: Vec<PadProperty>,
    pub events: Vec<PadEvent>,
    pub actions: Vec<PadAction>,
    pub relationships: Vec<PadRelationship>,
}

impl PhysicalAssetDescription {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn action(&self, key: &str) -> Option<&PadAction> {
        self.actions.iter().find(|a| a.key == key)
    }
}

/// Threads and state owned by a started adapter
#[derive(Default)]
struct Workers {
    resources: Vec<Arc<ResourceDescriptor>>,
    schedulers: Vec<SyncScheduler>,
    pumps: Vec<JoinHandle<()>>,
}

impl Workers {
    fn shutdown(self) {
        for scheduler in &self.schedulers {
            scheduler.stop();
        }
        for resource in &self.resources {
            resource.close();
        }
        for pump in self.pumps {
            if pump.join().is_err() {
                error!("update delivery thread panicked");
            }
        }
    }
}

struct Running {
    workers: Workers,
    dispatcher: Arc<ActionDispatcher>,
    description: PhysicalAssetDescription,
}

/// Bridges one CoAP server to a digital twin
pub struct CoapPhysicalAdapter {
    id: String,
    config: AdapterConfiguration,
    transport: Arc<dyn CoapTransport>,
    sink: Arc<dyn EventSink>,
    state: Mutex<Option<Running>>,
    /// Held by the one `start` call in progress; `state` stays unlocked meanwhile
    starting: AtomicBool,
}

/// Clears the start claim when `start` returns
struct StartClaim<'a>(&'a AtomicBool);

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CoapPhysicalAdapter {
    /// Create an adapter talking UDP to the configured server
    pub fn new(
        id: impl Into<String>,
        config: AdapterConfiguration,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let settings = config.settings();
        let transport = UdpTransport::connect(&settings.host, settings.port)?
            .with_retransmission(settings.request_timeout(), settings.max_retransmit);
        Ok(Self::with_transport(id, config, Arc::new(transport), sink))
    }

    pub fn with_transport(
        id: impl Into<String>,
        config: AdapterConfiguration,
        transport: Arc<dyn CoapTransport>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            transport,
            sink,
            state: Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &AdapterConfiguration {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn resources(&self) -> Vec<Arc<ResourceDescriptor>> {
        self.state
            .lock()
            .as_ref()
            .map(|running| running.workers.resources.clone())
            .unwrap_or_default()
    }

    /// Look up a running resource by URI (any form) or key
    pub fn resource(&self, uri_or_key: &str) -> Option<Arc<ResourceDescriptor>> {
        let path = discovery::uri_path(uri_or_key);
        self.state.lock().as_ref().and_then(|running| {
            running
                .workers
                .resources
                .iter()
                .find(|r| r.uri() == path || r.key() == uri_or_key)
                .cloned()
        })
    }

    pub fn description(&self) -> Option<PhysicalAssetDescription> {
        self.state
            .lock()
            .as_ref()
            .map(|running| running.description.clone())
    }

    /// Discover resources, start synchronizing them and bind to the twin
    ///
    /// Discovery runs without holding the adapter state, so queries and actions
    /// answer (as not running) while it is in progress.
    pub fn start(&self) -> Result<PhysicalAssetDescription> {
        if self
            .starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AdapterError::Configuration(format!(
                "adapter {} is already starting",
                self.id
            )));
        }
        let _claim = StartClaim(&self.starting);
        if self.is_running() {
            return Err(AdapterError::Configuration(format!(
                "adapter {} is already started",
                self.id
            )));
        }

        let resources = self.collect_resources();
        if resources.is_empty() {
            warn!(adapter = %self.id, "no CoAP resources available");
            self.sink.unbound("no CoAP resources available");
            return Err(AdapterError::NoResources);
        }

        let mut workers = Workers::default();
        let mut dispatcher = ActionDispatcher::new(
            Arc::clone(&self.transport),
            Arc::clone(self.config.translators()),
        );
        if let Some(sender) = self.config.action_sender() {
            dispatcher = dispatcher.with_sender(Arc::clone(sender));
        }

        for resource in resources {
            let resource = Arc::new(resource);
            workers.resources.push(Arc::clone(&resource));
            match self.spawn_pump(&resource) {
                Ok(pump) => workers.pumps.push(pump),
                Err(e) => {
                    error!(resource = %resource.uri(), "cannot start update delivery: {}", e);
                    workers.shutdown();
                    return Err(e);
                }
            }
            workers.schedulers.push(self.start_sync(&resource));
            if resource.capabilities().accepts_actions() {
                dispatcher.register(self.action_target(&resource));
            }
        }

        let running = Running {
            description: self.describe(&workers.resources),
            dispatcher: Arc::new(dispatcher),
            workers,
        };
        info!(
            adapter = %self.id,
            resources = running.workers.resources.len(),
            actions = running.dispatcher.len(),
            "CoAP physical adapter started"
        );
        let description = running.description.clone();
        *self.state.lock() = Some(running);
        self.sink.bound(&description);
        Ok(description)
    }

    /// Stop every resource and wait for pending deliveries
    pub fn stop(&self) {
        let Some(running) = self.state.lock().take() else {
            return;
        };
        running.workers.shutdown();
        info!(adapter = %self.id, "CoAP physical adapter stopped");
    }

    /// Forward a twin action to its resource
    pub fn on_incoming_action(&self, action: &ActionIntent) -> DispatchOutcome {
        let dispatcher = self
            .state
            .lock()
            .as_ref()
            .map(|running| Arc::clone(&running.dispatcher));
        match dispatcher {
            Some(dispatcher) => dispatcher.dispatch(action),
            None => {
                warn!(adapter = %self.id, action = %action.key, "dropping action: adapter not running");
                DispatchOutcome::Dropped("adapter not running".to_string())
            }
        }
    }

    /// Manual resources first, then discovered ones not configured by hand
    fn collect_resources(&self) -> Vec<ResourceDescriptor> {
        let settings = self.config.settings();
        let mut resources: Vec<_> = settings
            .resources
            .iter()
            .map(|spec| spec.descriptor(settings))
            .collect();
        if !settings.resource_discovery {
            return resources;
        }

        let discovered = match self.config.discovery_function() {
            Some(discover) => discover(&*self.transport),
            None => discovery::discover(&*self.transport),
        };
        let discovered = match discovered {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!(adapter = %self.id, "resource discovery failed: {}", e);
                return resources;
            }
        };

        let mut known: HashSet<String> = resources.iter().map(|r| r.uri().to_string()).collect();
        for entry in &discovered {
            let key = entry.resource_key();
            if settings.is_ignored(&entry.uri, &key) {
                debug!(resource = %entry.uri, "ignoring discovered resource");
                continue;
            }
            let Some(resource) = ResourceDescriptor::from_discovered(
                entry,
                settings.preferred_format(),
                settings.method_support,
            ) else {
                debug!(resource = %entry.uri, interface = %entry.interface_kind, "unsupported interface");
                continue;
            };
            if known.insert(resource.uri().to_string()) {
                resources.push(resource);
            }
        }
        info!(
            adapter = %self.id,
            discovered = discovered.len(),
            resources = resources.len(),
            "CoAP resource discovery completed"
        );
        resources
    }

    fn spawn_pump(&self, resource: &Arc<ResourceDescriptor>) -> Result<JoinHandle<()>> {
        let Some(updates) = resource.updates() else {
            return Err(AdapterError::Configuration(format!(
                "update channel of {} already taken",
                resource.uri()
            )));
        };
        let pump = UpdatePump {
            key: resource.key().to_string(),
            uri: resource.uri().to_string(),
            mode: self
                .config
                .settings()
                .notification_mode(resource.key(), resource.uri()),
            translators: Arc::clone(self.config.translators()),
            sink: Arc::clone(&self.sink),
        };
        let handle = thread::Builder::new()
            .name(format!("coap-deliver{}", resource.uri()))
            .spawn(move || pump.run(updates))?;
        Ok(handle)
    }

    /// Observe when possible, poll otherwise
    fn start_sync(&self, resource: &Arc<ResourceDescriptor>) -> SyncScheduler {
        let settings = self.config.settings();
        let mut scheduler = SyncScheduler::new(Arc::clone(resource), Arc::clone(&self.transport));
        if let Some(get) = self.config.get_function() {
            scheduler = scheduler.with_get_function(Arc::clone(get));
        }

        if settings.observability && resource.capabilities().observable {
            if scheduler.start_observing().is_ok() {
                return scheduler;
            }
            if settings.auto_update {
                info!(resource = %resource.uri(), "falling back to polling");
            }
        }
        if settings.auto_update {
            if let Err(e) = scheduler.start_auto_update(settings.auto_update_interval()) {
                warn!(resource = %resource.uri(), "cannot start polling: {}", e);
            }
        }
        scheduler
    }

    fn action_target(&self, resource: &Arc<ResourceDescriptor>) -> ActionTarget {
        let settings = self.config.settings();
        let content_type =
            settings.action_content_type(resource.key(), resource.uri(), resource.capabilities());
        let format = ContentFormat::from_mime_type(content_type).unwrap_or_else(|| {
            warn!(resource = %resource.uri(), content_type, "unknown action content type, using text/plain");
            ContentFormat::TextPlain
        });

        let mut target = ActionTarget::new(Arc::clone(resource)).with_action_format(format);
        for method in [Method::Post, Method::Put] {
            if let Some(function) =
                self.config
                    .method_function(method, resource.key(), resource.uri())
            {
                target = target.with_method_function(method, Arc::clone(function));
            }
        }
        target
    }

    fn describe(&self, resources: &[Arc<ResourceDescriptor>]) -> PhysicalAssetDescription {
        let settings = self.config.settings();
        let mut description = PhysicalAssetDescription::default();

        for resource in resources {
            let (key, uri, capabilities) = (resource.key(), resource.uri(), resource.capabilities());
            description.properties.push(PadProperty {
                key: key.to_string(),
                initial_value: Value::from(0.0),
            });
            description.events.push(PadEvent {
                key: key.to_string(),
                event_type: settings.event_type(key, uri).to_string(),
            });
            for method in [Method::Post, Method::Put] {
                if capabilities.supports(method) {
                    description.actions.push(PadAction {
                        key: format!("{} {}", method, uri),
                        action_type: settings.action_type(key, uri, capabilities).to_string(),
                        content_type: settings
                            .action_content_type(key, uri, capabilities)
                            .to_string(),
                    });
                }
            }
            let mechanism = match resource.sync_mode() {
                SyncMode::Observe => "observation",
                SyncMode::Poll => "polling",
                SyncMode::Idle => "none",
            };
            description.relationships.push(PadRelationship {
                resource: key.to_string(),
                mechanism: mechanism.to_string(),
            });
        }
        description
    }
}

impl Drop for CoapPhysicalAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Translates the updates of one resource and hands them to the sink
struct UpdatePump {
    key: String,
    uri: String,
    mode: NotificationMode,
    translators: Arc<TranslatorSet>,
    sink: Arc<dyn EventSink>,
}

impl UpdatePump {
    fn run(self, updates: Receiver<SyncUpdate>) {
        for update in updates {
            self.deliver(update);
        }
        debug!(resource = %self.uri, "update channel closed");
    }

    fn deliver(&self, update: SyncUpdate) {
        match update {
            SyncUpdate::Property {
                payload,
                content_format,
            } => {
                if !self.mode.properties() {
                    return;
                }
                for event in self
                    .translators
                    .translate_property(&self.key, &self.uri, &payload, content_format)
                {
                    self.sink.publish_property(event);
                }
            }
            SyncUpdate::Error { message } | SyncUpdate::Event { message } => {
                if !self.mode.events() {
                    return;
                }
                for event in self.translators.translate_event(&self.key, &self.uri, &message) {
                    self.sink.publish_event(event);
                }
            }
        }
    }
}
