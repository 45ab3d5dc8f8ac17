//! coap-twin-adapter - keeps digital-twin state in sync with CoAP devices
//!
//! The adapter discovers resources through `/.well-known/core`, keeps each one
//! synchronized by observing or polling it, translates payloads into property and
//! event notifications and turns twin actions into CoAP POST/PUT requests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coap_twin_adapter::{
//!     AdapterConfiguration, CoapPhysicalAdapter, EventNotification, EventSink, PropertyEvent,
//! };
//!
//! struct PrintSink;
//!
//! impl EventSink for PrintSink {
//!     fn publish_property(&self, event: PropertyEvent) {
//!         println!("{} = {}", event.key, event.value);
//!     }
//!
//!     fn publish_event(&self, event: EventNotification) {
//!         println!("{}: {}", event.key, event.body);
//!     }
//! }
//!
//! let config = AdapterConfiguration::builder("192.168.1.20", 5683).build().unwrap();
//! let adapter = CoapPhysicalAdapter::new("greenhouse", config, Arc::new(PrintSink)).unwrap();
//! let description = adapter.start().unwrap();
//! println!("{}", description.to_json().unwrap());
//! ```

pub mod adapter;
pub mod coap_types;
pub mod config;
pub mod discovery;
pub mod dispatcher;
mod error;
pub mod link_format;
pub mod resource;
pub mod scheduler;
pub mod translation;
pub mod transport;

pub use adapter::{CoapPhysicalAdapter, EventSink, PhysicalAssetDescription};
pub use config::{AdapterConfiguration, AdapterSettings, NotificationMode, ResourceSpec};
pub use dispatcher::DispatchOutcome;
pub use error::{AdapterError, Result};
pub use resource::{ResourceDescriptor, ResourceKind};
pub use transport::{CoapTransport, UdpTransport};
pub use translation::{ActionIntent, EventNotification, PropertyEvent, TranslatorSet};
