//! Error types for coap-twin-adapter

use thiserror::Error;

use crate::coap_types::{Method, ResponseCode};

/// Main error type for adapter operations
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Connector or socket failure while sending a request or registering an observation
    #[error("Transport error: {0}")]
    Transport(String),

    /// Null or non-success CoAP response
    #[error("Response error: {0}")]
    Response(String),

    /// Invalid adapter configuration (fatal at build time)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Action dispatched with a method the resource does not declare
    #[error("Method {method} not supported by resource {uri}")]
    UnsupportedMethod { method: Method, uri: String },

    /// Action addressed to a resource the adapter does not manage
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// Action key not of the form "<METHOD> <uri>"
    #[error("Invalid action key: {0}")]
    InvalidActionKey(String),

    /// A translator failed while converting payloads or actions
    #[error("Translation error: {0}")]
    Translation(String),

    /// Resource discovery failed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Nothing to synchronize after discovery and manual configuration
    #[error("No resources available")]
    NoResources,

    /// IO error (sockets, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl AdapterError {
    /// Build a response error from a CoAP code
    pub fn from_code(code: ResponseCode) -> Self {
        Self::Response(format!("code={}", code))
    }
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;
