//! Resource discovery and classification
//!
//! Reads `/.well-known/core` (or asks a user-supplied function), classifies every
//! link by its CoRE interface and derives the resource key used in the twin namespace.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coap_types::{CoapRequest, ContentFormat, WELL_KNOWN_CORE, link_attributes};
use crate::error::{AdapterError, Result};
use crate::link_format::{self, WebLink};
use crate::transport::CoapTransport;

/// CoRE interface description (`if=`) of a discovered resource
///
/// See: https://datatracker.ietf.org/doc/html/draft-ietf-core-interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    /// `core.s`, GET
    Sensor,
    /// `core.a`, GET, PUT, POST
    Actuator,
    /// `core.p`, GET, PUT
    Parameter,
    /// `core.rp`, GET
    ReadOnly,
    /// Anything else, including link lists and batches
    Unknown,
}

impl InterfaceKind {
    /// Exact match against the supported interface values
    pub fn from_interface(value: Option<&str>) -> Self {
        match value {
            Some("core.s") => Self::Sensor,
            Some("core.a") => Self::Actuator,
            Some("core.p") => Self::Parameter,
            Some("core.rp") => Self::ReadOnly,
            _ => Self::Unknown,
        }
    }

    /// The `if=` value, empty for unknown interfaces
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sensor => "core.s",
            Self::Actuator => "core.a",
            Self::Parameter => "core.p",
            Self::ReadOnly => "core.rp",
            Self::Unknown => "",
        }
    }

    /// Whether the adapter can build a resource for this interface
    pub fn is_supported(self) -> bool {
        self != Self::Unknown
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a discovery pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Link target as advertised
    pub uri: String,
    /// `rt=` value
    pub resource_type: Option<String>,
    /// Classified `if=` value
    pub interface_kind: InterfaceKind,
    /// `ct=` candidates in advertised order, without duplicates
    pub content_types: Vec<u16>,
    /// `obs` flag present
    pub observable: bool,
}

impl DiscoveredResource {
    /// Build a descriptor from a parsed link
    pub fn from_link(link: &WebLink) -> Self {
        let mut content_types = Vec::new();
        for value in link.attribute_values(link_attributes::CONTENT_TYPE) {
            match value.parse::<u16>() {
                Ok(ct) if !content_types.contains(&ct) => content_types.push(ct),
                Ok(_) => {}
                Err(_) => debug!(uri = %link.uri, "ignoring invalid ct value {:?}", value),
            }
        }

        Self {
            uri: link.uri.clone(),
            resource_type: link
                .first_attribute(link_attributes::RESOURCE_TYPE)
                .filter(|rt| !rt.trim().is_empty())
                .map(str::to_string),
            interface_kind: InterfaceKind::from_interface(
                link.first_attribute(link_attributes::INTERFACE),
            ),
            content_types,
            observable: link.has_attribute(link_attributes::OBSERVABLE),
        }
    }

    /// Sanitized key in the twin namespace
    pub fn resource_key(&self) -> String {
        resource_key(self.resource_type.as_deref(), &self.uri)
    }

    /// Content format to request from this resource
    pub fn negotiate_content_format(&self, preferred: ContentFormat) -> ContentFormat {
        negotiate_content_format(&self.content_types, preferred)
    }
}

/// User override for the discovery pass
pub type DiscoveryFunction =
    Arc<dyn Fn(&dyn CoapTransport) -> Result<Vec<DiscoveredResource>> + Send + Sync>;

/// Classify links, dropping the ones that cannot become resources
///
/// A link is dropped when its target is empty, its `if=` attribute is missing,
/// or the interface is not one of sensor, actuator, parameter or read-only.
pub fn classify(links: &[WebLink]) -> Vec<DiscoveredResource> {
    links
        .iter()
        .filter_map(|link| {
            if link.uri.trim().is_empty() {
                debug!("dropping link with empty target");
                return None;
            }
            if !link.has_attribute(link_attributes::INTERFACE) {
                debug!(uri = %link.uri, "dropping link without interface attribute");
                return None;
            }
            let resource = DiscoveredResource::from_link(link);
            if !resource.interface_kind.is_supported() {
                debug!(
                    uri = %link.uri,
                    interface = ?link.first_attribute(link_attributes::INTERFACE),
                    "dropping link with unsupported interface"
                );
                return None;
            }
            Some(resource)
        })
        .collect()
}

/// Run a discovery pass against the server's `/.well-known/core`
pub fn discover(transport: &dyn CoapTransport) -> Result<Vec<DiscoveredResource>> {
    let request = CoapRequest::get(WELL_KNOWN_CORE).with_accept(ContentFormat::LinkFormat);
    let response = transport
        .send(&request)?
        .ok_or_else(|| AdapterError::Discovery("no response to discovery request".into()))?;

    if !response.is_success() {
        return Err(AdapterError::from_code(response.code));
    }

    let links = link_format::parse_bytes(&response.payload)?;
    let resources = classify(&links);
    info!(
        links = links.len(),
        resources = resources.len(),
        "CoAP resource discovery completed"
    );
    Ok(resources)
}

/// Path portion of a URI, always starting with `/`
///
/// `coap://10.0.0.2:5683/sensor/temp` and `sensor/temp` both become `/sensor/temp`.
pub fn uri_path(uri: &str) -> String {
    let uri = uri.trim();
    let path = match uri.split_once("://") {
        Some((_, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => uri,
    };
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Derive the resource key: `<rt>.<path>` (or `<path>`), keeping only alphanumerics and `.`
pub fn resource_key(resource_type: Option<&str>, uri: &str) -> String {
    let path = uri_path(uri);
    let raw = match resource_type.map(str::trim).filter(|rt| !rt.is_empty()) {
        Some(rt) => format!("{}.{}", rt, path),
        None => path,
    };
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '.')
        .collect()
}

/// First advertised candidate matching the preferred format, text/plain otherwise
pub fn negotiate_content_format(candidates: &[u16], preferred: ContentFormat) -> ContentFormat {
    candidates
        .iter()
        .copied()
        .find(|ct| *ct == preferred.as_u16())
        .map(ContentFormat::from_u16)
        .unwrap_or(ContentFormat::TextPlain)
}
