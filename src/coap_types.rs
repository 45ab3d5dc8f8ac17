//! CoAP types shared by the adapter
//!
//! This module defines the CoAP vocabulary the adapter works with.
//! These abstractions keep resource synchronization independent of the CoAP implementation.

use std::fmt;

/// CoAP Content-Format identifiers
/// See: https://www.iana.org/assignments/core-parameters/core-parameters.xhtml#content-formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentFormat {
    /// text/plain;charset=utf-8
    #[default]
    TextPlain,
    /// application/link-format
    LinkFormat,
    /// application/xml
    Xml,
    /// application/octet-stream
    OctetStream,
    /// application/exi
    Exi,
    /// application/json
    Json,
    /// application/cbor
    Cbor,
    /// application/senml+json
    SenmlJson,
    /// application/senml+cbor
    SenmlCbor,
    /// Any other registered or private identifier
    Other(u16),
}

impl ContentFormat {
    /// Convert from raw content-format ID
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::TextPlain,
            40 => Self::LinkFormat,
            41 => Self::Xml,
            42 => Self::OctetStream,
            47 => Self::Exi,
            50 => Self::Json,
            60 => Self::Cbor,
            110 => Self::SenmlJson,
            112 => Self::SenmlCbor,
            other => Self::Other(other),
        }
    }

    /// Get the raw content-format ID
    pub fn as_u16(self) -> u16 {
        match self {
            Self::TextPlain => 0,
            Self::LinkFormat => 40,
            Self::Xml => 41,
            Self::OctetStream => 42,
            Self::Exi => 47,
            Self::Json => 50,
            Self::Cbor => 60,
            Self::SenmlJson => 110,
            Self::SenmlCbor => 112,
            Self::Other(value) => value,
        }
    }

    /// Media type string, `unknown/<id>` for unregistered identifiers
    pub fn mime_type(self) -> String {
        let known = match self {
            Self::TextPlain => "text/plain",
            Self::LinkFormat => "application/link-format",
            Self::Xml => "application/xml",
            Self::OctetStream => "application/octet-stream",
            Self::Exi => "application/exi",
            Self::Json => "application/json",
            Self::Cbor => "application/cbor",
            Self::SenmlJson => "application/senml+json",
            Self::SenmlCbor => "application/senml+cbor",
            Self::Other(value) => return format!("unknown/{}", value),
        };
        known.to_string()
    }

    /// Parse a media type string (parameters such as `;charset=utf-8` are ignored)
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        let format = match essence.to_ascii_lowercase().as_str() {
            "text/plain" => Self::TextPlain,
            "application/link-format" => Self::LinkFormat,
            "application/xml" => Self::Xml,
            "application/octet-stream" => Self::OctetStream,
            "application/exi" => Self::Exi,
            "application/json" => Self::Json,
            "application/cbor" => Self::Cbor,
            "application/senml+json" => Self::SenmlJson,
            "application/senml+cbor" => Self::SenmlCbor,
            other => {
                let id = other.strip_prefix("unknown/")?;
                return id.parse().ok().map(Self::from_u16);
            }
        };
        Some(format)
    }
}

impl fmt::Display for ContentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mime_type())
    }
}

/// CoAP request methods used by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read the resource state
    Get,
    /// Body-less trigger
    Post,
    /// Replace the resource state
    Put,
}

impl Method {
    /// Parse an upper-case method token
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
            Method::Put => f.write_str("PUT"),
        }
    }
}

/// CoAP response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    // Success codes
    /// 2.01 Created
    Created,
    /// 2.02 Deleted
    Deleted,
    /// 2.03 Valid
    Valid,
    /// 2.04 Changed
    Changed,
    /// 2.05 Content
    Content,

    // Client error codes
    /// 4.00 Bad Request
    BadRequest,
    /// 4.01 Unauthorized
    Unauthorized,
    /// 4.02 Bad Option
    BadOption,
    /// 4.03 Forbidden
    Forbidden,
    /// 4.04 Not Found
    NotFound,
    /// 4.05 Method Not Allowed
    MethodNotAllowed,
    /// 4.06 Not Acceptable
    NotAcceptable,
    /// 4.15 Unsupported Content-Format
    UnsupportedContentFormat,

    // Server error codes
    /// 5.00 Internal Server Error
    InternalServerError,
    /// 5.01 Not Implemented
    NotImplemented,
    /// 5.03 Service Unavailable
    ServiceUnavailable,
    /// 5.04 Gateway Timeout
    GatewayTimeout,

    /// Any other class.detail pair
    Other(u8, u8),
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, detail) = self.to_code_pair();
        write!(f, "{}.{:02}", class, detail)
    }
}

impl ResponseCode {
    /// Convert to CoAP response code format (class.detail)
    pub fn to_code_pair(self) -> (u8, u8) {
        match self {
            Self::Created => (2, 1),
            Self::Deleted => (2, 2),
            Self::Valid => (2, 3),
            Self::Changed => (2, 4),
            Self::Content => (2, 5),
            Self::BadRequest => (4, 0),
            Self::Unauthorized => (4, 1),
            Self::BadOption => (4, 2),
            Self::Forbidden => (4, 3),
            Self::NotFound => (4, 4),
            Self::MethodNotAllowed => (4, 5),
            Self::NotAcceptable => (4, 6),
            Self::UnsupportedContentFormat => (4, 15),
            Self::InternalServerError => (5, 0),
            Self::NotImplemented => (5, 1),
            Self::ServiceUnavailable => (5, 3),
            Self::GatewayTimeout => (5, 4),
            Self::Other(class, detail) => (class, detail),
        }
    }

    /// Convert from a class.detail pair
    pub fn from_code_pair(class: u8, detail: u8) -> Self {
        match (class, detail) {
            (2, 1) => Self::Created,
            (2, 2) => Self::Deleted,
            (2, 3) => Self::Valid,
            (2, 4) => Self::Changed,
            (2, 5) => Self::Content,
            (4, 0) => Self::BadRequest,
            (4, 1) => Self::Unauthorized,
            (4, 2) => Self::BadOption,
            (4, 3) => Self::Forbidden,
            (4, 4) => Self::NotFound,
            (4, 5) => Self::MethodNotAllowed,
            (4, 6) => Self::NotAcceptable,
            (4, 15) => Self::UnsupportedContentFormat,
            (5, 0) => Self::InternalServerError,
            (5, 1) => Self::NotImplemented,
            (5, 3) => Self::ServiceUnavailable,
            (5, 4) => Self::GatewayTimeout,
            (class, detail) => Self::Other(class, detail),
        }
    }

    /// Convert from the raw code byte (3-bit class, 5-bit detail)
    pub fn from_raw(code: u8) -> Self {
        Self::from_code_pair(code >> 5, code & 0x1f)
    }

    /// Check if this is a success code (class 2)
    pub fn is_success(self) -> bool {
        self.to_code_pair().0 == 2
    }
}

/// CoRE Link Format attribute names understood by discovery
pub mod link_attributes {
    /// Resource type
    pub const RESOURCE_TYPE: &str = "rt";
    /// Interface description
    pub const INTERFACE: &str = "if";
    /// Candidate content formats
    pub const CONTENT_TYPE: &str = "ct";
    /// Observability flag
    pub const OBSERVABLE: &str = "obs";
}

/// Discovery resource path
pub const WELL_KNOWN_CORE: &str = "/.well-known/core";

/// A CoAP request (transport-agnostic)
#[derive(Debug, Clone, PartialEq)]
pub struct CoapRequest {
    /// The request method
    pub method: Method,
    /// Absolute resource path, e.g. `/sensor/temp`
    pub path: String,
    /// Request payload
    pub payload: Vec<u8>,
    /// Content format of the payload
    pub content_format: Option<ContentFormat>,
    /// Accept option
    pub accept: Option<ContentFormat>,
    /// Observe option value (0 registers, 1 deregisters)
    pub observe: Option<u32>,
    /// Send as a confirmable message
    pub confirmable: bool,
}

impl CoapRequest {
    /// Create a new confirmable request
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            payload: Vec::new(),
            content_format: None,
            accept: None,
            observe: None,
            confirmable: true,
        }
    }

    /// Create a GET request
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Vec<u8>, format: ContentFormat) -> Self {
        self.payload = payload;
        self.content_format = Some(format);
        self
    }

    /// Set the Accept option
    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.accept = Some(format);
        self
    }

    /// Register an observation (Observe = 0)
    pub fn observing(mut self) -> Self {
        self.observe = Some(0);
        self
    }

    /// Path segments without empty components
    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }
}

/// A CoAP response (transport-agnostic)
#[derive(Debug, Clone, PartialEq)]
pub struct CoapResponse {
    /// Response code
    pub code: ResponseCode,
    /// Response payload
    pub payload: Vec<u8>,
    /// Content format of the payload
    pub content_format: Option<ContentFormat>,
}

impl CoapResponse {
    /// Create a success response with content
    pub fn content(payload: Vec<u8>, format: ContentFormat) -> Self {
        Self {
            code: ResponseCode::Content,
            payload,
            content_format: Some(format),
        }
    }

    /// Create a changed response (for POST/PUT)
    pub fn changed() -> Self {
        Self {
            code: ResponseCode::Changed,
            payload: Vec::new(),
            content_format: None,
        }
    }

    /// Create an error response
    pub fn error(code: ResponseCode, message: &str) -> Self {
        Self {
            code,
            payload: message.as_bytes().to_vec(),
            content_format: Some(ContentFormat::TextPlain),
        }
    }

    /// Check if the response code is a success code
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_format_conversion() {
        assert_eq!(ContentFormat::from_u16(50), ContentFormat::Json);
        assert_eq!(ContentFormat::SenmlCbor.as_u16(), 112);
        assert_eq!(ContentFormat::from_u16(11542), ContentFormat::Other(11542));
        assert_eq!(ContentFormat::Other(11542).as_u16(), 11542);
    }

    #[test]
    fn test_content_format_mime() {
        assert_eq!(ContentFormat::TextPlain.mime_type(), "text/plain");
        assert_eq!(ContentFormat::Json.to_string(), "application/json");
        assert_eq!(ContentFormat::Other(9999).mime_type(), "unknown/9999");
        assert_eq!(
            ContentFormat::from_mime_type("text/plain; charset=utf-8"),
            Some(ContentFormat::TextPlain)
        );
        assert_eq!(
            ContentFormat::from_mime_type("unknown/9999"),
            Some(ContentFormat::Other(9999))
        );
        assert_eq!(ContentFormat::from_mime_type("image/png"), None);
    }

    #[test]
    fn test_response_code() {
        assert_eq!(ResponseCode::Content.to_code_pair(), (2, 5));
        assert_eq!(ResponseCode::from_raw(0x45), ResponseCode::Content);
        assert_eq!(ResponseCode::from_raw(0x84), ResponseCode::NotFound);
        assert!(ResponseCode::Changed.is_success());
        assert!(ResponseCode::Other(2, 31).is_success());
        assert!(!ResponseCode::NotFound.is_success());
        assert_eq!(ResponseCode::MethodNotAllowed.to_string(), "4.05");
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(Method::parse("PUT"), Some(Method::Put));
        assert_eq!(Method::parse("DELETE"), None);
        assert_eq!(Method::Post.to_string(), "POST");
    }
}
