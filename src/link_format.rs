//! CoRE Link Format parsing (RFC 6690)
//!
//! Turns a `/.well-known/core` payload such as
//! `</sensor/temp>;rt="temp";if="core.s";ct="0 50";obs,</light>;if="core.a"`
//! into a list of [`WebLink`]s.

use coap_lite::link_format::{LinkFormatParser, Unquote};

use crate::error::{AdapterError, Result};

/// A single link with its target attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebLink {
    /// Link target as written between `<` and `>`
    pub uri: String,
    /// Attributes in document order; flag attributes such as `obs` carry no value
    pub attributes: Vec<(String, Option<String>)>,
}

impl WebLink {
    /// Value of the first attribute with the given name
    pub fn first_attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .and_then(|(_, value)| value.as_deref())
    }

    /// All whitespace-separated values of every attribute with the given name
    pub fn attribute_values(&self, name: &str) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(key, _)| key == name)
            .filter_map(|(_, value)| value.as_deref())
            .flat_map(str::split_whitespace)
            .collect()
    }

    /// Check whether the attribute is present, with or without a value
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|(key, _)| key == name)
    }
}

/// Parse a Link Format document
///
/// Attributes without a value (`obs`) are kept as flags. Empty attribute slots are
/// skipped.
pub fn parse(input: &str) -> Result<Vec<WebLink>> {
    let mut links = Vec::new();
    for entry in LinkFormatParser::new(input) {
        let (uri, attributes) = entry.map_err(|e| {
            AdapterError::Discovery(format!("malformed link format ({:?}): {}", e, input.trim()))
        })?;
        links.push(WebLink {
            uri: uri.trim().to_string(),
            attributes: attributes
                .filter(|(name, _)| !name.is_empty())
                .map(|(name, value)| (name.to_string(), attribute_value(value)))
                .collect(),
        });
    }
    Ok(links)
}

/// Parse a Link Format payload received as bytes
pub fn parse_bytes(payload: &[u8]) -> Result<Vec<WebLink>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| AdapterError::Discovery(format!("link format is not UTF-8: {}", e)))?;
    parse(text)
}

fn attribute_value(value: Unquote<'_>) -> Option<String> {
    if value.clone().into_raw_str().is_empty() {
        None
    } else {
        Some(value.to_cow().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_KNOWN: &str = r#"</sensor/temp>;rt="temp";if="core.s";ct="0 50";obs,</light>;if="core.a";ct=0,</.well-known/core>;ct=40"#;

    #[test]
    fn test_parse_links() {
        let links = parse(WELL_KNOWN).unwrap();
        assert_eq!(links.len(), 3);

        let temp = &links[0];
        assert_eq!(temp.uri, "/sensor/temp");
        assert_eq!(temp.first_attribute("rt"), Some("temp"));
        assert_eq!(temp.first_attribute("if"), Some("core.s"));
        assert_eq!(temp.attribute_values("ct"), vec!["0", "50"]);
        assert!(temp.has_attribute("obs"));
        assert_eq!(temp.first_attribute("obs"), None);

        let light = &links[1];
        assert_eq!(light.uri, "/light");
        assert!(!light.has_attribute("obs"));
        assert_eq!(light.first_attribute("rt"), None);
    }

    #[test]
    fn test_repeated_ct_and_quoted_separators() {
        let links = parse(r#"</a>;ct=0;ct=60;title="x, y; z""#).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].attribute_values("ct"), vec!["0", "60"]);
        assert_eq!(links[0].first_attribute("title"), Some("x, y; z"));
    }

    #[test]
    fn test_malformed_link() {
        assert!(matches!(
            parse("/sensor;rt=temp"),
            Err(AdapterError::Discovery(_))
        ));
        assert!(parse("  ").unwrap().is_empty());
    }

    #[test]
    fn test_escaped_quotes_and_whitespace_between_links() {
        let links = parse("</a>;title=\"say \\\"hi\\\"\";obs,\n </b>;;rt=\"b\",").unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].first_attribute("title"), Some("say \"hi\""));
        assert!(links[0].has_attribute("obs"));
        assert_eq!(links[1].uri, "/b");
        assert_eq!(links[1].attributes, vec![("rt".to_string(), Some("b".to_string()))]);
    }
}
