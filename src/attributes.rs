// SPDX-License-Identifier: MIT
//! Typed attributes and the attribute processing pipeline.
//!
//! Configured attribute maps ([`AttributeMap`]) go through three steps before they
//! reach a record, a resource or a request header:
//!
//! 1. [`inject_sensitive_marker`] tags the keys named as sensitive, once, at startup.
//! 2. [`AttributeProcessor`] expands mock templates and coerces the results.
//! 3. [`with_mock_marker`] appends the list of keys that held templates.
//!
//! Marker attributes always come last.
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::config::AttributeMap;
use crate::mock::{is_template, MockEngine, MockError};

/// Lists the attribute keys whose values were produced from mock templates.
pub const MOCK_DATA_KEY: &str = "trazr.mock.data";
/// Lists the configured sensitive keys present in a map.
pub const SENSITIVE_DATA_KEY: &str = "trazr.sensitive.data";
/// Header counterpart of [`MOCK_DATA_KEY`].
pub const MOCK_DATA_HEADER: &str = "X-trazr.mock.data";
/// Resource attribute naming the emitting service.
pub const SERVICE_NAME_KEY: &str = "service.name";

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl AttributeValue {
    /// Reads a typed value back out of expanded template text.
    ///
    /// Integers win over booleans, booleans over floats; anything else stays a string.
    /// Booleans accept `1`, `t`, `T`, `TRUE`, `true`, `True` and their false
    /// counterparts, but `1` and `0` are taken as integers first.
    pub fn coerce(text: String) -> Self {
        if let Ok(v) = text.parse::<i64>() {
            return Self::Int(v);
        }
        if let Some(v) = parse_bool(&text) {
            return Self::Bool(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            return Self::Float(v);
        }
        Self::String(text)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Ordered attributes with unique keys. Inserting an existing key replaces its
/// value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSet {
    entries: Vec<(String, AttributeValue)>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl Extend<(String, AttributeValue)> for AttributeSet {
    fn extend<I: IntoIterator<Item = (String, AttributeValue)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (String, AttributeValue)>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl IntoIterator for AttributeSet {
    type Item = (String, AttributeValue);
    type IntoIter = std::vec::IntoIter<(String, AttributeValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Attributes after template expansion, along with the keys that held templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expanded {
    pub attributes: AttributeSet,
    pub mocked: Vec<String>,
}

impl Expanded {
    /// Appends the mock marker and returns the final attributes.
    pub fn finish(self) -> AttributeSet {
        with_mock_marker(self.attributes, &self.mocked)
    }
}

/// Turns configured attribute maps into the attributes attached to telemetry.
///
/// Cheap to clone; every worker gets its own copy sharing one mock engine.
#[derive(Debug, Clone, Default)]
pub struct AttributeProcessor {
    mock: Option<Arc<MockEngine>>,
}

impl AttributeProcessor {
    /// `None` disables template expansion: every value passes through as configured.
    pub fn new(mock: Option<Arc<MockEngine>>) -> Self {
        Self { mock }
    }

    pub fn mock_enabled(&self) -> bool {
        self.mock.is_some()
    }

    /// Expands `value` when it is a template and mock data is enabled.
    ///
    /// Returns `None` when the value is left untouched.
    pub fn expand_text(&self, value: &str) -> Result<Option<String>, MockError> {
        match &self.mock {
            Some(engine) if is_template(value) => engine.expand(value).map(Some),
            _ => Ok(None),
        }
    }

    /// Expands every template in `raw`. Null placeholders are dropped.
    pub fn expand(&self, raw: &AttributeMap) -> Result<Expanded, MockError> {
        let mut expanded = Expanded {
            attributes: AttributeSet::with_capacity(raw.len() + 1),
            mocked: Vec::new(),
        };
        for (key, value) in raw.iter() {
            let Some(value) = value else {
                continue;
            };
            let value = match value.as_str().map(|text| self.expand_text(text)).transpose()?.flatten() {
                Some(text) => {
                    expanded.mocked.push(key.to_owned());
                    AttributeValue::coerce(text)
                }
                None => value.clone(),
            };
            expanded.attributes.insert(key, value);
        }
        Ok(expanded)
    }

    /// Builds record attributes: [`expand`](Self::expand) plus the mock marker.
    pub fn build(&self, raw: &AttributeMap) -> Result<AttributeSet, MockError> {
        Ok(self.expand(raw)?.finish())
    }

    /// Builds resource attributes, making sure `service.name` is set.
    ///
    /// A configured `service.name` attribute wins over `service`.
    pub fn build_resource(&self, raw: &AttributeMap, service: &str) -> Result<AttributeSet, MockError> {
        let mut expanded = self.expand(raw)?;
        if !expanded.attributes.contains(SERVICE_NAME_KEY) {
            expanded.attributes.insert(SERVICE_NAME_KEY, service);
        }
        Ok(expanded.finish())
    }

    /// Builds request headers. Non-string values are formatted; the header
    /// `X-trazr.mock.data` lists the templated header names.
    pub fn build_headers(&self, raw: &AttributeMap) -> Result<IndexMap<String, String>, MockError> {
        let Expanded { attributes, mocked } = self.expand(raw)?;
        let mut headers: IndexMap<String, String> =
            attributes.into_iter().map(|(k, v)| (k, v.to_string())).collect();
        if !mocked.is_empty() {
            headers.insert(MOCK_DATA_HEADER.to_owned(), mocked.join(","));
        }
        Ok(headers)
    }
}

/// Appends `trazr.mock.data` listing `mocked` when any key held a template.
pub fn with_mock_marker(mut attributes: AttributeSet, mocked: &[String]) -> AttributeSet {
    if !mocked.is_empty() {
        attributes.insert(MOCK_DATA_KEY, mocked.join(","));
    }
    attributes
}

/// Lists the `sensitive` keys present in `raw`, in `sensitive` order.
pub fn sensitive_marker(raw: &AttributeMap, sensitive: &[String]) -> Option<String> {
    let present: Vec<&str> = sensitive
        .iter()
        .filter(|key| raw.contains_key(key.as_str()))
        .map(String::as_str)
        .collect();
    (!present.is_empty()).then(|| present.join(","))
}

/// Adds `trazr.sensitive.data` to `raw` when any sensitive key is present.
pub fn inject_sensitive_marker(raw: &mut AttributeMap, sensitive: &[String]) {
    if let Some(marker) = sensitive_marker(raw, sensitive) {
        raw.insert(SENSITIVE_DATA_KEY, marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, AttributeValue)]) -> AttributeMap {
        let mut raw = AttributeMap::new();
        for (k, v) in entries {
            raw.insert(*k, v.clone());
        }
        raw
    }

    fn keys(set: &AttributeSet) -> Vec<&str> {
        set.keys().collect()
    }

    #[test]
    fn coercion_prefers_int_then_bool_then_float() {
        assert_eq!(AttributeValue::coerce("42".into()), AttributeValue::Int(42));
        assert_eq!(AttributeValue::coerce("1".into()), AttributeValue::Int(1));
        assert_eq!(AttributeValue::coerce("True".into()), AttributeValue::Bool(true));
        assert_eq!(AttributeValue::coerce("f".into()), AttributeValue::Bool(false));
        assert_eq!(AttributeValue::coerce("2.5".into()), AttributeValue::Float(2.5));
        assert_eq!(AttributeValue::coerce("yes".into()), AttributeValue::String("yes".into()));
    }

    #[test]
    fn insert_replaces_in_place() {
        let mut set = AttributeSet::new();
        set.insert("a", 1_i64);
        set.insert("b", 2_i64);
        set.insert("a", "x");
        assert_eq!(keys(&set), ["a", "b"]);
        assert_eq!(set.get("a"), Some(&AttributeValue::String("x".into())));
    }

    #[test]
    fn sensitive_marker_lists_present_keys_in_configured_order() {
        let mut raw = map(&[("a", 1_i64.into()), ("b", 2_i64.into()), ("c", 3_i64.into())]);
        inject_sensitive_marker(&mut raw, &["c".into(), "x".into(), "a".into()]);
        assert_eq!(
            raw.get(SENSITIVE_DATA_KEY),
            Some(&Some(AttributeValue::String("c,a".into())))
        );

        let mut raw = map(&[("a", 1_i64.into())]);
        inject_sensitive_marker(&mut raw, &["x".into()]);
        assert!(!raw.contains_key(SENSITIVE_DATA_KEY));
    }

    #[test]
    fn null_placeholders_count_as_present_but_are_dropped() {
        let mut raw = AttributeMap::new();
        raw.insert_null("secret");
        inject_sensitive_marker(&mut raw, &["secret".into()]);

        let set = AttributeProcessor::default().build(&raw).unwrap();
        assert_eq!(keys(&set), [SENSITIVE_DATA_KEY]);
    }

    #[test]
    fn processing_without_mock_is_idempotent() {
        let raw = map(&[
            ("s", "{{FirstName}}".into()),
            ("b", true.into()),
            ("i", 7_i64.into()),
            ("f", 0.5.into()),
        ]);
        let processor = AttributeProcessor::new(None);
        let once = processor.build(&raw).unwrap();
        assert_eq!(once.get("s"), Some(&AttributeValue::String("{{FirstName}}".into())));
        assert!(!once.contains(MOCK_DATA_KEY));

        let again: AttributeMap = once.iter().map(|(k, v)| (k.to_owned(), v.clone())).collect();
        assert_eq!(processor.build(&again).unwrap(), once);
    }

    #[test]
    fn templates_are_expanded_coerced_and_marked() {
        let raw = map(&[
            ("plain", "value".into()),
            ("n", "{{Number 1 24}}".into()),
            ("who", "{{FirstName}}".into()),
        ]);
        let processor = AttributeProcessor::new(Some(Arc::new(MockEngine::new(9))));
        let set = processor.build(&raw).unwrap();

        assert_eq!(keys(&set), ["plain", "n", "who", MOCK_DATA_KEY]);
        assert!(matches!(set.get("n"), Some(AttributeValue::Int(1..=24))));
        assert_eq!(set.get(MOCK_DATA_KEY), Some(&AttributeValue::String("n,who".into())));
    }

    #[test]
    fn template_errors_propagate() {
        let raw = map(&[("bad", "{{Nope}}".into())]);
        let processor = AttributeProcessor::new(Some(Arc::new(MockEngine::new(1))));
        assert!(processor.build(&raw).is_err());
    }

    #[test]
    fn resource_gets_a_service_name() {
        let processor = AttributeProcessor::default();
        let set = processor.build_resource(&AttributeMap::new(), "checkout").unwrap();
        assert_eq!(set.get(SERVICE_NAME_KEY), Some(&AttributeValue::String("checkout".into())));

        let raw = map(&[(SERVICE_NAME_KEY, "explicit".into())]);
        let set = processor.build_resource(&raw, "checkout").unwrap();
        assert_eq!(set.get(SERVICE_NAME_KEY), Some(&AttributeValue::String("explicit".into())));
    }

    #[test]
    fn headers_are_strings_with_a_mock_header() {
        let raw = map(&[("x-tenant", "{{Number 5 5}}".into()), ("x-retry", true.into())]);
        let processor = AttributeProcessor::new(Some(Arc::new(MockEngine::new(2))));
        let headers = processor.build_headers(&raw).unwrap();
        assert_eq!(headers.get("x-tenant").map(String::as_str), Some("5"));
        assert_eq!(headers.get("x-retry").map(String::as_str), Some("true"));
        assert_eq!(headers.get(MOCK_DATA_HEADER).map(String::as_str), Some("x-tenant"));
    }
}
