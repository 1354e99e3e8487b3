// SPDX-License-Identifier: MIT
//! Run configuration shared by every signal.
//!
//! Values are layered, later layers winning:
//!
//! * built-in defaults ([`Config::default`])
//! * the YAML file given with `--config`; top-level keys apply to every signal,
//!   keys under `logs:`, `metrics:` or `traces:` to that signal only
//! * environment variables (`OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`)
//! * command line flags
//!
//! # Examples
//!
//! ```yaml
//! workers: 4
//! rate: 10
//! duration: 30s
//! otlp-endpoint: collector:4317
//! otlp-http: false
//! telemetry-attributes:
//!   http:
//!     method: GET
//!   user.email: "{{Email}}"
//! sensitive-data: [user.email]
//! logs:
//!   body: "payment {{UUID}} accepted"
//! ```
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use opentelemetry::trace::{SpanId, TraceId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::attributes::{inject_sensitive_marker, AttributeValue};

pub const DEFAULT_GRPC_ENDPOINT: &str = "localhost:4317";
pub const DEFAULT_HTTP_ENDPOINT: &str = "localhost:4318";
pub const DEFAULT_SERVICE_NAME: &str = "trazr-gen";

/// Keys of the per-signal sections in a config file.
pub const SIGNAL_SECTIONS: [&str; 3] = ["logs", "metrics", "traces"];

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("either `{0}` or `duration` must be greater than 0")]
    NothingToGenerate(&'static str),
    #[error("`workers` must be at least 1")]
    NoWorkers,
    #[error("`rate` must be a finite, non-negative number, got {0}")]
    InvalidRate(f64),
    #[error("invalid trace id {value:?}: {reason}")]
    InvalidTraceId { value: String, reason: String },
    #[error("invalid span id {value:?}: {reason}")]
    InvalidSpanId { value: String, reason: String },
    #[error("expected `status-code` to be one of (Unset, Error, Ok) or (0, 1, 2), got {0:?} instead")]
    InvalidStatusCode(String),
    #[error("invalid metric type {0:?}, expected one of Gauge, Sum or Histogram")]
    InvalidMetricType(String),
    #[error("invalid aggregation temporality {0:?}, expected delta or cumulative")]
    InvalidTemporality(String),
    #[error(
        "value should be in one of the following formats: key=\"value\", key=true, key=false, or key=<integer>, got {0:?}"
    )]
    InvalidKeyValue(String),
    #[error("invalid attribute JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("attributes must be a mapping, got {0}")]
    NotAMapping(&'static str),
    #[error("unsupported value for attribute {key:?}: {kind}")]
    UnsupportedValue { key: String, kind: &'static str },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Attributes as configured, before any processing.
///
/// Nested mappings are flattened into dotted keys. `None` marks an explicit null:
/// it never reaches telemetry but still counts as present for sensitive-data
/// tagging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeMap(IndexMap<String, Option<AttributeValue>>);

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.0.insert(key.into(), Some(value.into()));
    }

    pub fn insert_null(&mut self, key: impl Into<String>) {
        self.0.insert(key.into(), None);
    }

    pub fn get(&self, key: &str) -> Option<&Option<AttributeValue>> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Option<AttributeValue>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Adds every entry of `other`, replacing existing keys.
    pub fn merge(&mut self, other: AttributeMap) {
        self.0.extend(other.0);
    }

    /// Flattens a JSON object into dotted keys.
    ///
    /// # Errors
    /// Fails when `value` is not an object or holds arrays.
    pub fn from_json(value: JsonValue) -> Result<Self, ConfigError> {
        let JsonValue::Object(object) = value else {
            return Err(ConfigError::NotAMapping(json_kind(&value)));
        };
        let mut map = Self::new();
        flatten_into(&mut map, None, object)?;
        Ok(map)
    }

    /// Parses the command line form of an attribute flag.
    ///
    /// Accepts either a JSON object (`{"http": {"method": "GET"}}`) or a
    /// comma-separated list of `key=value` pairs. Commas inside double quotes do
    /// not split. Values become booleans for `true`/`false`, then integers, then
    /// floats; a double-quoted value is always a string, quotes stripped.
    ///
    /// ```
    /// use trazr_gen::attributes::AttributeValue;
    /// use trazr_gen::config::AttributeMap;
    ///
    /// let map = AttributeMap::parse_flag(r#"region="eu,west",retries=3,debug=true"#).unwrap();
    /// assert_eq!(map.get("region"), Some(&Some(AttributeValue::String("eu,west".into()))));
    /// assert_eq!(map.get("retries"), Some(&Some(AttributeValue::Int(3))));
    /// assert_eq!(map.get("debug"), Some(&Some(AttributeValue::Bool(true))));
    /// ```
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidKeyValue`] for a pair without `=`.
    pub fn parse_flag(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        if input.starts_with('{') {
            return Self::from_json(serde_json::from_str(input)?);
        }
        let mut map = Self::new();
        for pair in split_comma_separated(input) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidKeyValue(pair.to_owned()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidKeyValue(pair.to_owned()));
            }
            map.insert(key, parse_scalar(value.trim()));
        }
        Ok(map)
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeMap {
    fn from_iter<I: IntoIterator<Item = (String, AttributeValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k, Some(v))).collect())
    }
}

impl<'de> Deserialize<'de> for AttributeMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        if value.is_null() {
            return Ok(Self::new());
        }
        Self::from_json(value).map_err(serde::de::Error::custom)
    }
}

impl Serialize for AttributeMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter())
    }
}

fn flatten_into(
    map: &mut AttributeMap,
    prefix: Option<&str>,
    object: serde_json::Map<String, JsonValue>,
) -> Result<(), ConfigError> {
    for (key, value) in object {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key,
        };
        match value {
            JsonValue::Object(nested) => flatten_into(map, Some(&key), nested)?,
            JsonValue::Null => map.insert_null(key),
            JsonValue::Bool(v) => map.insert(key, v),
            JsonValue::String(v) => map.insert(key, v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(v) => map.insert(key, v),
                None => map.insert(key, n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::Array(_) => {
                return Err(ConfigError::UnsupportedValue { key, kind: "array" });
            }
        }
    }
    Ok(())
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn parse_scalar(raw: &str) -> AttributeValue {
    match raw {
        "true" => return AttributeValue::Bool(true),
        "false" => return AttributeValue::Bool(false),
        _ => {}
    }
    if let Ok(v) = raw.parse::<i64>() {
        return AttributeValue::Int(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return AttributeValue::Float(v);
    }
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw);
    AttributeValue::String(unquoted.to_owned())
}

/// Splits on commas that are not inside double quotes.
pub fn split_comma_separated(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Client certificate settings for mutual TLS.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientAuth {
    pub mtls: bool,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Settings common to every signal.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub workers: usize,
    /// Iterations per second per worker; `0` disables throttling.
    pub rate: f64,
    /// Run length; when non-zero it replaces the per-worker count limit.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Progress report period; `0` disables periodic reports.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// `host:port` or a full URL. Empty picks the default for the transport.
    pub otlp_endpoint: String,
    pub otlp_insecure: bool,
    pub otlp_insecure_skip_verify: bool,
    pub otlp_http: bool,
    /// Empty picks `/v1/logs`, `/v1/metrics` or `/v1/traces`.
    pub otlp_http_url_path: String,
    pub otlp_header: AttributeMap,
    /// Resource attributes.
    pub otlp_attributes: AttributeMap,
    pub service: String,
    /// Attributes attached to every generated record.
    pub telemetry_attributes: AttributeMap,
    pub sensitive_data: Vec<String>,
    pub ca_cert: Option<PathBuf>,
    pub client_auth: ClientAuth,
    pub log_level: String,
    pub mock_data: bool,
    /// `0` picks a random seed.
    pub mock_seed: u64,
    pub terminal_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            rate: 1.0,
            duration: Duration::ZERO,
            interval: Duration::from_secs(1),
            otlp_endpoint: String::new(),
            otlp_insecure: true,
            otlp_insecure_skip_verify: true,
            otlp_http: true,
            otlp_http_url_path: String::new(),
            otlp_header: AttributeMap::new(),
            otlp_attributes: AttributeMap::new(),
            service: DEFAULT_SERVICE_NAME.to_owned(),
            telemetry_attributes: AttributeMap::new(),
            sensitive_data: Vec::new(),
            ca_cert: None,
            client_auth: ClientAuth::default(),
            log_level: "info".to_owned(),
            mock_data: true,
            mock_seed: 0,
            terminal_output: true,
        }
    }
}

impl Config {
    /// Collector endpoint, falling back to the default port of the transport.
    pub fn endpoint(&self) -> &str {
        match (self.otlp_endpoint.is_empty(), self.otlp_http) {
            (false, _) => &self.otlp_endpoint,
            (true, true) => DEFAULT_HTTP_ENDPOINT,
            (true, false) => DEFAULT_GRPC_ENDPOINT,
        }
    }

    /// Checks the settings shared by every signal.
    ///
    /// # Errors
    /// Fails for zero workers or a negative or non-finite rate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !self.rate.is_finite() || self.rate < 0.0 {
            return Err(ConfigError::InvalidRate(self.rate));
        }
        Ok(())
    }

    /// Requires either a positive count or a positive duration.
    pub(crate) fn require_work(&self, signal: &'static str, count: u64) -> Result<(), ConfigError> {
        if count == 0 && self.duration.is_zero() {
            return Err(ConfigError::NothingToGenerate(signal));
        }
        Ok(())
    }

    /// Tags sensitive keys in the resource and telemetry attributes.
    pub fn init_attributes(&mut self) {
        inject_sensitive_marker(&mut self.otlp_attributes, &self.sensitive_data);
        inject_sensitive_marker(&mut self.telemetry_attributes, &self.sensitive_data);
    }
}

/// Parses a 32 hex digit trace id.
///
/// # Errors
/// Fails on the wrong length or non-hex characters.
pub fn validate_trace_id(value: &str) -> Result<TraceId, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidTraceId {
        value: value.to_owned(),
        reason,
    };
    let bytes = decode_id::<16>(value).map_err(invalid)?;
    Ok(TraceId::from_bytes(bytes))
}

/// Parses a 16 hex digit span id.
///
/// # Errors
/// Fails on the wrong length or non-hex characters.
pub fn validate_span_id(value: &str) -> Result<SpanId, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSpanId {
        value: value.to_owned(),
        reason,
    };
    let bytes = decode_id::<8>(value).map_err(invalid)?;
    Ok(SpanId::from_bytes(bytes))
}

/// Parses an optional id; empty means unset.
pub(crate) fn optional_trace_id(value: &str) -> Result<Option<TraceId>, ConfigError> {
    (!value.is_empty()).then(|| validate_trace_id(value)).transpose()
}

pub(crate) fn optional_span_id(value: &str) -> Result<Option<SpanId>, ConfigError> {
    (!value.is_empty()).then(|| validate_span_id(value)).transpose()
}

fn decode_id<const N: usize>(value: &str) -> Result<[u8; N], String> {
    if value.len() != N * 2 {
        return Err(format!("expected {} hex digits, got {}", N * 2, value.len()));
    }
    let mut bytes = [0u8; N];
    hex::decode_to_slice(value, &mut bytes).map_err(|e| e.to_string())?;
    Ok(bytes)
}

/// Loads the `section` view of a YAML config file.
///
/// # Errors
/// Fails when the file can't be read or doesn't match the config shape.
pub fn load_file<T: DeserializeOwned>(path: &Path, section: &str) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    from_yaml_str(&text, section).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Merges the top-level keys of a YAML document with its `section` mapping.
///
/// Mappings under the other signal names are ignored; a scalar under a signal
/// name is that signal's count.
pub fn from_yaml_str<T: DeserializeOwned>(text: &str, section: &str) -> Result<T, serde_yaml::Error> {
    let document: serde_yaml::Value = serde_yaml::from_str(text)?;
    let mut merged = serde_yaml::Mapping::new();
    if let serde_yaml::Value::Mapping(top) = document {
        let mut own = None;
        for (key, value) in top {
            let signal = key.as_str().filter(|k| SIGNAL_SECTIONS.contains(k)).map(str::to_owned);
            match (signal, value) {
                (Some(name), serde_yaml::Value::Mapping(mapping)) => {
                    if name == section {
                        own = Some(mapping);
                    }
                }
                (_, value) => {
                    merged.insert(key, value);
                }
            }
        }
        merged.extend(own.into_iter().flatten());
    }
    serde_yaml::from_value(serde_yaml::Value::Mapping(merged))
}

/// A setting that differs from its default.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub key: String,
    pub value: JsonValue,
    pub default: JsonValue,
}

impl std::fmt::Display for Override {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} (default: {})", self.key, self.value, self.default)
    }
}

/// Lists the settings of `config` that differ from `T::default()`, in
/// declaration order. Nested settings use dotted keys.
pub fn overridden_values<T: Serialize + Default>(config: &T) -> Vec<Override> {
    let (Ok(current), Ok(default)) = (serde_json::to_value(config), serde_json::to_value(T::default())) else {
        return Vec::new();
    };
    let mut overrides = Vec::new();
    diff_values(None, &current, &default, &mut overrides);
    overrides
}

fn diff_values(prefix: Option<&str>, current: &JsonValue, default: &JsonValue, out: &mut Vec<Override>) {
    match (current, default) {
        (JsonValue::Object(current), JsonValue::Object(default)) if prefix.is_none() || !default.is_empty() => {
            for (key, value) in current {
                let path = prefix.map_or_else(|| key.clone(), |p| format!("{p}.{key}"));
                diff_values(Some(&path), value, default.get(key).unwrap_or(&JsonValue::Null), out);
            }
        }
        _ if current != default => out.push(Override {
            key: prefix.unwrap_or_default().to_owned(),
            value: current.clone(),
            default: default.clone(),
        }),
        _ => {}
    }
}
