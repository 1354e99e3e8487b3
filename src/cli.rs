// SPDX-License-Identifier: MIT
//! Command-line interface.
//!
//! # Usage Examples
//!
//! ```bash
//! # 10 log records per second for a minute, over gRPC
//! trazr-gen logs --rate 10 --duration 1m --otlp-http=false \
//!   --otlp-endpoint localhost:4317 --body 'user {{Email}} logged in'
//!
//! # 100 cumulative histogram points from 4 workers
//! trazr-gen metrics --workers 4 --metrics 25 --metric-type Histogram
//!
//! # Traces with three children each, settings taken from a file
//! trazr-gen --config trazr.yaml traces --child-spans 3
//! ```
//!
//! Flags override the config file, which overrides the built-in defaults.
//! Attribute flags can be repeated and accept `key=value,...` or a JSON object.
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;

use crate::config::{self, AttributeMap, Config, ConfigError, Override};
use crate::logs::LogsConfig;
use crate::metrics::{MetricType, MetricsConfig, Temporality};
use crate::traces::TracesConfig;

#[derive(Debug, Parser)]
#[command(name = "trazr-gen", version)]
#[command(about = "Generates synthetic logs, metrics and traces and sends them over OTLP")]
#[command(after_help = "Tip: use --mock-data with {{...}} templates to generate fake attribute values")]
pub struct Cli {
    /// YAML config file; keys under `logs:`, `metrics:` or `traces:` apply to that command only
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level of the generator's own diagnostics (debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate log records
    Logs(LogsArgs),
    /// Generate metric data points
    Metrics(MetricsArgs),
    /// Generate traces
    Traces(TracesArgs),
}

/// Flags shared by every command.
#[derive(Debug, Default, Args)]
pub struct CommonArgs {
    /// Number of workers running in parallel
    #[arg(long)]
    pub workers: Option<usize>,

    /// Iterations per second for each worker; 0 disables throttling
    #[arg(long)]
    pub rate: Option<f64>,

    /// How long to run, e.g. `30s` or `5m`; replaces the per-worker count
    #[arg(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Progress report period; 0s disables periodic reports
    #[arg(long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Collector address (`host:port` or URL)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Use plain-text connections
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub otlp_insecure: Option<bool>,

    /// Skip server certificate verification
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub otlp_insecure_skip_verify: Option<bool>,

    /// Use OTLP/HTTP instead of gRPC
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub otlp_http: Option<bool>,

    /// Request path for OTLP/HTTP
    #[arg(long)]
    pub otlp_http_url_path: Option<String>,

    /// Request headers, `key=value` pairs or a JSON object
    #[arg(long = "otlp-header", value_name = "HEADERS")]
    pub otlp_headers: Vec<String>,

    /// Resource attributes, `key=value` pairs or a JSON object
    #[arg(long, value_name = "ATTRIBUTES")]
    pub otlp_attributes: Vec<String>,

    /// Service name
    #[arg(long, env = "OTEL_SERVICE_NAME")]
    pub service: Option<String>,

    /// Attributes on every record, `key=value` pairs or a JSON object
    #[arg(long, value_name = "ATTRIBUTES")]
    pub telemetry_attributes: Vec<String>,

    /// Attribute keys to list in `trazr.sensitive.data`
    #[arg(long, value_delimiter = ',')]
    pub sensitive_data: Vec<String>,

    /// CA certificate (PEM) trusted for the collector
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Authenticate with a client certificate
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub mtls: Option<bool>,

    /// Client certificate (PEM) for mTLS
    #[arg(long)]
    pub client_cert: Option<PathBuf>,

    /// Client key (PEM) for mTLS
    #[arg(long)]
    pub client_key: Option<PathBuf>,

    /// Expand {{...}} templates in attributes, headers and bodies
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub mock_data: Option<bool>,

    /// Seed for mock data; 0 picks a random one
    #[arg(long)]
    pub mock_seed: Option<u64>,

    /// Print progress to the terminal; when off, diagnostics are JSON on stdout
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub terminal_output: Option<bool>,
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn merge_attributes(map: &mut AttributeMap, flags: &[String]) -> Result<(), ConfigError> {
    for flag in flags {
        map.merge(AttributeMap::parse_flag(flag)?);
    }
    Ok(())
}

impl CommonArgs {
    /// Writes every flag that was given onto `config`.
    ///
    /// # Errors
    /// Fails on malformed attribute or header flags.
    pub fn apply(self, config: &mut Config) -> Result<(), ConfigError> {
        set(&mut config.workers, self.workers);
        set(&mut config.rate, self.rate);
        set(&mut config.duration, self.duration);
        set(&mut config.interval, self.interval);
        set(&mut config.otlp_endpoint, self.otlp_endpoint);
        set(&mut config.otlp_insecure, self.otlp_insecure);
        set(&mut config.otlp_insecure_skip_verify, self.otlp_insecure_skip_verify);
        set(&mut config.otlp_http, self.otlp_http);
        set(&mut config.otlp_http_url_path, self.otlp_http_url_path);
        merge_attributes(&mut config.otlp_header, &self.otlp_headers)?;
        merge_attributes(&mut config.otlp_attributes, &self.otlp_attributes)?;
        set(&mut config.service, self.service);
        merge_attributes(&mut config.telemetry_attributes, &self.telemetry_attributes)?;
        if !self.sensitive_data.is_empty() {
            config.sensitive_data = self.sensitive_data;
        }
        if self.ca_cert.is_some() {
            config.ca_cert = self.ca_cert;
        }
        set(&mut config.client_auth.mtls, self.mtls);
        if self.client_cert.is_some() {
            config.client_auth.client_cert = self.client_cert;
        }
        if self.client_key.is_some() {
            config.client_auth.client_key = self.client_key;
        }
        set(&mut config.mock_data, self.mock_data);
        set(&mut config.mock_seed, self.mock_seed);
        set(&mut config.terminal_output, self.terminal_output);
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct LogsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Log records per worker
    #[arg(long = "logs")]
    pub count: Option<u64>,

    /// Record body; may be a mock template
    #[arg(long)]
    pub body: Option<String>,

    /// Severity text, e.g. Info or Warn
    #[arg(long)]
    pub severity_text: Option<String>,

    /// Severity number in [1,24]; may be a mock template
    #[arg(long)]
    pub severity_number: Option<String>,

    /// Trace id (32 hex digits) to correlate records with
    #[arg(long)]
    pub trace_id: Option<String>,

    /// Span id (16 hex digits) to correlate records with
    #[arg(long)]
    pub span_id: Option<String>,
}

impl LogsArgs {
    pub fn apply(self, config: &mut LogsConfig) -> Result<(), ConfigError> {
        self.common.apply(&mut config.common)?;
        set(&mut config.count, self.count);
        set(&mut config.body, self.body);
        set(&mut config.severity_text, self.severity_text);
        set(&mut config.severity_number, self.severity_number);
        set(&mut config.trace_id, self.trace_id);
        set(&mut config.span_id, self.span_id);
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct MetricsArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Data points per worker
    #[arg(long = "metrics")]
    pub count: Option<u64>,

    /// Metric name
    #[arg(long)]
    pub metric_name: Option<String>,

    /// Gauge, Sum or Histogram
    #[arg(long)]
    pub metric_type: Option<MetricType>,

    /// delta or cumulative
    #[arg(long)]
    pub aggregation_temporality: Option<Temporality>,

    /// Trace id (32 hex digits) for exemplars
    #[arg(long)]
    pub trace_id: Option<String>,

    /// Span id (16 hex digits) for exemplars
    #[arg(long)]
    pub span_id: Option<String>,
}

impl MetricsArgs {
    pub fn apply(self, config: &mut MetricsConfig) -> Result<(), ConfigError> {
        self.common.apply(&mut config.common)?;
        set(&mut config.count, self.count);
        set(&mut config.metric_name, self.metric_name);
        set(&mut config.metric_type, self.metric_type);
        set(&mut config.aggregation_temporality, self.aggregation_temporality);
        set(&mut config.trace_id, self.trace_id);
        set(&mut config.span_id, self.span_id);
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct TracesArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Traces per worker
    #[arg(long = "traces")]
    pub count: Option<u64>,

    /// Child spans per trace
    #[arg(long)]
    pub child_spans: Option<usize>,

    /// Pass the parent context to children through traceparent headers
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub marshal: Option<bool>,

    /// Span status: Unset, Error, Ok (or 0, 1, 2)
    #[arg(long)]
    pub status_code: Option<String>,

    /// Export each trace in a single request
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub batch: Option<bool>,

    /// Number of 1 MiB attributes added to each parent span
    #[arg(long)]
    pub size: Option<usize>,

    /// Duration of each span, e.g. `123us`
    #[arg(long, value_parser = humantime::parse_duration)]
    pub span_duration: Option<Duration>,
}

impl TracesArgs {
    pub fn apply(self, config: &mut TracesConfig) -> Result<(), ConfigError> {
        self.common.apply(&mut config.common)?;
        set(&mut config.count, self.count);
        set(&mut config.child_spans, self.child_spans);
        set(&mut config.marshal, self.marshal);
        set(&mut config.status_code, self.status_code);
        set(&mut config.batch, self.batch);
        set(&mut config.size, self.size);
        set(&mut config.span_duration, self.span_duration);
        Ok(())
    }
}

/// A fully resolved command.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Logs(LogsConfig),
    Metrics(MetricsConfig),
    Traces(TracesConfig),
}

impl Invocation {
    pub fn common(&self) -> &Config {
        match self {
            Invocation::Logs(c) => &c.common,
            Invocation::Metrics(c) => &c.common,
            Invocation::Traces(c) => &c.common,
        }
    }

    /// Settings that differ from the defaults.
    pub fn overridden_values(&self) -> Vec<Override> {
        match self {
            Invocation::Logs(c) => config::overridden_values(c),
            Invocation::Metrics(c) => config::overridden_values(c),
            Invocation::Traces(c) => config::overridden_values(c),
        }
    }
}

fn load<T: DeserializeOwned + Default>(path: Option<&Path>, section: &str) -> Result<T, ConfigError> {
    match path {
        Some(path) => config::load_file(path, section),
        None => Ok(T::default()),
    }
}

impl Cli {
    /// Layers the config file and flags over the defaults.
    ///
    /// # Errors
    /// Fails when the config file can't be loaded or a flag is malformed.
    pub fn resolve(self) -> Result<Invocation, ConfigError> {
        let path = self.config.as_deref();
        let mut invocation = match self.command {
            Command::Logs(args) => {
                let mut config: LogsConfig = load(path, "logs")?;
                args.apply(&mut config)?;
                Invocation::Logs(config)
            }
            Command::Metrics(args) => {
                let mut config: MetricsConfig = load(path, "metrics")?;
                args.apply(&mut config)?;
                Invocation::Metrics(config)
            }
            Command::Traces(args) => {
                let mut config: TracesConfig = load(path, "traces")?;
                args.apply(&mut config)?;
                Invocation::Traces(config)
            }
        };
        if let Some(level) = self.log_level {
            let common = match &mut invocation {
                Invocation::Logs(c) => &mut c.common,
                Invocation::Metrics(c) => &mut c.common,
                Invocation::Traces(c) => &mut c.common,
            };
            common.log_level = level;
        }
        Ok(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;
    use clap::CommandFactory;

    fn resolve(args: &[&str]) -> Invocation {
        Cli::try_parse_from(args).unwrap().resolve().unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_without_flags() {
        let Invocation::Traces(config) = resolve(&["trazr-gen", "traces"]) else {
            panic!("expected traces");
        };
        assert_eq!(config, TracesConfig::default());
    }

    #[test]
    fn flags_are_applied() {
        let invocation = resolve(&[
            "trazr-gen",
            "--log-level",
            "debug",
            "logs",
            "--workers",
            "3",
            "--logs",
            "7",
            "--duration",
            "2m",
            "--otlp-http=false",
            "--mock-data",
            "--telemetry-attributes",
            "a=1,b=\"x\"",
            "--telemetry-attributes",
            r#"{"c": {"d": true}}"#,
            "--sensitive-data",
            "a,c.d",
            "--body",
            "hello",
        ]);
        let Invocation::Logs(config) = invocation else {
            panic!("expected logs");
        };
        assert_eq!(config.common.workers, 3);
        assert_eq!(config.count, 7);
        assert_eq!(config.common.duration, Duration::from_secs(120));
        assert!(!config.common.otlp_http);
        assert!(config.common.mock_data);
        assert_eq!(config.common.log_level, "debug");
        assert_eq!(config.common.sensitive_data, ["a", "c.d"]);
        assert_eq!(config.body, "hello");
        let attributes = &config.common.telemetry_attributes;
        assert_eq!(attributes.get("a"), Some(&Some(AttributeValue::Int(1))));
        assert_eq!(attributes.get("b"), Some(&Some(AttributeValue::String("x".into()))));
        assert_eq!(attributes.get("c.d"), Some(&Some(AttributeValue::Bool(true))));
    }

    #[test]
    fn metric_enums_parse_from_flags() {
        let Invocation::Metrics(config) = resolve(&[
            "trazr-gen",
            "metrics",
            "--metric-type",
            "histogram",
            "--aggregation-temporality",
            "delta",
        ]) else {
            panic!("expected metrics");
        };
        assert_eq!(config.metric_type, MetricType::Histogram);
        assert_eq!(config.aggregation_temporality, Temporality::Delta);
    }

    #[test]
    fn malformed_attribute_flags_fail() {
        let cli = Cli::try_parse_from(["trazr-gen", "logs", "--otlp-header", "novalue"]).unwrap();
        assert!(matches!(cli.resolve(), Err(ConfigError::InvalidKeyValue(_))));
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trazr.yaml");
        std::fs::write(&path, "workers: 2\nrate: 5\ntraces:\n  child-spans: 4\n  batch: false\n").unwrap();
        let path = path.to_str().unwrap();

        let Invocation::Traces(config) = resolve(&["trazr-gen", "--config", path, "traces", "--rate", "9"]) else {
            panic!("expected traces");
        };
        assert_eq!(config.common.workers, 2);
        assert_eq!(config.common.rate, 9.0);
        assert_eq!(config.child_spans, 4);
        assert!(!config.batch);

        let overridden: Vec<String> = Invocation::Traces(config).overridden_values().iter().map(|o| o.key.clone()).collect();
        assert_eq!(overridden, ["workers", "rate", "child-spans", "batch"]);
    }
}
