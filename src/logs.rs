// SPDX-License-Identifier: MIT
//! Log record generation.
//!
//! Every iteration emits one log record with the configured body and severity.
//! The body, the severity number and every telemetry attribute may be mock
//! templates; attributes are re-expanded for each record.
use std::sync::Arc;
use std::time::SystemTime;

use opentelemetry::trace::{SpanId, TraceId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attributes::{with_mock_marker, AttributeProcessor, AttributeSet, SERVICE_NAME_KEY};
use crate::config::{optional_span_id, optional_trace_id, AttributeMap, Config, ConfigError};
use crate::exporter::{Exporter, Signal};
use crate::otlp::OtlpExporter;
use crate::run::{self, GenerationError, RunOptions, RunSummary, Setup, SignalWorker, WorkerError};

/// Severity names, one per band of four numbers starting at 1.
const SEVERITY_BANDS: [&str; 6] = ["Trace", "Debug", "Info", "Warn", "Error", "Fatal"];

/// Attribute key listing the body among the mocked values.
pub const BODY_MOCK_KEY: &str = "body";

/// Settings of a logs run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogsConfig {
    #[serde(flatten)]
    pub common: Config,
    /// Records per worker; ignored when `duration` is set.
    #[serde(rename = "logs")]
    pub count: u64,
    pub body: String,
    pub severity_text: String,
    /// Kept as text so it can hold a mock template.
    pub severity_number: String,
    pub trace_id: String,
    pub span_id: String,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            common: Config::default(),
            count: 1,
            body: "Log message".to_owned(),
            severity_text: "Info".to_owned(),
            severity_number: "9".to_owned(),
            trace_id: String::new(),
            span_id: String::new(),
        }
    }
}

impl LogsConfig {
    /// # Errors
    /// Fails for unusable common settings, nothing to generate, or malformed ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.common.validate()?;
        self.common.require_work(Signal::Logs.name(), self.count)?;
        optional_trace_id(&self.trace_id)?;
        optional_span_id(&self.span_id)?;
        Ok(())
    }
}

/// Severity mismatch or out-of-range number.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeverityError {
    #[error("severity-number is out of range, the valid range is [1,24], got {0}")]
    OutOfRange(i64),
    #[error("severity-number {0:?} is not an integer")]
    NotANumber(String),
    #[error("severity text {text:?} does not match severity number {number}, the valid range is [{low},{high}]")]
    Mismatch { text: String, number: i32, low: i32, high: i32 },
}

/// A validated severity pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Severity {
    pub text: String,
    pub number: i32,
}

impl Severity {
    /// Checks `number` is in `1..=24` and that a band name in `text` matches it.
    /// An empty `text` is derived from `number`.
    ///
    /// Texts other than the six band names (`Trace`, `Debug`, `Info`, `Warn`,
    /// `Error`, `Fatal`) are taken as-is.
    ///
    /// # Errors
    /// Returns [`SeverityError`] for an out-of-range number or a mismatched band.
    pub fn resolve(text: &str, number: i64) -> Result<Self, SeverityError> {
        let number = i32::try_from(number)
            .ok()
            .filter(|n| (1..=24).contains(n))
            .ok_or(SeverityError::OutOfRange(number))?;
        if let Some(band) = SEVERITY_BANDS.iter().position(|name| *name == text) {
            let low = band as i32 * 4 + 1;
            let high = low + 3;
            if !(low..=high).contains(&number) {
                return Err(SeverityError::Mismatch {
                    text: text.to_owned(),
                    number,
                    low,
                    high,
                });
            }
        }
        let text = match text {
            "" => severity_name(number).unwrap_or_default(),
            text => text.to_owned(),
        };
        Ok(Self { text, number })
    }
}

/// Canonical name of a severity number: `Trace`, `Trace2` ... `Fatal4`.
pub fn severity_name(number: i32) -> Option<String> {
    if !(1..=24).contains(&number) {
        return None;
    }
    let base = SEVERITY_BANDS[(number as usize - 1) / 4];
    match (number - 1) % 4 + 1 {
        1 => Some(base.to_owned()),
        step => Some(format!("{base}{step}")),
    }
}

/// A generated log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    pub observed_timestamp: SystemTime,
    pub severity: Severity,
    pub body: String,
    pub attributes: AttributeSet,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
}

struct LogWorker {
    body: String,
    severity_text: String,
    severity_number: String,
    trace_id: Option<TraceId>,
    span_id: Option<SpanId>,
    service: String,
    attributes: Arc<AttributeMap>,
    processor: AttributeProcessor,
}

impl SignalWorker for LogWorker {
    type Record = LogRecord;

    fn generate(&mut self) -> Result<Vec<LogRecord>, WorkerError> {
        let mut expanded = self.processor.expand(&self.attributes)?;
        if !expanded.attributes.contains(SERVICE_NAME_KEY) {
            expanded.attributes.insert(SERVICE_NAME_KEY, self.service.as_str());
        }
        let body = match self.processor.expand_text(&self.body)? {
            Some(body) => {
                expanded.mocked.push(BODY_MOCK_KEY.to_owned());
                body
            }
            None => self.body.clone(),
        };
        let number_text = self
            .processor
            .expand_text(&self.severity_number)?
            .unwrap_or_else(|| self.severity_number.clone());
        let number = number_text
            .trim()
            .parse::<i64>()
            .map_err(|_| SeverityError::NotANumber(number_text.clone()))?;
        let severity = Severity::resolve(&self.severity_text, number)?;

        let now = SystemTime::now();
        Ok(vec![LogRecord {
            timestamp: now,
            observed_timestamp: now,
            severity,
            body,
            attributes: with_mock_marker(expanded.attributes, &expanded.mocked),
            trace_id: self.trace_id,
            span_id: self.span_id,
        }])
    }
}

/// Generates logs into `exporter` and shuts it down when done.
///
/// # Errors
/// Fails before any worker starts when the configuration is invalid or the
/// resource attributes can't be built; the exporter is still shut down.
pub async fn run(
    config: &LogsConfig,
    exporter: Arc<dyn Exporter<LogRecord>>,
    options: RunOptions,
) -> Result<RunSummary, GenerationError> {
    let prepared = config
        .validate()
        .map_err(GenerationError::from)
        .and_then(|()| Ok((Setup::new(&config.common, &options)?, ids(config)?)));
    let (setup, (trace_id, span_id)) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => return Err(run::abort(exporter.as_ref(), err).await),
    };

    let Setup {
        config: common,
        processor,
        resource,
        attributes,
    } = setup;
    let summary = run::execute(
        Signal::Logs,
        &common,
        config.count,
        resource,
        exporter,
        &options,
        |_| LogWorker {
            body: config.body.clone(),
            severity_text: config.severity_text.clone(),
            severity_number: config.severity_number.clone(),
            trace_id,
            span_id,
            service: common.service.clone(),
            attributes: Arc::clone(&attributes),
            processor: processor.clone(),
        },
    )
    .await;
    Ok(summary)
}

fn ids(config: &LogsConfig) -> Result<(Option<TraceId>, Option<SpanId>), ConfigError> {
    Ok((optional_trace_id(&config.trace_id)?, optional_span_id(&config.span_id)?))
}

/// Validates `config`, connects the OTLP exporter and runs to completion.
///
/// # Errors
/// See [`run`]; also fails when the exporter can't be created.
pub async fn start(config: LogsConfig, mut options: RunOptions) -> Result<RunSummary, GenerationError> {
    config.validate()?;
    options.mock = options.mock_engine(&config.common);
    let processor = AttributeProcessor::new(options.mock.clone());
    let headers = processor.build_headers(&config.common.otlp_header)?;
    let exporter = OtlpExporter::new(&config.common, Signal::Logs, &headers)?;
    info!(workers = config.common.workers, logs = config.count, "starting the logs generator");
    options.console.println("Starting logs generator");
    run(&config, Arc::new(exporter), options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{AttributeValue, MOCK_DATA_KEY};
    use crate::exporter::InMemoryExporter;
    use crate::mock::MockEngine;

    fn sink(exporter: &Arc<InMemoryExporter<LogRecord>>) -> Arc<dyn Exporter<LogRecord>> {
        exporter.clone()
    }

    fn config() -> LogsConfig {
        let mut config = LogsConfig::default();
        config.common.rate = 0.0;
        config.common.mock_data = false;
        config
    }

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::resolve("Info", 9).unwrap().number, 9);
        assert_eq!(Severity::resolve("Info", 12).unwrap().text, "Info");
        assert_eq!(Severity::resolve("Custom", 2).unwrap().text, "Custom");
        for number in 1..=24 {
            let derived = Severity::resolve("", number).unwrap().text;
            let band = SEVERITY_BANDS[(number as usize - 1) / 4];
            assert!(derived.starts_with(band), "{number} => {derived}");
        }
        assert_eq!(Severity::resolve("", 9).unwrap().text, "Info");
        assert_eq!(
            Severity::resolve("Error", 9),
            Err(SeverityError::Mismatch {
                text: "Error".into(),
                number: 9,
                low: 17,
                high: 20
            })
        );
        assert_eq!(Severity::resolve("Info", 0), Err(SeverityError::OutOfRange(0)));
        assert_eq!(Severity::resolve("Info", 25), Err(SeverityError::OutOfRange(25)));
        assert_eq!(
            Severity::resolve("Warn", 3).unwrap_err().to_string(),
            "severity text \"Warn\" does not match severity number 3, the valid range is [13,16]"
        );
    }

    #[test]
    fn severity_names() {
        assert_eq!(severity_name(1).as_deref(), Some("Trace"));
        assert_eq!(severity_name(9).as_deref(), Some("Info"));
        assert_eq!(severity_name(14).as_deref(), Some("Warn2"));
        assert_eq!(severity_name(24).as_deref(), Some("Fatal4"));
        assert_eq!(severity_name(25), None);
    }

    #[test]
    fn validation() {
        let mut config = LogsConfig::default();
        assert!(config.validate().is_ok());
        config.count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NothingToGenerate("logs"))));
        config.common.duration = std::time::Duration::from_secs(1);
        assert!(config.validate().is_ok());
        config.trace_id = "abc".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTraceId { .. })));
    }

    #[tokio::test]
    async fn custom_body_single_record() {
        let mut config = config();
        config.body = "custom body".into();
        let exporter = Arc::new(InMemoryExporter::new());
        let summary = run(&config, sink(&exporter), RunOptions::default()).await.unwrap();

        assert_eq!(summary.generated, 1);
        let records = exporter.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, "custom body");
        assert_eq!(records[0].severity, Severity { text: "Info".into(), number: 9 });
        assert_eq!(
            records[0].attributes.get(SERVICE_NAME_KEY),
            Some(&AttributeValue::String("trazr-gen".into()))
        );
        assert_eq!(exporter.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn templated_body_and_severity() {
        let mut config = config();
        config.common.mock_data = true;
        config.body = "order {{UUID}}".into();
        config.severity_text = "Warn".into();
        config.severity_number = "{{Number 13 16}}".into();
        config.common.telemetry_attributes.insert("user", "{{FirstName}}");
        config.count = 5;
        let options = RunOptions {
            mock: Some(Arc::new(MockEngine::new(21))),
            ..RunOptions::default()
        };
        let exporter = Arc::new(InMemoryExporter::new());
        run(&config, sink(&exporter), options).await.unwrap();

        for record in exporter.records() {
            assert!(record.body.starts_with("order "));
            assert!((13..=16).contains(&record.severity.number));
            assert_eq!(
                record.attributes.get(MOCK_DATA_KEY),
                Some(&AttributeValue::String("user,body".into()))
            );
        }
    }

    #[tokio::test]
    async fn trace_context_is_attached() {
        let mut config = config();
        config.trace_id = "0af7651916cd43dd8448eb211c80319c".into();
        config.span_id = "b7ad6b7169203331".into();
        let exporter = Arc::new(InMemoryExporter::new());
        run(&config, sink(&exporter), RunOptions::default()).await.unwrap();

        let record = &exporter.records()[0];
        assert_eq!(record.trace_id.map(|id| id.to_string()).as_deref(), Some("0af7651916cd43dd8448eb211c80319c"));
        assert_eq!(record.span_id.map(|id| id.to_string()).as_deref(), Some("b7ad6b7169203331"));
    }

    #[tokio::test]
    async fn bad_severity_stops_workers() {
        let mut config = config();
        config.severity_number = "40".into();
        let exporter = Arc::new(InMemoryExporter::new());
        let summary = run(&config, sink(&exporter), RunOptions::default()).await.unwrap();
        assert_eq!(summary.failed_workers, 1);
        assert!(exporter.records().is_empty());
    }

    #[tokio::test]
    async fn template_errors_stop_only_the_failing_workers() {
        let mut config = config();
        config.count = 3;
        config.common.workers = 3;
        config.common.mock_data = true;
        config.common.telemetry_attributes = AttributeMap::parse_flag("user={{Nope}}").unwrap();
        let exporter = Arc::new(InMemoryExporter::new());
        let summary = run(&config, sink(&exporter), RunOptions::default()).await.unwrap();
        assert_eq!(summary, RunSummary { generated: 0, failed_workers: 3 });
        assert!(exporter.records().is_empty());
        assert_eq!(exporter.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn resource_template_errors_abort_the_run() {
        for template in ["{{Nope}}", "{{Float64Range 0 1e309}}"] {
            let mut config = config();
            config.common.mock_data = true;
            config.common.otlp_attributes.insert("r", AttributeValue::String(template.into()));
            let exporter = Arc::new(InMemoryExporter::new());
            let err = run(&config, sink(&exporter), RunOptions::default()).await.unwrap_err();
            assert!(matches!(err, GenerationError::Attributes(_)), "{template}: {err}");
            assert_eq!(exporter.shutdown_count(), 1, "{template}");
            assert_eq!(exporter.batches().len(), 0);
        }
    }

    #[tokio::test]
    async fn invalid_config_still_shuts_the_exporter_down() {
        let mut config = config();
        config.count = 0;
        let exporter = Arc::new(InMemoryExporter::new());
        let err = run(&config, sink(&exporter), RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Config(ConfigError::NothingToGenerate(_))));
        assert_eq!(exporter.shutdown_count(), 1);
    }
}
