// SPDX-License-Identifier: MIT
//! Trace generation.
//!
//! Every iteration emits one trace: a client span `lets-go` with `child-spans`
//! server children `okey-dokey-0`, `okey-dokey-1`, ... laid out back to back:
//!
//! ```text
//! lets-go       [t0 ............................... t0+(n+1)d]
//! okey-dokey-0       [t0+d .. t0+2d]
//! okey-dokey-1                      [t0+2d .. t0+3d]
//! ```
//!
//! With `marshal` enabled the parent context makes a round trip through W3C
//! `traceparent` headers before the children are created, as it would between
//! two services, and the children record a remote parent.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, SpanId, SpanKind, Status, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attributes::{AttributeProcessor, AttributeSet};
use crate::config::{AttributeMap, Config, ConfigError};
use crate::exporter::{Exporter, Signal};
use crate::otlp::OtlpExporter;
use crate::run::{self, GenerationError, RunOptions, RunSummary, Setup, SignalWorker, WorkerError};

pub const PARENT_SPAN_NAME: &str = "lets-go";
pub const CHILD_SPAN_PREFIX: &str = "okey-dokey-";
/// Size of each `load-N` padding attribute. The content is filler text; only
/// the payload size matters.
pub const LOAD_ATTRIBUTE_BYTES: usize = 1024 * 1024;

/// Settings of a traces run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TracesConfig {
    #[serde(flatten)]
    pub common: Config,
    /// Traces per worker; ignored when `duration` is set.
    #[serde(rename = "traces")]
    pub count: u64,
    /// Children per trace, at least one is always generated.
    pub child_spans: usize,
    /// Propagate the parent context through `traceparent` headers.
    pub marshal: bool,
    pub status_code: String,
    /// Export each trace in one call rather than span by span.
    pub batch: bool,
    /// Adds `size` attributes of 1 MiB each to the parent span.
    pub size: usize,
    #[serde(with = "humantime_serde")]
    pub span_duration: Duration,
}

impl Default for TracesConfig {
    fn default() -> Self {
        Self {
            common: Config::default(),
            count: 1,
            child_spans: 1,
            marshal: false,
            status_code: "0".to_owned(),
            batch: true,
            size: 0,
            span_duration: Duration::from_micros(123),
        }
    }
}

impl TracesConfig {
    /// # Errors
    /// Fails for unusable common settings, nothing to generate, or an unknown
    /// status code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.common.validate()?;
        self.common.require_work(Signal::Traces.name(), self.count)?;
        parse_status_code(&self.status_code)?;
        Ok(())
    }
}

/// Parses `Unset`/`Error`/`Ok` (any case) or `0`/`1`/`2`. Empty means unset.
///
/// # Errors
/// Returns [`ConfigError::InvalidStatusCode`] for anything else.
pub fn parse_status_code(code: &str) -> Result<Status, ConfigError> {
    match code.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "unset" => Ok(Status::Unset),
        "1" | "error" => Ok(Status::error("")),
        "2" | "ok" => Ok(Status::Ok),
        _ => Err(ConfigError::InvalidStatusCode(code.to_owned())),
    }
}

/// A finished span.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    /// The parent context arrived through propagation.
    pub remote_parent: bool,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub status: Status,
    pub attributes: AttributeSet,
}

struct TraceWorker {
    child_spans: usize,
    marshal: bool,
    batch: bool,
    size: usize,
    span_duration: Duration,
    status: Status,
    attributes: Arc<AttributeMap>,
    processor: AttributeProcessor,
    ids: RandomIdGenerator,
    propagator: TraceContextPropagator,
    load: Option<Arc<str>>,
}

impl TraceWorker {
    fn new(config: &TracesConfig, status: Status, setup: &Setup, load: Option<Arc<str>>) -> Self {
        Self {
            child_spans: config.child_spans.max(1),
            marshal: config.marshal,
            batch: config.batch,
            size: config.size,
            span_duration: config.span_duration,
            status,
            attributes: Arc::clone(&setup.attributes),
            processor: setup.processor.clone(),
            ids: RandomIdGenerator::default(),
            propagator: TraceContextPropagator::new(),
            load,
        }
    }

    /// The parent as seen by its children.
    fn child_parent(&self, trace_id: TraceId, span_id: SpanId) -> (TraceId, SpanId, bool) {
        if !self.marshal {
            return (trace_id, span_id, false);
        }
        let span_context = SpanContext::new(trace_id, span_id, TraceFlags::SAMPLED, false, TraceState::default());
        let cx = Context::new().with_remote_span_context(span_context);
        let mut carrier: HashMap<String, String> = HashMap::new();
        self.propagator.inject_context(&cx, &mut carrier);
        let extracted = self.propagator.extract(&carrier);
        let remote = extracted.span().span_context().clone();
        if remote.is_valid() {
            (remote.trace_id(), remote.span_id(), remote.is_remote())
        } else {
            (trace_id, span_id, false)
        }
    }

    fn parent_attributes(&self, telemetry: AttributeSet) -> AttributeSet {
        let mut attributes = AttributeSet::with_capacity(2 + self.size + telemetry.len());
        attributes.insert("net.sock.peer.addr", "1.2.3.4");
        attributes.insert("peer.service", "trazr-gen-server");
        if let Some(load) = &self.load {
            for j in 0..self.size {
                attributes.insert(format!("load-{j}"), &**load);
            }
        }
        attributes.extend(telemetry);
        attributes
    }

    fn child_attributes(telemetry: AttributeSet) -> AttributeSet {
        let mut attributes = AttributeSet::with_capacity(2 + telemetry.len());
        attributes.insert("net.sock.peer.addr", "1.2.3.4");
        attributes.insert("peer.service", "trazr-gen-client");
        attributes.extend(telemetry);
        attributes
    }
}

impl SignalWorker for TraceWorker {
    type Record = SpanRecord;

    fn generate(&mut self) -> Result<Vec<SpanRecord>, WorkerError> {
        let trace_id = self.ids.new_trace_id();
        let parent_id = self.ids.new_span_id();
        let start = SystemTime::now();
        let (child_trace_id, child_parent_id, remote_parent) = self.child_parent(trace_id, parent_id);

        let mut spans = Vec::with_capacity(self.child_spans + 1);
        let mut child_start = start + self.span_duration;
        for j in 0..self.child_spans {
            // each span gets its own expansion of the templates
            let telemetry = self.processor.build(&self.attributes)?;
            let child_end = child_start + self.span_duration;
            spans.push(SpanRecord {
                trace_id: child_trace_id,
                span_id: self.ids.new_span_id(),
                parent_span_id: Some(child_parent_id),
                remote_parent,
                name: format!("{CHILD_SPAN_PREFIX}{j}"),
                kind: SpanKind::Server,
                start_time: child_start,
                end_time: child_end,
                status: self.status.clone(),
                attributes: Self::child_attributes(telemetry),
            });
            child_start = child_end;
        }
        let telemetry = self.processor.build(&self.attributes)?;
        spans.push(SpanRecord {
            trace_id,
            span_id: parent_id,
            parent_span_id: None,
            remote_parent: false,
            name: PARENT_SPAN_NAME.to_owned(),
            kind: SpanKind::Client,
            start_time: start,
            end_time: child_start,
            status: self.status.clone(),
            attributes: self.parent_attributes(telemetry),
        });
        Ok(spans)
    }

    fn export_individually(&self) -> bool {
        !self.batch
    }
}

/// Generates traces into `exporter` and shuts it down when done.
///
/// # Errors
/// Fails before any worker starts when the configuration is invalid or the
/// resource attributes can't be built; the exporter is still shut down.
pub async fn run(
    config: &TracesConfig,
    exporter: Arc<dyn Exporter<SpanRecord>>,
    options: RunOptions,
) -> Result<RunSummary, GenerationError> {
    let prepared = config.validate().map_err(GenerationError::from).and_then(|()| {
        let status = parse_status_code(&config.status_code)?;
        Ok((Setup::new(&config.common, &options)?, status))
    });
    let (setup, status) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => return Err(run::abort(exporter.as_ref(), err).await),
    };

    let load: Option<Arc<str>> = (config.size > 0).then(|| "x".repeat(LOAD_ATTRIBUTE_BYTES).into());
    let summary = run::execute(
        Signal::Traces,
        &setup.config,
        config.count,
        setup.resource.clone(),
        exporter,
        &options,
        |_| TraceWorker::new(config, status.clone(), &setup, load.clone()),
    )
    .await;
    Ok(summary)
}

/// Validates `config`, connects the OTLP exporter and runs to completion.
///
/// # Errors
/// See [`run`]; also fails when the exporter can't be created.
pub async fn start(config: TracesConfig, mut options: RunOptions) -> Result<RunSummary, GenerationError> {
    config.validate()?;
    options.mock = options.mock_engine(&config.common);
    let processor = AttributeProcessor::new(options.mock.clone());
    let headers = processor.build_headers(&config.common.otlp_header)?;
    let exporter = OtlpExporter::new(&config.common, Signal::Traces, &headers)?;
    info!(
        workers = config.common.workers,
        traces = config.count,
        child_spans = config.child_spans,
        batch = config.batch,
        "starting the traces generator"
    );
    options.console.println("Starting traces generator");
    run(&config, Arc::new(exporter), options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;
    use crate::exporter::InMemoryExporter;

    fn sink(exporter: &Arc<InMemoryExporter<SpanRecord>>) -> Arc<dyn Exporter<SpanRecord>> {
        exporter.clone()
    }

    fn config() -> TracesConfig {
        let mut config = TracesConfig::default();
        config.common.rate = 0.0;
        config.common.mock_data = false;
        config
    }

    async fn export(config: &TracesConfig) -> Arc<InMemoryExporter<SpanRecord>> {
        let exporter = Arc::new(InMemoryExporter::new());
        run(config, sink(&exporter), RunOptions::default()).await.unwrap();
        exporter
    }

    #[test]
    fn status_codes() {
        assert_eq!(parse_status_code("").unwrap(), Status::Unset);
        assert_eq!(parse_status_code("Unset").unwrap(), Status::Unset);
        assert_eq!(parse_status_code("1").unwrap(), Status::error(""));
        assert_eq!(parse_status_code("ERROR").unwrap(), Status::error(""));
        assert_eq!(parse_status_code("ok").unwrap(), Status::Ok);
        let err = parse_status_code("maybe").unwrap_err();
        assert_eq!(
            err.to_string(),
            "expected `status-code` to be one of (Unset, Error, Ok) or (0, 1, 2), got \"maybe\" instead"
        );
    }

    #[tokio::test]
    async fn one_trace_per_export_when_batched() {
        let mut config = config();
        config.count = 2;
        config.child_spans = 2;
        config.span_duration = Duration::from_millis(10);
        let exporter = export(&config).await;

        let batches = exporter.batches();
        assert_eq!(batches.len(), 2);
        for spans in &batches {
            let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, ["okey-dokey-0", "okey-dokey-1", "lets-go"]);

            let parent = &spans[2];
            assert_eq!(parent.kind, SpanKind::Client);
            assert_eq!(parent.parent_span_id, None);
            assert_eq!(parent.end_time.duration_since(parent.start_time).unwrap(), Duration::from_millis(30));
            assert_eq!(spans[0].start_time, parent.start_time + Duration::from_millis(10));
            assert_eq!(spans[1].start_time, spans[0].end_time);
            assert_eq!(spans[1].end_time, parent.end_time);
            for child in &spans[..2] {
                assert_eq!(child.kind, SpanKind::Server);
                assert_eq!(child.trace_id, parent.trace_id);
                assert_eq!(child.parent_span_id, Some(parent.span_id));
                assert!(!child.remote_parent);
                assert_eq!(
                    child.attributes.get("peer.service"),
                    Some(&AttributeValue::String("trazr-gen-client".into()))
                );
            }
        }
        assert_ne!(batches[0][2].trace_id, batches[1][2].trace_id);
    }

    #[tokio::test]
    async fn unbatched_traces_export_span_by_span() {
        let mut config = config();
        config.batch = false;
        config.child_spans = 3;
        let exporter = export(&config).await;
        let batches = exporter.batches();
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.len() == 1));
    }

    #[tokio::test]
    async fn zero_children_still_generates_one() {
        let mut config = config();
        config.child_spans = 0;
        let exporter = export(&config).await;
        assert_eq!(exporter.records().len(), 2);
    }

    #[tokio::test]
    async fn marshaled_children_have_a_remote_parent() {
        let mut config = config();
        config.marshal = true;
        config.status_code = "error".into();
        let exporter = export(&config).await;
        let spans = exporter.records();
        let (child, parent) = (&spans[0], &spans[1]);
        assert!(child.remote_parent);
        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_span_id, Some(parent.span_id));
        assert_eq!(child.status, Status::error(""));
    }

    #[tokio::test]
    async fn size_pads_the_parent() {
        let mut config = config();
        config.size = 2;
        let exporter = export(&config).await;
        let spans = exporter.records();
        let parent = spans.last().unwrap();
        for key in ["load-0", "load-1"] {
            let value = parent.attributes.get(key).and_then(AttributeValue::as_str).unwrap();
            assert_eq!(value.len(), LOAD_ATTRIBUTE_BYTES);
        }
        assert!(spans[0].attributes.get("load-0").is_none());
    }

    #[tokio::test]
    async fn every_span_expands_templates_on_its_own() {
        use crate::attributes::MOCK_DATA_KEY;
        use crate::mock::MockEngine;

        let mut config = config();
        config.child_spans = 5;
        config.common.mock_data = true;
        config.common.telemetry_attributes = AttributeMap::parse_flag("n={{Number 1 1000000000}}").unwrap();
        let exporter = Arc::new(InMemoryExporter::new());
        let options = RunOptions {
            mock: Some(Arc::new(MockEngine::new(11))),
            ..RunOptions::default()
        };
        run(&config, sink(&exporter), options).await.unwrap();

        let spans = exporter.records();
        assert_eq!(spans.len(), 6);
        let mut values: Vec<i64> = spans
            .iter()
            .map(|span| {
                assert_eq!(span.attributes.get(MOCK_DATA_KEY).and_then(AttributeValue::as_str), Some("n"));
                match span.attributes.get("n") {
                    Some(AttributeValue::Int(n)) => *n,
                    other => panic!("expected an integer, got {other:?}"),
                }
            })
            .collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 6, "{values:?}");
    }

    #[tokio::test]
    async fn invalid_status_is_rejected_before_running() {
        let mut config = config();
        config.status_code = "3".into();
        let exporter = Arc::new(InMemoryExporter::new());
        let err = run(&config, sink(&exporter), RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, GenerationError::Config(ConfigError::InvalidStatusCode(_))));
        assert_eq!(exporter.shutdown_count(), 1);
    }
}
