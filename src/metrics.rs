// SPDX-License-Identifier: MIT
//! Metric data point generation.
//!
//! Every iteration emits one data point for the configured metric:
//!
//! * `Gauge` – the worker's iteration number.
//! * `Sum` – monotonic; cumulative points carry the running total since the
//!   worker started, delta points carry `1` since the previous point.
//! * `Histogram` – a handful of random samples in `[0, 10)` bucketed on the
//!   bounds `1..=9`; cumulative points accumulate, delta points reset.
//!
//! When a trace id or span id is configured, each point carries one exemplar
//! pointing at it.
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use opentelemetry::trace::{SpanId, TraceId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attributes::{AttributeProcessor, AttributeSet};
use crate::config::{optional_span_id, optional_trace_id, AttributeMap, Config, ConfigError};
use crate::exporter::{Exporter, Signal};
use crate::otlp::OtlpExporter;
use crate::run::{self, GenerationError, RunOptions, RunSummary, Setup, SignalWorker, WorkerError};

/// Upper bounds of the histogram buckets; the last bucket is unbounded.
pub const HISTOGRAM_BOUNDS: [f64; 9] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
const MAX_SAMPLES_PER_POINT: usize = 10;

/// Instrument kind of the generated metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricType {
    #[default]
    Gauge,
    Sum,
    Histogram,
}

impl FromStr for MetricType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gauge" => Ok(Self::Gauge),
            "sum" => Ok(Self::Sum),
            "histogram" => Ok(Self::Histogram),
            _ => Err(ConfigError::InvalidMetricType(s.to_owned())),
        }
    }
}

impl TryFrom<String> for MetricType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricType> for String {
    fn from(value: MetricType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gauge => "Gauge",
            Self::Sum => "Sum",
            Self::Histogram => "Histogram",
        })
    }
}

/// Aggregation temporality of Sum and Histogram points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Temporality {
    Delta,
    #[default]
    Cumulative,
}

impl FromStr for Temporality {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "delta" => Ok(Self::Delta),
            "cumulative" => Ok(Self::Cumulative),
            _ => Err(ConfigError::InvalidTemporality(s.to_owned())),
        }
    }
}

impl TryFrom<String> for Temporality {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Temporality> for String {
    fn from(value: Temporality) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Temporality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Delta => "delta",
            Self::Cumulative => "cumulative",
        })
    }
}

/// Settings of a metrics run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct MetricsConfig {
    #[serde(flatten)]
    pub common: Config,
    /// Data points per worker; ignored when `duration` is set.
    #[serde(rename = "metrics")]
    pub count: u64,
    pub metric_name: String,
    pub metric_type: MetricType,
    pub aggregation_temporality: Temporality,
    pub trace_id: String,
    pub span_id: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            common: Config::default(),
            count: 1,
            metric_name: "gen".to_owned(),
            metric_type: MetricType::Gauge,
            aggregation_temporality: Temporality::Cumulative,
            trace_id: String::new(),
            span_id: String::new(),
        }
    }
}

impl MetricsConfig {
    /// # Errors
    /// Fails for unusable common settings, nothing to generate, or malformed ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.common.validate()?;
        self.common.require_work(Signal::Metrics.name(), self.count)?;
        optional_trace_id(&self.trace_id)?;
        optional_span_id(&self.span_id)?;
        Ok(())
    }
}

/// Links a data point to a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Exemplar {
    pub value: i64,
    pub time: SystemTime,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramPoint {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub bounds: Vec<f64>,
    /// One more entry than `bounds`.
    pub bucket_counts: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricData {
    Gauge(i64),
    Sum {
        value: i64,
        temporality: Temporality,
        monotonic: bool,
    },
    Histogram {
        point: HistogramPoint,
        temporality: Temporality,
    },
}

/// A generated data point.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub start_time: SystemTime,
    pub time: SystemTime,
    pub data: MetricData,
    pub attributes: AttributeSet,
    pub exemplars: Vec<Exemplar>,
}

#[derive(Debug)]
struct HistogramState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    buckets: Vec<u64>,
}

impl HistogramState {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            buckets: vec![0; HISTOGRAM_BOUNDS.len() + 1],
        }
    }

    fn observe(&mut self, value: f64) {
        let bucket = HISTOGRAM_BOUNDS
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(HISTOGRAM_BOUNDS.len());
        self.buckets[bucket] += 1;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn snapshot(&self) -> HistogramPoint {
        HistogramPoint {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            bounds: HISTOGRAM_BOUNDS.to_vec(),
            bucket_counts: self.buckets.clone(),
        }
    }
}

struct MetricWorker {
    name: String,
    metric_type: MetricType,
    temporality: Temporality,
    exemplar_ids: Option<(Option<TraceId>, Option<SpanId>)>,
    attributes: Arc<AttributeMap>,
    processor: AttributeProcessor,
    started: SystemTime,
    previous: SystemTime,
    iteration: i64,
    histogram: HistogramState,
}

impl MetricWorker {
    fn new(config: &MetricsConfig, ids: (Option<TraceId>, Option<SpanId>), setup: &Setup) -> Self {
        let now = SystemTime::now();
        Self {
            name: config.metric_name.clone(),
            metric_type: config.metric_type,
            temporality: config.aggregation_temporality,
            exemplar_ids: (ids.0.is_some() || ids.1.is_some()).then_some(ids),
            attributes: Arc::clone(&setup.attributes),
            processor: setup.processor.clone(),
            started: now,
            previous: now,
            iteration: 0,
            histogram: HistogramState::new(),
        }
    }

    /// Data and start time of the next point.
    fn next_data(&mut self, now: SystemTime) -> (MetricData, SystemTime) {
        let since = match self.temporality {
            Temporality::Cumulative => self.started,
            Temporality::Delta => self.previous,
        };
        match self.metric_type {
            MetricType::Gauge => (MetricData::Gauge(self.iteration), now),
            MetricType::Sum => {
                let value = match self.temporality {
                    Temporality::Cumulative => self.iteration,
                    Temporality::Delta => 1,
                };
                let data = MetricData::Sum {
                    value,
                    temporality: self.temporality,
                    monotonic: true,
                };
                (data, since)
            }
            MetricType::Histogram => {
                if self.temporality == Temporality::Delta {
                    self.histogram = HistogramState::new();
                }
                let mut rng = rand::rng();
                for _ in 0..rng.random_range(1..=MAX_SAMPLES_PER_POINT) {
                    self.histogram.observe(rng.random_range(0.0..10.0));
                }
                let data = MetricData::Histogram {
                    point: self.histogram.snapshot(),
                    temporality: self.temporality,
                };
                (data, since)
            }
        }
    }
}

impl SignalWorker for MetricWorker {
    type Record = MetricPoint;

    fn generate(&mut self) -> Result<Vec<MetricPoint>, WorkerError> {
        let attributes = self.processor.build(&self.attributes)?;
        self.iteration += 1;
        let now = SystemTime::now();
        let (data, start_time) = self.next_data(now);
        self.previous = now;
        let exemplars = self
            .exemplar_ids
            .map(|(trace_id, span_id)| Exemplar {
                value: 1,
                time: now,
                trace_id,
                span_id,
            })
            .into_iter()
            .collect();
        Ok(vec![MetricPoint {
            name: self.name.clone(),
            start_time,
            time: now,
            data,
            attributes,
            exemplars,
        }])
    }
}

/// Generates metrics into `exporter` and shuts it down when done.
///
/// # Errors
/// Fails before any worker starts when the configuration is invalid or the
/// resource attributes can't be built; the exporter is still shut down.
pub async fn run(
    config: &MetricsConfig,
    exporter: Arc<dyn Exporter<MetricPoint>>,
    options: RunOptions,
) -> Result<RunSummary, GenerationError> {
    let prepared = config.validate().map_err(GenerationError::from).and_then(|()| {
        let ids = (optional_trace_id(&config.trace_id)?, optional_span_id(&config.span_id)?);
        Ok((Setup::new(&config.common, &options)?, ids))
    });
    let (setup, ids) = match prepared {
        Ok(prepared) => prepared,
        Err(err) => return Err(run::abort(exporter.as_ref(), err).await),
    };

    let summary = run::execute(
        Signal::Metrics,
        &setup.config,
        config.count,
        setup.resource.clone(),
        exporter,
        &options,
        |_| MetricWorker::new(config, ids, &setup),
    )
    .await;
    Ok(summary)
}

/// Validates `config`, connects the OTLP exporter and runs to completion.
///
/// # Errors
/// See [`run`]; also fails when the exporter can't be created.
pub async fn start(config: MetricsConfig, mut options: RunOptions) -> Result<RunSummary, GenerationError> {
    config.validate()?;
    options.mock = options.mock_engine(&config.common);
    let processor = AttributeProcessor::new(options.mock.clone());
    let headers = processor.build_headers(&config.common.otlp_header)?;
    let exporter = OtlpExporter::new(&config.common, Signal::Metrics, &headers)?;
    info!(
        workers = config.common.workers,
        metrics = config.count,
        metric_type = %config.metric_type,
        "starting the metrics generator"
    );
    options.console.println("Starting metrics generator");
    run(&config, Arc::new(exporter), options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;

    fn sink(exporter: &Arc<InMemoryExporter<MetricPoint>>) -> Arc<dyn Exporter<MetricPoint>> {
        exporter.clone()
    }

    fn config(metric_type: MetricType, temporality: Temporality, count: u64) -> MetricsConfig {
        let mut config = MetricsConfig {
            count,
            metric_type,
            aggregation_temporality: temporality,
            ..MetricsConfig::default()
        };
        config.common.rate = 0.0;
        config.common.mock_data = false;
        config
    }

    async fn points(config: &MetricsConfig) -> Vec<MetricPoint> {
        let exporter = Arc::new(InMemoryExporter::new());
        run(config, sink(&exporter), RunOptions::default()).await.unwrap();
        exporter.records()
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("histogram".parse::<MetricType>().unwrap(), MetricType::Histogram);
        assert_eq!("SUM".parse::<MetricType>().unwrap(), MetricType::Sum);
        assert!("counter".parse::<MetricType>().is_err());
        assert_eq!("Delta".parse::<Temporality>().unwrap(), Temporality::Delta);
        assert!("sometimes".parse::<Temporality>().is_err());
    }

    #[test]
    fn yaml_uses_metric_names() {
        let config: MetricsConfig = crate::config::from_yaml_str(
            "metrics:\n  metrics: 3\n  metric-type: sum\n  aggregation-temporality: delta\n",
            "metrics",
        )
        .unwrap();
        assert_eq!(config.count, 3);
        assert_eq!(config.metric_type, MetricType::Sum);
        assert_eq!(config.aggregation_temporality, Temporality::Delta);
    }

    #[test]
    fn histogram_buckets_use_upper_inclusive_bounds() {
        let mut state = HistogramState::new();
        for value in [0.5, 1.0, 1.5, 9.5] {
            state.observe(value);
        }
        let point = state.snapshot();
        assert_eq!(point.count, 4);
        assert_eq!(point.sum, 12.5);
        assert_eq!(point.min, 0.5);
        assert_eq!(point.max, 9.5);
        assert_eq!(point.bucket_counts, vec![2, 1, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn gauge_counts_iterations() {
        let points = points(&config(MetricType::Gauge, Temporality::Cumulative, 3)).await;
        let values: Vec<_> = points.iter().map(|p| p.data.clone()).collect();
        assert_eq!(values, vec![MetricData::Gauge(1), MetricData::Gauge(2), MetricData::Gauge(3)]);
        assert!(points.iter().all(|p| p.name == "gen" && p.exemplars.is_empty()));
    }

    #[tokio::test]
    async fn cumulative_sums_grow_from_a_fixed_start() {
        let points = points(&config(MetricType::Sum, Temporality::Cumulative, 3)).await;
        let values: Vec<i64> = points
            .iter()
            .map(|p| match p.data {
                MetricData::Sum { value, monotonic: true, .. } => value,
                ref other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(points.iter().all(|p| p.start_time == points[0].start_time));
    }

    #[tokio::test]
    async fn delta_sums_cover_adjacent_windows() {
        let points = points(&config(MetricType::Sum, Temporality::Delta, 3)).await;
        assert!(points.iter().all(|p| matches!(p.data, MetricData::Sum { value: 1, .. })));
        assert_eq!(points[1].start_time, points[0].time);
        assert_eq!(points[2].start_time, points[1].time);
    }

    #[tokio::test]
    async fn cumulative_histograms_accumulate() {
        let points = points(&config(MetricType::Histogram, Temporality::Cumulative, 4)).await;
        let counts: Vec<u64> = points
            .iter()
            .map(|p| match &p.data {
                MetricData::Histogram { point, .. } => {
                    assert_eq!(point.bucket_counts.iter().sum::<u64>(), point.count);
                    point.count
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert!(counts.windows(2).all(|w| w[0] < w[1]), "{counts:?}");
    }

    #[tokio::test]
    async fn delta_histograms_reset() {
        let points = points(&config(MetricType::Histogram, Temporality::Delta, 4)).await;
        for p in &points {
            let MetricData::Histogram { point, .. } = &p.data else {
                panic!("unexpected {:?}", p.data);
            };
            assert!((1..=MAX_SAMPLES_PER_POINT as u64).contains(&point.count));
            assert!(point.min >= 0.0 && point.max < 10.0);
        }
    }

    #[tokio::test]
    async fn exemplars_point_at_the_configured_trace() {
        let mut config = config(MetricType::Sum, Temporality::Cumulative, 1);
        config.trace_id = "0af7651916cd43dd8448eb211c80319c".into();
        let points = points(&config).await;
        let exemplar = &points[0].exemplars[0];
        assert_eq!(exemplar.value, 1);
        assert_eq!(exemplar.trace_id.map(|id| id.to_string()).as_deref(), Some("0af7651916cd43dd8448eb211c80319c"));
        assert_eq!(exemplar.span_id, None);
    }
}
