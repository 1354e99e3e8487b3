// SPDX-License-Identifier: MIT
//! Generated records to OTLP protobuf messages.
use std::time::{SystemTime, UNIX_EPOCH};

use opentelemetry::trace::{SpanKind, Status};
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::logs::v1 as logs;
use opentelemetry_proto::tonic::metrics::v1 as metrics;
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use opentelemetry_proto::tonic::trace::v1 as trace;

use crate::attributes::{AttributeSet, AttributeValue};
use crate::exporter::Resource;
use crate::logs::LogRecord;
use crate::metrics::{Exemplar, MetricData, MetricPoint, Temporality};
use crate::traces::SpanRecord;

/// Instrumentation scope name on every exported batch.
pub const SCOPE_NAME: &str = "trazr-gen";

// W3C trace flags plus the OTLP "has is_remote" / "is_remote" span flag bits.
const SAMPLED_FLAG: u32 = 0x01;
const HAS_IS_REMOTE_FLAG: u32 = 0x100;
const IS_REMOTE_FLAG: u32 = 0x200;

pub(crate) fn scope() -> InstrumentationScope {
    InstrumentationScope {
        name: SCOPE_NAME.to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
        ..Default::default()
    }
}

fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn any_value(value: &AttributeValue) -> AnyValue {
    let value = match value {
        AttributeValue::String(v) => any_value::Value::StringValue(v.clone()),
        AttributeValue::Bool(v) => any_value::Value::BoolValue(*v),
        AttributeValue::Int(v) => any_value::Value::IntValue(*v),
        AttributeValue::Float(v) => any_value::Value::DoubleValue(*v),
    };
    AnyValue { value: Some(value) }
}

fn key_values(attributes: &AttributeSet) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.to_owned(),
            value: Some(any_value(value)),
        })
        .collect()
}

fn resource(resource: &Resource) -> ProtoResource {
    ProtoResource {
        attributes: key_values(&resource.attributes),
        ..Default::default()
    }
}

pub(crate) fn logs_request(
    resource_info: &Resource,
    scope: &InstrumentationScope,
    records: &[LogRecord],
) -> ExportLogsServiceRequest {
    ExportLogsServiceRequest {
        resource_logs: vec![logs::ResourceLogs {
            resource: Some(resource(resource_info)),
            scope_logs: vec![logs::ScopeLogs {
                scope: Some(scope.clone()),
                log_records: records.iter().map(log_record).collect(),
                ..Default::default()
            }],
            schema_url: resource_info.schema_url.clone(),
        }],
    }
}

fn log_record(record: &LogRecord) -> logs::LogRecord {
    logs::LogRecord {
        time_unix_nano: unix_nanos(record.timestamp),
        observed_time_unix_nano: unix_nanos(record.observed_timestamp),
        severity_number: record.severity.number,
        severity_text: record.severity.text.clone(),
        body: Some(AnyValue {
            value: Some(any_value::Value::StringValue(record.body.clone())),
        }),
        attributes: key_values(&record.attributes),
        trace_id: record.trace_id.map(|id| id.to_bytes().to_vec()).unwrap_or_default(),
        span_id: record.span_id.map(|id| id.to_bytes().to_vec()).unwrap_or_default(),
        flags: u32::from(record.trace_id.is_some()) * SAMPLED_FLAG,
        ..Default::default()
    }
}

pub(crate) fn metrics_request(
    resource_info: &Resource,
    scope: &InstrumentationScope,
    points: &[MetricPoint],
) -> ExportMetricsServiceRequest {
    ExportMetricsServiceRequest {
        resource_metrics: vec![metrics::ResourceMetrics {
            resource: Some(resource(resource_info)),
            scope_metrics: vec![metrics::ScopeMetrics {
                scope: Some(scope.clone()),
                metrics: points.iter().map(metric).collect(),
                ..Default::default()
            }],
            schema_url: resource_info.schema_url.clone(),
        }],
    }
}

fn temporality(temporality: Temporality) -> i32 {
    match temporality {
        Temporality::Delta => metrics::AggregationTemporality::Delta as i32,
        Temporality::Cumulative => metrics::AggregationTemporality::Cumulative as i32,
    }
}

fn exemplar(exemplar: &Exemplar) -> metrics::Exemplar {
    metrics::Exemplar {
        time_unix_nano: unix_nanos(exemplar.time),
        trace_id: exemplar.trace_id.map(|id| id.to_bytes().to_vec()).unwrap_or_default(),
        span_id: exemplar.span_id.map(|id| id.to_bytes().to_vec()).unwrap_or_default(),
        value: Some(metrics::exemplar::Value::AsInt(exemplar.value)),
        ..Default::default()
    }
}

fn metric(point: &MetricPoint) -> metrics::Metric {
    let attributes = key_values(&point.attributes);
    let exemplars: Vec<_> = point.exemplars.iter().map(exemplar).collect();
    let start_time_unix_nano = unix_nanos(point.start_time);
    let time_unix_nano = unix_nanos(point.time);
    let number = |value: i64| metrics::NumberDataPoint {
        attributes: attributes.clone(),
        start_time_unix_nano,
        time_unix_nano,
        exemplars: exemplars.clone(),
        value: Some(metrics::number_data_point::Value::AsInt(value)),
        ..Default::default()
    };
    let data = match &point.data {
        MetricData::Gauge(value) => metrics::metric::Data::Gauge(metrics::Gauge {
            data_points: vec![number(*value)],
        }),
        MetricData::Sum {
            value,
            temporality: t,
            monotonic,
        } => metrics::metric::Data::Sum(metrics::Sum {
            data_points: vec![number(*value)],
            aggregation_temporality: temporality(*t),
            is_monotonic: *monotonic,
        }),
        MetricData::Histogram { point: h, temporality: t } => {
            metrics::metric::Data::Histogram(metrics::Histogram {
                data_points: vec![metrics::HistogramDataPoint {
                    attributes: attributes.clone(),
                    start_time_unix_nano,
                    time_unix_nano,
                    count: h.count,
                    sum: Some(h.sum),
                    bucket_counts: h.bucket_counts.clone(),
                    explicit_bounds: h.bounds.clone(),
                    exemplars: exemplars.clone(),
                    min: Some(h.min),
                    max: Some(h.max),
                    ..Default::default()
                }],
                aggregation_temporality: temporality(*t),
            })
        }
    };
    metrics::Metric {
        name: point.name.clone(),
        data: Some(data),
        ..Default::default()
    }
}

pub(crate) fn traces_request(
    resource_info: &Resource,
    scope: &InstrumentationScope,
    spans: &[SpanRecord],
) -> ExportTraceServiceRequest {
    ExportTraceServiceRequest {
        resource_spans: vec![trace::ResourceSpans {
            resource: Some(resource(resource_info)),
            scope_spans: vec![trace::ScopeSpans {
                scope: Some(scope.clone()),
                spans: spans.iter().map(span).collect(),
                ..Default::default()
            }],
            schema_url: resource_info.schema_url.clone(),
        }],
    }
}

fn span_kind(kind: &SpanKind) -> i32 {
    let kind = match kind {
        SpanKind::Client => trace::span::SpanKind::Client,
        SpanKind::Server => trace::span::SpanKind::Server,
        SpanKind::Producer => trace::span::SpanKind::Producer,
        SpanKind::Consumer => trace::span::SpanKind::Consumer,
        SpanKind::Internal => trace::span::SpanKind::Internal,
    };
    kind as i32
}

fn status(status: &Status) -> trace::Status {
    match status {
        Status::Unset => trace::Status::default(),
        Status::Ok => trace::Status {
            code: trace::status::StatusCode::Ok as i32,
            ..Default::default()
        },
        Status::Error { description } => trace::Status {
            code: trace::status::StatusCode::Error as i32,
            message: description.to_string(),
        },
    }
}

fn span(record: &SpanRecord) -> trace::Span {
    let mut flags = SAMPLED_FLAG;
    if record.parent_span_id.is_some() {
        flags |= HAS_IS_REMOTE_FLAG;
        if record.remote_parent {
            flags |= IS_REMOTE_FLAG;
        }
    }
    trace::Span {
        trace_id: record.trace_id.to_bytes().to_vec(),
        span_id: record.span_id.to_bytes().to_vec(),
        parent_span_id: record.parent_span_id.map(|id| id.to_bytes().to_vec()).unwrap_or_default(),
        flags,
        name: record.name.clone(),
        kind: span_kind(&record.kind),
        start_time_unix_nano: unix_nanos(record.start_time),
        end_time_unix_nano: unix_nanos(record.end_time),
        attributes: key_values(&record.attributes),
        status: Some(status(&record.status)),
        ..Default::default()
    }
}
