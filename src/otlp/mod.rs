// SPDX-License-Identifier: MIT
//! OTLP exporter over gRPC or HTTP/protobuf.
//!
//! One [`OtlpExporter`] serves one run. It implements [`Exporter`] for the three
//! record types, so the same value ships logs, metrics or spans; the signal
//! only picks the default HTTP path.
//!
//! Transport settings come from [`Config`]:
//!
//! * `otlp-http` – HTTP/protobuf (default) or gRPC.
//! * `otlp-endpoint` – `host:port`; the scheme is `http` when `otlp-insecure`
//!   is set and `https` otherwise. A full URL is used as given.
//! * `otlp-http-url-path` – overrides `/v1/logs`, `/v1/metrics`, `/v1/traces`.
//! * `ca-cert`, `client-auth` – extra trust root and client identity for TLS.
//! * `otlp-insecure-skip-verify` – accept any server certificate (HTTP only).
//!
//! Headers are sent on every request (gRPC metadata or HTTP headers). Partial
//! success responses are logged as warnings on both transports.
//! gRPC channels connect lazily, so creating an exporter never blocks.
mod convert;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use indexmap::IndexMap;
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_client::LogsServiceClient;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceResponse;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceResponse;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceResponse;
use opentelemetry_proto::tonic::common::v1::InstrumentationScope;
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, warn};

pub use convert::SCOPE_NAME;

use crate::config::Config;
use crate::exporter::{ExportError, Exporter, Resource, Signal};
use crate::logs::LogRecord;
use crate::metrics::MetricPoint;
use crate::traces::SpanRecord;

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

enum Transport {
    Grpc { channel: Channel, metadata: MetadataMap },
    Http { client: reqwest::Client, url: String, headers: HeaderMap },
}

/// Ships generated records to an OTLP collector.
pub struct OtlpExporter {
    transport: Transport,
    scope: InstrumentationScope,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for OtlpExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transport = match &self.transport {
            Transport::Grpc { .. } => "grpc".to_owned(),
            Transport::Http { url, .. } => format!("http {url}"),
        };
        f.debug_struct("OtlpExporter")
            .field("transport", &transport)
            .field("shut_down", &self.shut_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl OtlpExporter {
    /// Builds the transport selected by `config` for `signal`.
    ///
    /// # Errors
    /// Returns [`ExportError::Setup`] for an invalid endpoint, header or TLS file.
    pub fn new(config: &Config, signal: Signal, headers: &IndexMap<String, String>) -> Result<Self, ExportError> {
        let transport = if config.otlp_http {
            let url = http_url(config, signal);
            info!(signal = %signal, %url, "starting OTLP/HTTP exporter");
            Transport::Http {
                client: http_client(config)?,
                url,
                headers: http_headers(headers)?,
            }
        } else {
            let url = endpoint_url(config);
            info!(signal = %signal, %url, "starting OTLP/gRPC exporter");
            Transport::Grpc {
                channel: grpc_channel(config, &url)?,
                metadata: grpc_metadata(headers)?,
            }
        };
        Ok(Self {
            transport,
            scope: convert::scope(),
            shut_down: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), ExportError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ExportError::Shutdown);
        }
        Ok(())
    }

    fn close(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("OTLP exporter shut down");
        }
    }

    /// Posts a protobuf request and decodes the collector's response, if any.
    async fn post<T: Message + Default>(
        client: &reqwest::Client,
        url: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
    ) -> Result<Option<T>, ExportError> {
        let response = client
            .post(url)
            .headers(headers.clone())
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(decode_response(&response.bytes().await?))
    }
}

/// Empty and undecodable bodies carry no partial success.
fn decode_response<T: Message + Default>(body: &[u8]) -> Option<T> {
    if body.is_empty() {
        return None;
    }
    T::decode(body)
        .inspect_err(|e| debug!(error = %e, "ignoring undecodable export response"))
        .ok()
}

/// Endpoint with a scheme, `http` for insecure connections.
pub fn endpoint_url(config: &Config) -> String {
    let endpoint = config.endpoint();
    if endpoint.contains("://") {
        return endpoint.to_owned();
    }
    let scheme = if config.otlp_insecure { "http" } else { "https" };
    format!("{scheme}://{endpoint}")
}

/// Full OTLP/HTTP URL for `signal`.
pub fn http_url(config: &Config, signal: Signal) -> String {
    let path = match config.otlp_http_url_path.as_str() {
        "" => signal.http_path(),
        path => path,
    };
    format!(
        "{}/{}",
        endpoint_url(config).trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>, ExportError> {
    fs::read(path).map_err(|e| ExportError::Setup(format!("failed to read {what} {}: {e}", path.display())))
}

fn client_identity(config: &Config) -> Result<Option<(Vec<u8>, Vec<u8>)>, ExportError> {
    let auth = &config.client_auth;
    if !auth.mtls {
        return Ok(None);
    }
    match (&auth.client_cert, &auth.client_key) {
        (Some(cert), Some(key)) => Ok(Some((read_pem(cert, "client certificate")?, read_pem(key, "client key")?))),
        _ => Err(ExportError::Setup(
            "mTLS requires both `client-cert` and `client-key`".to_owned(),
        )),
    }
}

fn http_client(config: &Config) -> Result<reqwest::Client, ExportError> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();
    if !config.otlp_insecure {
        if config.otlp_insecure_skip_verify {
            warn!("server certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca) = &config.ca_cert {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&read_pem(ca, "CA certificate")?)?);
        }
        if let Some((mut pem, key)) = client_identity(config)? {
            pem.extend_from_slice(&key);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
    }
    Ok(builder.build()?)
}

fn http_headers(headers: &IndexMap<String, String>) -> Result<HeaderMap, ExportError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| ExportError::Setup(format!("invalid header name {key:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ExportError::Setup(format!("invalid value for header {key:?}: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn grpc_channel(config: &Config, url: &str) -> Result<Channel, ExportError> {
    let mut endpoint = Endpoint::from_shared(url.to_owned())
        .map_err(|e| ExportError::Setup(format!("invalid endpoint {url:?}: {e}")))?;
    if !config.otlp_insecure {
        if config.otlp_insecure_skip_verify {
            warn!("insecure-skip-verify is not supported over gRPC, server certificates are verified");
        }
        let mut tls = ClientTlsConfig::new().with_native_roots();
        if let Some(ca) = &config.ca_cert {
            tls = tls.ca_certificate(Certificate::from_pem(read_pem(ca, "CA certificate")?));
        }
        if let Some((cert, key)) = client_identity(config)? {
            tls = tls.identity(Identity::from_pem(cert, key));
        }
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| ExportError::Setup(format!("invalid TLS configuration: {e}")))?;
    }
    Ok(endpoint.connect_lazy())
}

fn grpc_metadata(headers: &IndexMap<String, String>) -> Result<MetadataMap, ExportError> {
    let mut metadata = MetadataMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = MetadataKey::<Ascii>::from_bytes(key.to_ascii_lowercase().as_bytes())
            .map_err(|e| ExportError::Setup(format!("invalid metadata key {key:?}: {e}")))?;
        let value = value
            .parse::<MetadataValue<Ascii>>()
            .map_err(|e| ExportError::Setup(format!("invalid value for metadata {key:?}: {e}")))?;
        metadata.insert(name, value);
    }
    Ok(metadata)
}

fn grpc_request<T>(message: T, metadata: &MetadataMap) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = metadata.clone();
    request
}

fn report_rejected(signal: Signal, rejected: i64, message: &str) {
    if rejected > 0 || !message.is_empty() {
        warn!(signal = %signal, rejected, error_message = message, "collector partially rejected the export");
    }
}

#[async_trait]
impl Exporter<LogRecord> for OtlpExporter {
    async fn export(&self, resource: &Resource, records: Vec<LogRecord>) -> Result<(), ExportError> {
        self.ensure_open()?;
        let request = convert::logs_request(resource, &self.scope, &records);
        let response = match &self.transport {
            Transport::Grpc { channel, metadata } => Some(
                LogsServiceClient::new(channel.clone())
                    .export(grpc_request(request, metadata))
                    .await?
                    .into_inner(),
            ),
            Transport::Http { client, url, headers } => {
                Self::post::<ExportLogsServiceResponse>(client, url, headers, request.encode_to_vec()).await?
            }
        };
        if let Some(partial) = response.and_then(|r| r.partial_success) {
            report_rejected(Signal::Logs, partial.rejected_log_records, &partial.error_message);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        self.close();
        Ok(())
    }
}

#[async_trait]
impl Exporter<MetricPoint> for OtlpExporter {
    async fn export(&self, resource: &Resource, points: Vec<MetricPoint>) -> Result<(), ExportError> {
        self.ensure_open()?;
        let request = convert::metrics_request(resource, &self.scope, &points);
        let response = match &self.transport {
            Transport::Grpc { channel, metadata } => Some(
                MetricsServiceClient::new(channel.clone())
                    .export(grpc_request(request, metadata))
                    .await?
                    .into_inner(),
            ),
            Transport::Http { client, url, headers } => {
                Self::post::<ExportMetricsServiceResponse>(client, url, headers, request.encode_to_vec()).await?
            }
        };
        if let Some(partial) = response.and_then(|r| r.partial_success) {
            report_rejected(Signal::Metrics, partial.rejected_data_points, &partial.error_message);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        self.close();
        Ok(())
    }
}

#[async_trait]
impl Exporter<SpanRecord> for OtlpExporter {
    async fn export(&self, resource: &Resource, spans: Vec<SpanRecord>) -> Result<(), ExportError> {
        self.ensure_open()?;
        let request = convert::traces_request(resource, &self.scope, &spans);
        let response = match &self.transport {
            Transport::Grpc { channel, metadata } => Some(
                TraceServiceClient::new(channel.clone())
                    .export(grpc_request(request, metadata))
                    .await?
                    .into_inner(),
            ),
            Transport::Http { client, url, headers } => {
                Self::post::<ExportTraceServiceResponse>(client, url, headers, request.encode_to_vec()).await?
            }
        };
        if let Some(partial) = response.and_then(|r| r.partial_success) {
            report_rejected(Signal::Traces, partial.rejected_spans, &partial.error_message);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        self.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(entries: &[(&str, &str)]) -> IndexMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn urls_get_a_scheme_and_signal_path() {
        let mut config = Config::default();
        assert_eq!(http_url(&config, Signal::Logs), "http://localhost:4318/v1/logs");

        config.otlp_insecure = false;
        config.otlp_endpoint = "collector.example.com:4318/".into();
        assert_eq!(http_url(&config, Signal::Traces), "https://collector.example.com:4318/v1/traces");

        config.otlp_endpoint = "http://10.0.0.1:9000".into();
        config.otlp_http_url_path = "/ingest".into();
        assert_eq!(http_url(&config, Signal::Metrics), "http://10.0.0.1:9000/ingest");

        config.otlp_http = false;
        config.otlp_endpoint.clear();
        assert_eq!(endpoint_url(&config), "https://localhost:4317");
    }

    #[test]
    fn header_maps_reject_invalid_names() {
        let map = http_headers(&headers(&[("x-tenant", "a"), ("X-trazr.mock.data", "x-tenant")])).unwrap();
        assert_eq!(map.get("x-tenant").unwrap(), "a");
        assert!(http_headers(&headers(&[("bad header", "a")])).is_err());

        let metadata = grpc_metadata(&headers(&[("Authorization", "Bearer t")])).unwrap();
        assert_eq!(metadata.get("authorization").unwrap(), "Bearer t");
        assert!(grpc_metadata(&headers(&[("ok", "line\nbreak")])).is_err());
    }

    #[tokio::test]
    async fn grpc_exporters_connect_lazily() {
        let config = Config {
            otlp_http: false,
            ..Config::default()
        };
        let exporter = OtlpExporter::new(&config, Signal::Traces, &IndexMap::new()).unwrap();
        assert!(format!("{exporter:?}").contains("grpc"));
    }

    #[tokio::test]
    async fn missing_tls_files_fail_setup() {
        let mut config = Config {
            otlp_insecure: false,
            ca_cert: Some("/nonexistent/ca.pem".into()),
            ..Config::default()
        };
        let err = OtlpExporter::new(&config, Signal::Logs, &IndexMap::new()).unwrap_err();
        assert!(err.to_string().contains("CA certificate"), "{err}");

        config.otlp_http = false;
        assert!(OtlpExporter::new(&config, Signal::Logs, &IndexMap::new()).is_err());

        config.ca_cert = None;
        config.client_auth.mtls = true;
        let err = OtlpExporter::new(&config, Signal::Logs, &IndexMap::new()).unwrap_err();
        assert!(err.to_string().contains("mTLS"), "{err}");
    }

    /// Accepts one HTTP request and answers it with `status` and `reply`.
    async fn collector(status: &'static str, reply: Vec<u8>) -> (String, tokio::task::JoinHandle<(String, Vec<u8>)>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            let head_end = loop {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed before headers");
                received.extend_from_slice(&buf[..n]);
                if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&received[..head_end]).to_ascii_lowercase();
            let length: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .map_or(0, |v| v.trim().parse().unwrap());
            while received.len() < head_end + length {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "connection closed before body");
                received.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: {PROTOBUF_CONTENT_TYPE}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                reply.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.write_all(&reply).await.unwrap();
            socket.shutdown().await.unwrap();
            (head, received[head_end..head_end + length].to_vec())
        });
        (address, handle)
    }

    fn log_record() -> LogRecord {
        let mut attributes = crate::attributes::AttributeSet::new();
        attributes.insert("user", "bob");
        LogRecord {
            timestamp: std::time::SystemTime::now(),
            observed_timestamp: std::time::SystemTime::now(),
            severity: crate::logs::Severity::resolve("Info", 9).unwrap(),
            body: "hello".into(),
            attributes,
            trace_id: None,
            span_id: None,
        }
    }

    #[tokio::test]
    async fn http_exports_post_protobuf_with_headers() {
        use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;

        let (address, server) = collector("200 OK", Vec::new()).await;
        let config = Config {
            otlp_endpoint: address,
            ..Config::default()
        };
        let exporter = OtlpExporter::new(&config, Signal::Logs, &headers(&[("x-tenant", "acme")])).unwrap();
        let resource = Resource::new(crate::attributes::AttributeSet::new());
        Exporter::<LogRecord>::export(&exporter, &resource, vec![log_record()]).await.unwrap();

        let (head, body) = server.await.unwrap();
        assert!(head.starts_with("post /v1/logs http/1.1"), "{head}");
        assert!(head.contains("content-type: application/x-protobuf"), "{head}");
        assert!(head.contains("x-tenant: acme"), "{head}");

        let request = ExportLogsServiceRequest::decode(body.as_slice()).unwrap();
        let records = &request.resource_logs[0].scope_logs[0].log_records;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].severity_number, 9);
        assert_eq!(records[0].severity_text, "Info");
    }

    #[tokio::test]
    async fn http_error_statuses_fail_the_export() {
        let (address, server) = collector("500 Internal Server Error", Vec::new()).await;
        let config = Config {
            otlp_endpoint: address,
            ..Config::default()
        };
        let exporter = OtlpExporter::new(&config, Signal::Logs, &IndexMap::new()).unwrap();
        let resource = Resource::new(crate::attributes::AttributeSet::new());
        let err = Exporter::<LogRecord>::export(&exporter, &resource, vec![log_record()]).await;
        assert!(matches!(err, Err(ExportError::Http(_))), "{err:?}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_partial_success_is_not_a_failure() {
        use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsPartialSuccess;

        let reply = ExportLogsServiceResponse {
            partial_success: Some(ExportLogsPartialSuccess {
                rejected_log_records: 1,
                error_message: "quota exceeded".into(),
            }),
        }
        .encode_to_vec();
        let decoded = decode_response::<ExportLogsServiceResponse>(&reply).and_then(|r| r.partial_success);
        assert_eq!(decoded.map(|p| p.rejected_log_records), Some(1));

        let (address, server) = collector("200 OK", reply).await;
        let config = Config {
            otlp_endpoint: address,
            ..Config::default()
        };
        let exporter = OtlpExporter::new(&config, Signal::Logs, &IndexMap::new()).unwrap();
        let resource = Resource::new(crate::attributes::AttributeSet::new());
        assert!(Exporter::<LogRecord>::export(&exporter, &resource, vec![log_record()]).await.is_ok());
        server.await.unwrap();
    }

    #[test]
    fn empty_or_truncated_responses_decode_to_nothing() {
        assert!(decode_response::<ExportLogsServiceResponse>(&[]).is_none());
        assert!(decode_response::<ExportLogsServiceResponse>(&[0xff]).is_none());
    }

    #[tokio::test]
    async fn exports_after_shutdown_are_refused() {
        let exporter = OtlpExporter::new(&Config::default(), Signal::Logs, &IndexMap::new()).unwrap();
        Exporter::<LogRecord>::shutdown(&exporter).await.unwrap();
        let resource = Resource::new(crate::attributes::AttributeSet::new());
        let err = Exporter::<LogRecord>::export(&exporter, &resource, Vec::new()).await;
        assert!(matches!(err, Err(ExportError::Shutdown)));
    }
}
