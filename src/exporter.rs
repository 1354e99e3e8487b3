// SPDX-License-Identifier: MIT
//! The exporter seam between generation and transport.
//!
//! Workers hand each iteration's records to an [`Exporter`] and wait for the
//! result; a failed export stops the worker. The coordinator calls
//! [`Exporter::shutdown`] exactly once, after every worker has stopped.
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::attributes::AttributeSet;

/// Semantic conventions version stamped on every resource.
pub const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.25.0";

/// The telemetry signal a run generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Logs,
    Metrics,
    Traces,
}

impl Signal {
    pub fn name(self) -> &'static str {
        match self {
            Signal::Logs => "logs",
            Signal::Metrics => "metrics",
            Signal::Traces => "traces",
        }
    }

    /// Capitalized name, as printed in progress reports.
    pub fn title(self) -> &'static str {
        match self {
            Signal::Logs => "Logs",
            Signal::Metrics => "Metrics",
            Signal::Traces => "Traces",
        }
    }

    /// Default OTLP/HTTP request path.
    pub fn http_path(self) -> &'static str {
        match self {
            Signal::Logs => "/v1/logs",
            Signal::Metrics => "/v1/metrics",
            Signal::Traces => "/v1/traces",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The entity every record of a run is attributed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub attributes: AttributeSet,
    pub schema_url: String,
}

impl Resource {
    pub fn new(attributes: AttributeSet) -> Self {
        Self {
            attributes,
            schema_url: SCHEMA_URL.to_owned(),
        }
    }
}

/// Export or exporter setup failure.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("exporter is already shut down")]
    Shutdown,
    #[error("invalid exporter configuration: {0}")]
    Setup(String),
    #[error("gRPC export failed: {0}")]
    Grpc(Box<tonic::Status>),
    #[error("HTTP export failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("export failed: {0}")]
    Other(String),
}

impl From<tonic::Status> for ExportError {
    fn from(status: tonic::Status) -> Self {
        Self::Grpc(Box::new(status))
    }
}

/// Ships records of type `R` to a backend.
#[async_trait]
pub trait Exporter<R: Send + 'static>: Send + Sync {
    /// Sends `records` and waits for the backend to accept them.
    async fn export(&self, resource: &Resource, records: Vec<R>) -> Result<(), ExportError>;

    /// Releases the exporter. Exports after shutdown fail.
    async fn shutdown(&self) -> Result<(), ExportError>;
}

/// Keeps exported records in memory.
///
/// Used by tests and dry runs; can be told to fail every export.
#[derive(Debug)]
pub struct InMemoryExporter<R> {
    batches: Mutex<Vec<Vec<R>>>,
    resources: Mutex<Vec<Resource>>,
    shutdowns: AtomicUsize,
    failing: bool,
}

impl<R> Default for InMemoryExporter<R> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
            failing: false,
        }
    }
}

impl<R: Clone> InMemoryExporter<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// An exporter rejecting every export.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Every export call, in arrival order.
    pub fn batches(&self) -> Vec<Vec<R>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// All exported records, flattened.
    pub fn records(&self) -> Vec<R> {
        self.batches().into_iter().flatten().collect()
    }

    /// The resource passed with the most recent export.
    pub fn last_resource(&self) -> Option<Resource> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner).last().cloned()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: Clone + Send + Sync + 'static> Exporter<R> for InMemoryExporter<R> {
    async fn export(&self, resource: &Resource, records: Vec<R>) -> Result<(), ExportError> {
        if self.shutdown_count() > 0 {
            return Err(ExportError::Shutdown);
        }
        if self.failing {
            return Err(ExportError::Other("backend unavailable".to_owned()));
        }
        self.resources.lock().unwrap_or_else(PoisonError::into_inner).push(resource.clone());
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).push(records);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
