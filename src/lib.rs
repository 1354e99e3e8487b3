// SPDX-License-Identifier: MIT
//! Synthetic OpenTelemetry traffic generator.
//!
//! `trazr-gen` produces logs, metrics and traces at a controlled rate and sends
//! them to a collector over OTLP (gRPC or HTTP). It is meant for load testing
//! pipelines and for exercising attribute processing such as redaction:
//! * A pool of workers, each throttled by its own [`limiter::RateLimiter`].
//! * Runs bounded by a per-worker count or by a wall-clock duration.
//! * `{{...}}` templates in attributes, headers and log bodies, expanded with
//!   seeded fake data by [`mock::MockEngine`].
//! * Marker attributes (`trazr.sensitive.data`, `trazr.mock.data`) naming the
//!   keys a downstream processor should act on.
//!
//! The entry points are [`logs::start`], [`metrics::start`] and
//! [`traces::start`]. Their `run` counterparts accept any
//! [`exporter::Exporter`], which is how the tests drive whole runs against an
//! [`exporter::InMemoryExporter`].
//!
//! # Quick Start
//! ```no_run
//! use trazr_gen::logs::{self, LogsConfig};
//! use trazr_gen::run::RunOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = LogsConfig::default();
//!     config.count = 100;
//!     config.common.rate = 50.0;
//!     let summary = logs::start(config, RunOptions::default()).await?;
//!     println!("sent {} records", summary.generated);
//!     Ok(())
//! }
//! ```
pub mod attributes;
pub mod cli;
pub mod config;
pub mod exporter;
pub mod limiter;
pub mod logging;
pub mod logs;
pub mod metrics;
pub mod mock;
pub mod otlp;
pub mod run;
pub mod traces;
