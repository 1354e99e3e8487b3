// SPDX-License-Identifier: MIT
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trazr_gen::cli::{Cli, Invocation};
use trazr_gen::logging::{init_logging, ConsoleOutput, LoggingConfig};
use trazr_gen::run::{RunOptions, RunSummary};
use trazr_gen::{logs, metrics, traces};

/// Cancels `interrupt` on the first Ctrl-C.
fn watch_ctrl_c(interrupt: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping workers");
            interrupt.cancel();
        }
    });
}

async fn generate(invocation: Invocation, options: RunOptions) -> Result<RunSummary> {
    let summary = match invocation {
        Invocation::Logs(config) => logs::start(config, options).await?,
        Invocation::Metrics(config) => metrics::start(config, options).await?,
        Invocation::Traces(config) => traces::start(config, options).await?,
    };
    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    let invocation = Cli::parse().resolve()?;
    let common = invocation.common();
    init_logging(&LoggingConfig::from(common))?;

    let console = ConsoleOutput::new(common.terminal_output);
    console.banner();
    for value in invocation.overridden_values() {
        console.println(format_args!("  {value}"));
        info!(key = %value.key, value = %value.value, "overriding default");
    }

    let interrupt = CancellationToken::new();
    watch_ctrl_c(interrupt.clone());
    let options = RunOptions {
        interrupt,
        console,
        mock: None,
    };

    let summary = generate(invocation, options).await?;
    if summary.failed_workers > 0 {
        warn!(failed_workers = summary.failed_workers, generated = summary.generated, "generation finished with errors");
        console.errorln(format_args!("{} worker(s) stopped on errors", summary.failed_workers));
    } else {
        info!(generated = summary.generated, "generation finished");
    }
    Ok(())
}
