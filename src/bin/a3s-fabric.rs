//! a3s-fabric — run the event fabric with the logging handler
//!
//! Usage: `a3s-fabric [config.json]`. Without a config file the standard
//! partner topology is built from `STRIPE_PARTNER_EVENT_BUS_ARN`.
//!
//! Events are read from stdin as newline-delimited JSON, one `IngestRecord`
//! per line:
//!
//! ```text
//! {"source": "aws.partner/stripe.com/ed_test_61", "detail-type": "charge.created", "detail": {}}
//! {"bus": "InternalEventBus", "source": "custom.stripe.test", "detail-type": "test"}
//! ```
//!
//! Records without a `bus` go to the partner bus. Malformed lines are logged
//! and skipped. After stdin closes the dispatcher keeps draining until Ctrl-C.

use a3s_fabric::{Fabric, FabricConfig, LoggingHandler};
use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => FabricConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => FabricConfig::from_env().context("building partner topology")?,
    };

    let fabric = Fabric::from_config(config).context("building fabric")?;
    let dispatcher = fabric
        .start_dispatcher(Arc::new(LoggingHandler))
        .context("starting dispatcher")?;

    tracing::info!(
        partner_bus = %fabric.partner().bus_name(),
        "a3s-fabric running, reading events from stdin, Ctrl-C to stop"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("waiting for shutdown signal")?;
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => ingest(&fabric, &line).await,
                Ok(None) => {
                    stdin_open = false;
                    tracing::info!("stdin closed, draining until Ctrl-C");
                }
                Err(e) => {
                    stdin_open = false;
                    tracing::warn!(error = %e, "Failed to read stdin, ingest stopped");
                }
            },
        }
    }

    let report = dispatcher.shutdown().await;
    tracing::info!(
        received = report.received,
        acked = report.acked,
        failed = report.failed,
        timed_out = report.timed_out,
        expired = report.expired,
        "a3s-fabric stopped"
    );
    Ok(())
}

async fn ingest(fabric: &Fabric, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match fabric.ingest_line(line).await {
        Ok(receipt) => tracing::debug!(
            bus = %receipt.bus,
            event_id = %receipt.event_id,
            queued = receipt.queued().len(),
            "Ingested event"
        ),
        Err(e) => tracing::warn!(error = %e, "Rejected input line"),
    }
}
