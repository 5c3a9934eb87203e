//! APIService availability controller

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use futures::future::join_all;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use apiservice_availability::config::{
    ControllerConfig, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_DISCOVERY_PATH,
    DEFAULT_PROBE_ATTEMPTS, DEFAULT_PROBE_TIMEOUT, DEFAULT_RESYNC_INTERVAL, DEFAULT_WORKERS,
};
use apiservice_availability::controller::Context;
use apiservice_availability::telemetry::{init_telemetry, TelemetryConfig};
use apiservice_availability::watch::Reflectors;

/// Keeps the Available condition of aggregated APIServices up to date
#[derive(Parser, Debug)]
#[command(name = "apiservice-availability", version, about, long_about = None)]
struct Cli {
    /// Timeout for a single discovery request, in milliseconds
    #[arg(
        long,
        env = "APISERVICE_AVAILABILITY_PROBE_TIMEOUT_MS",
        default_value_t = DEFAULT_PROBE_TIMEOUT.as_millis() as u64
    )]
    probe_timeout_ms: u64,

    /// Concurrent discovery attempts per probe
    #[arg(
        long,
        env = "APISERVICE_AVAILABILITY_PROBE_ATTEMPTS",
        default_value_t = DEFAULT_PROBE_ATTEMPTS
    )]
    probe_attempts: usize,

    /// Path requested on the backing service
    #[arg(
        long,
        env = "APISERVICE_AVAILABILITY_DISCOVERY_PATH",
        default_value = DEFAULT_DISCOVERY_PATH
    )]
    discovery_path: String,

    /// Interval between full re-enqueues, in seconds
    #[arg(
        long,
        env = "APISERVICE_AVAILABILITY_RESYNC_SECS",
        default_value_t = DEFAULT_RESYNC_INTERVAL.as_secs()
    )]
    resync_secs: u64,

    /// First retry delay after a failed pass, in milliseconds
    #[arg(
        long,
        env = "APISERVICE_AVAILABILITY_BACKOFF_BASE_MS",
        default_value_t = DEFAULT_BACKOFF_BASE.as_millis() as u64
    )]
    backoff_base_ms: u64,

    /// Longest retry delay, in seconds
    #[arg(
        long,
        env = "APISERVICE_AVAILABILITY_BACKOFF_MAX_SECS",
        default_value_t = DEFAULT_BACKOFF_MAX.as_secs()
    )]
    backoff_max_secs: u64,

    /// Number of reconcile workers
    #[arg(long, env = "APISERVICE_AVAILABILITY_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Skip TLS verification when probing backing services
    #[arg(long, env = "APISERVICE_AVAILABILITY_INSECURE_SKIP_TLS_VERIFY")]
    insecure_skip_tls_verify: bool,

    /// Human-readable log lines instead of JSON
    #[arg(long, env = "APISERVICE_AVAILABILITY_TEXT_LOGS")]
    text_logs: bool,

    /// OTLP endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            probe_attempts: self.probe_attempts,
            discovery_path: self.discovery_path.clone(),
            resync_interval: Duration::from_secs(self.resync_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            workers: self.workers,
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        otlp_endpoint: cli.otlp_endpoint.clone(),
        json_logs: !cli.text_logs,
        ..Default::default()
    })
    .context("telemetry setup")?;

    let config = cli.controller_config();
    config.validate().context("invalid configuration")?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let reflectors = Reflectors::new();
    let ctx = Arc::new(
        Context::builder(reflectors.state())
            .kube_client(client.clone())
            .config(config)
            .build()
            .context("failed to build controller context")?,
    );

    let cancel = CancellationToken::new();
    let watches = reflectors.into_watches(client, Arc::new(ctx.router()), cancel.clone());

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    info!(
        otlp = telemetry.is_exporting(),
        "starting APIService availability controller"
    );
    let watches = tokio::spawn(join_all(watches));
    let result = Arc::clone(&ctx).run(cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = watches.await {
        error!(error = %e, "watch task ended abnormally");
    }
    telemetry.shutdown();
    result.context("controller failed")?;

    Ok(())
}
