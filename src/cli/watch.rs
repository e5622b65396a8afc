use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cdp_adapter::{pump_events, ChromiumTransport, NetworkAssembler, PageSession, TargetSelector};
use cipherscope_correlator::bridge::INSTALLER;
use cipherscope_correlator::{Correlator, PageEvaluator};
use clap::Args;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::console;
use crate::config::Config;

#[derive(Args, Clone, Debug, Default)]
pub struct WatchArgs {
    /// Connect to a running browser's DevTools websocket instead of launching one
    #[arg(long, value_name = "URL", conflicts_with = "chrome")]
    pub ws_url: Option<String>,

    /// Chrome/Chromium executable to launch
    #[arg(long, value_name = "PATH")]
    pub chrome: Option<PathBuf>,

    /// Launch the browser with a visible window
    #[arg(long)]
    pub headful: bool,

    /// Navigate the inspected page to this URL
    #[arg(long, value_name = "URL")]
    pub open: Option<String>,

    /// Attach to the first open page whose URL contains this text
    #[arg(long = "match", value_name = "SUBSTR")]
    pub url_match: Option<String>,

    /// Name of a window-scoped decryption function; enables decryption assist
    #[arg(long, value_name = "NAME")]
    pub decrypt_fn: Option<String>,

    /// Do not fetch request/response bodies
    #[arg(long)]
    pub no_bodies: bool,

    /// Write every record to this file on exit
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Write Prometheus text metrics to this file on exit
    #[arg(long, value_name = "FILE")]
    pub metrics_file: Option<PathBuf>,
}

impl WatchArgs {
    /// Fold command-line overrides into the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.ws_url {
            config.cdp.websocket_url = Some(url.clone());
        }
        if let Some(chrome) = &self.chrome {
            config.cdp.executable = chrome.clone();
            config.cdp.websocket_url = None;
        }
        if self.headful {
            config.cdp.headless = false;
        }
        if let Some(function) = &self.decrypt_fn {
            config.capture.decrypt_assist = true;
            config.capture.decrypt_function = Some(function.clone());
        }
        if self.no_bodies {
            config.capture.capture_bodies = false;
        }
        if let Some(path) = &self.export {
            config.export_path = Some(path.clone());
        }
    }

    fn selector(&self) -> TargetSelector {
        TargetSelector {
            url_contains: self.url_match.clone(),
            open_url: self.open.clone(),
        }
    }
}

pub async fn cmd_watch(args: WatchArgs, mut config: Config) -> Result<()> {
    args.apply(&mut config);

    let registry = Registry::new();
    cdp_adapter::metrics::register_metrics(&registry);
    cipherscope_correlator::metrics::register_metrics(&registry);

    let transport = Arc::new(
        ChromiumTransport::connect(&config.cdp)
            .await
            .context("Failed to reach Chromium")?,
    );
    let page = Arc::new(
        PageSession::attach(transport.clone(), &args.selector())
            .await
            .context("Failed to attach to a page")?,
    );
    page.prepare(INSTALLER, config.capture.capture_bodies)
        .await
        .context("Failed to prepare page session")?;

    let (records_tx, records_rx) = mpsc::channel(256);
    let assembler = NetworkAssembler::new(
        transport.clone(),
        page.session_id(),
        records_tx,
        config.capture.capture_bodies,
    );
    let bodies = assembler.capture_bodies();
    let cancel = CancellationToken::new();
    let mut pump = tokio::spawn(pump_events(assembler, cancel.clone()));

    let evaluator: Arc<dyn PageEvaluator> = page.clone();
    let handle = Correlator::spawn(evaluator, config.capture.clone(), records_rx);

    if let Some(url) = &args.open {
        page.navigate(url).await.context("Navigation failed")?;
    }
    info!(
        session = page.session_id(),
        decrypt = ?config.capture.active_decrypt_function(),
        "watching page"
    );

    let outcome = console::run(&handle, &bodies, &mut pump).await;

    cancel.cancel();
    if let Some(path) = &config.export_path {
        match console::write_export(&handle, path).await {
            Ok(count) => info!("Exported {} records to {}", count, path.display()),
            Err(err) => warn!(?err, "export on exit failed"),
        }
    }
    if let Err(err) = handle.shutdown().await {
        warn!(?err, "correlator task ended abnormally");
    }
    transport.shutdown().await;

    log_metrics_summary();
    if let Some(path) = &args.metrics_file {
        write_metrics(&registry, path).await?;
    }
    outcome
}

fn log_metrics_summary() {
    let correlator = cipherscope_correlator::metrics::snapshot();
    let cdp = cdp_adapter::metrics::snapshot();
    info!(
        records = correlator.records,
        plain_events = correlator.plain_events,
        plain_attaches = correlator.plain_attaches,
        decrypt_hits = correlator.decrypt_hits,
        decrypt_misses = correlator.decrypt_misses,
        bucket_trims = correlator.bucket_trims,
        cdp_commands = cdp.commands,
        cdp_failures = cdp.command_failures,
        cdp_events = cdp.events,
        transactions_finished = cdp.transactions_finished,
        transactions_failed = cdp.transactions_failed,
        transactions_evicted = cdp.transactions_evicted,
        bodies_captured = cdp.bodies_captured,
        bodies_unavailable = cdp.bodies_unavailable,
        evaluation_exceptions = cdp.evaluation_exceptions,
        "session summary"
    );
}

async fn write_metrics(registry: &Registry, path: &Path) -> Result<()> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    tokio::fs::write(path, buffer)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
