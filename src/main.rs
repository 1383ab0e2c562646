// =============================================================================
// AXFL — portfolio live trading engine (paper book + optional broker mirror)
// =============================================================================
//
// Practice environment only: the paper book is always the source of truth,
// and the broker mirror defaults to the practice endpoint.
//
// Environment:
//   AXFL_SCHEDULE        schedule document path (default schedule.json)
//   AXFL_PROFILE         profile name inside the document (default portfolio)
//   AXFL_MODE            replay | ws (default replay)
//   AXFL_JOURNAL_PATH    journal database path (default data/journal.db)
//   AXFL_WEBHOOK_URL     optional best-effort notification sink
//   OANDA_API_KEY / OANDA_ACCOUNT_ID / OANDA_ENV   broker mirroring
//   FINNHUB_API_KEYS     comma-separated feed credentials (ws mode)
//   TWELVEDATA_API_KEYS  comma-separated history credentials
// =============================================================================

mod broker;
mod config;
mod costs;
mod indicators;
mod journal;
mod market;
mod news;
mod notify;
mod portfolio;
mod reconcile;
mod risk;
mod sessions;
mod status;
mod strategies;
mod strategy;
mod subengine;
mod symbols;
mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::OandaClient;
use crate::journal::Journal;
use crate::notify::Notifier;
use crate::portfolio::{Mode, PortfolioEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("AXFL portfolio live trading starting up");

    // --- Schedule -----------------------------------------------------------
    let schedule_path =
        std::env::var("AXFL_SCHEDULE").unwrap_or_else(|_| "schedule.json".to_string());
    let profile = std::env::var("AXFL_PROFILE").ok();
    let schedule = match config::load_schedule(&schedule_path, profile.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            error!(path = %schedule_path, error = %e, "schedule load failed");
            anyhow::bail!("schedule load failed: {e:#}");
        }
    };

    let mode = match std::env::var("AXFL_MODE").as_deref() {
        Ok("ws") => Mode::Ws,
        _ => Mode::Replay,
    };
    info!(
        mode = %mode,
        symbols = ?schedule.symbols,
        strategies = ?schedule.strategy_names(),
        interval = %schedule.interval,
        "schedule resolved"
    );

    // --- Collaborators ------------------------------------------------------
    let journal_path =
        std::env::var("AXFL_JOURNAL_PATH").unwrap_or_else(|_| "data/journal.db".to_string());
    let journal = Arc::new(Journal::open(&journal_path).context("journal open failed")?);

    let broker = match (
        std::env::var("OANDA_API_KEY"),
        std::env::var("OANDA_ACCOUNT_ID"),
    ) {
        (Ok(key), Ok(account)) if !key.is_empty() && !account.is_empty() => {
            let env = std::env::var("OANDA_ENV").unwrap_or_else(|_| "practice".to_string());
            info!(env = %env, "broker mirroring enabled");
            Some(Arc::new(OandaClient::new(key, account, env)))
        }
        _ => {
            info!("no broker credentials, running paper-only");
            None
        }
    };

    let notifier = Notifier::new(std::env::var("AXFL_WEBHOOK_URL").ok());

    // --- Shutdown plumbing --------------------------------------------------
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(shutdown.clone());

    // --- Run ----------------------------------------------------------------
    let mut engine = PortfolioEngine::new(schedule, mode, journal, broker, notifier, shutdown);
    engine.run().await?;

    info!("AXFL shut down cleanly");
    Ok(())
}

fn spawn_signal_handler(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        warn!("termination signal received, shutting down");
        shutdown.store(true, Ordering::Relaxed);
    });
}
