use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mailpilot::config::AppConfig;
use mailpilot::http::{OpsState, ops_routes};
use mailpilot::pipeline::{Collaborators, Guards, PipelineOrchestrator};
use mailpilot::providers::anthropic::AnthropicSummarizer;
use mailpilot::providers::gmail::GmailClient;
use mailpilot::scheduler::{CycleSchedule, CycleScheduler, spawn_cycle_ticker};
use mailpilot::store::{InMemoryAccounts, LibSqlStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("📬 Mailpilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.summarizer.model);
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   Ops API: http://{}/health\n", config.http.bind);

    let store = Arc::new(
        LibSqlStore::new_local(&config.database_path)
            .await
            .context("failed to open database")?,
    );
    let accounts = Arc::new(
        InMemoryAccounts::load(&config.accounts_path)
            .await
            .with_context(|| {
                format!("failed to load accounts from {}", config.accounts_path.display())
            })?,
    );

    let mail = Arc::new(
        GmailClient::new(&config.gmail, accounts.clone()).context("failed to build Gmail client")?,
    );
    let summarizer = Arc::new(
        AnthropicSummarizer::new(&config.summarizer).context("failed to build summarizer")?,
    );

    let collaborators = Collaborators {
        users: accounts.clone(),
        messages: store.clone(),
        ledger: accounts.clone(),
        mail,
        summarizer,
        connections: accounts.clone(),
    };
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        collaborators,
        Guards::from_config(&config),
        config.pipeline.clone(),
    ));
    let scheduler = Arc::new(CycleScheduler::new(
        orchestrator.clone(),
        accounts.clone(),
        store.clone(),
        config.scheduler.clone(),
    ));

    let schedule =
        CycleSchedule::from_config(&config.scheduler).context("invalid cycle schedule")?;
    let (ticker, ticker_shutdown) = spawn_cycle_ticker(scheduler.clone(), schedule);

    let app = ops_routes(OpsState {
        orchestrator,
        scheduler,
    });
    let listener = tokio::net::TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;
    info!(bind = %config.http.bind, "Ops API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
        })
        .await
        .context("ops server failed")?;

    ticker_shutdown.store(true, Ordering::Relaxed);
    ticker.abort();
    info!("Mailpilot stopped");
    Ok(())
}

/// Stderr logging, plus a daily rolling file when a log directory is set.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mailpilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
