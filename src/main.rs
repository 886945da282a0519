use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use outreach_engine::config::{EngineConfig, LedgerBackend};
use outreach_engine::mailer::SmtpMailer;
use outreach_engine::scheduler::{self, MemoryPacingLedger, PacingLedger, Scheduler};
use outreach_engine::store::{Database, LibSqlBackend};
use outreach_engine::worker::{self, DeliveryWorkerPool, SendWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = EngineConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing, to a daily rolling file when a log dir is set
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "outreach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("📬 Outreach engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let backend = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    let db: Arc<dyn Database> = backend.clone();

    // ── Pacing ledger ────────────────────────────────────────────────────
    let ledger: Arc<dyn PacingLedger> = match config.ledger {
        LedgerBackend::Database => backend.clone(),
        LedgerBackend::Memory => {
            eprintln!("   Ledger: in-memory (single scheduler only)");
            Arc::new(MemoryPacingLedger::new())
        }
    };

    // ── Scheduler ────────────────────────────────────────────────────────
    let queue = Arc::new(backend.delivery_queue(config.queue.clone()));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&db),
        ledger,
        queue.clone(),
        config.scheduler.clone(),
        config.warmup,
    ));
    let (scheduler_handle, scheduler_stop) = scheduler::spawn_scheduler(Arc::clone(&scheduler));
    eprintln!(
        "   Scheduler: every {}s, batch {}",
        config.scheduler.tick_interval.as_secs(),
        config.scheduler.batch_size
    );

    // ── Delivery workers ─────────────────────────────────────────────────
    let mailer = Arc::new(SmtpMailer::new(config.tracking.clone()));
    let pool = Arc::new(DeliveryWorkerPool::new(
        queue,
        SendWorker::new(Arc::clone(&db), mailer),
        config.worker.clone(),
    ));
    let (worker_handle, worker_stop) = worker::spawn_delivery_workers(pool);
    eprintln!(
        "   Workers: {} concurrent, {} sends/s",
        config.worker.concurrency, config.worker.sends_per_second
    );
    match &config.tracking.base_url {
        Some(url) => eprintln!("   Tracking: {}", url),
        None => eprintln!("   Tracking: disabled"),
    }

    // No inbound mail source is wired in this binary.
    tracing::info!("Reply polling disabled — no reply source configured");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    scheduler_stop.store(true, Ordering::Relaxed);
    worker_stop.store(true, Ordering::Relaxed);
    let _ = tokio::join!(scheduler_handle, worker_handle);

    Ok(())
}
