//! Delivery workers: drain the queue and hand messages to the mailer.
//!
//! - `send_worker`: executes one claimed job and records the result
//! - `pool`: claims batches, applies the global send rate, settles jobs

pub mod pool;
pub mod send_worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use pool::{DeliveryWorkerPool, PoolReport};
pub use send_worker::{SendOutcome, SendWorker};

/// Spawn the loop that polls the queue for due jobs.
///
/// A poll that claimed a full batch is followed immediately by another.
pub fn spawn_delivery_workers(pool: Arc<DeliveryWorkerPool>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let period = pool.config().poll_interval;
        info!(
            worker_id = %pool.config().worker_id,
            concurrency = pool.config().concurrency,
            "Delivery workers started — polling every {}ms",
            period.as_millis()
        );

        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    info!("Delivery workers shutting down");
                    return;
                }

                match pool.run_once().await {
                    Ok(report) if report.claimed == 0 => break,
                    Ok(report) => {
                        info!(
                            claimed = report.claimed,
                            sent = report.sent,
                            retried = report.retried,
                            failed = report.failed,
                            "Delivery batch finished"
                        );
                        if report.claimed < pool.config().concurrency {
                            break;
                        }
                        debug!("Full batch claimed, polling again");
                    }
                    Err(e) => {
                        warn!("Delivery poll failed: {}", e);
                        break;
                    }
                }
            }
        }
    });

    (handle, shutdown_flag)
}
