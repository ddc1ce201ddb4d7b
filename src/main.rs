use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use tokio::task;
use tracing::{error, info};

use newswatch::api::{api_loop, ApiState};
use newswatch::db::Database;
use newswatch::fingerprint::Fingerprinter;
use newswatch::recheck::RecheckController;
use newswatch::settings::SETTINGS;
use newswatch::worker::worker_loop;
use newswatch::{logging, TARGET_API, TARGET_WORKER};

#[tokio::main]
async fn main() -> Result<()> {
    logging::configure_logging();

    let db = Database::instance().await.clone();
    info!(
        "Starting newswatch: {} workers, listening on {}",
        SETTINGS.worker_count,
        SETTINGS.bind_addr()
    );

    let mut worker_handles = Vec::new();
    for worker_id in 0..SETTINGS.worker_count {
        let db_worker = db.clone();
        let worker_handle = task::spawn(async move {
            worker_loop(worker_id, db_worker).await;
        });
        worker_handles.push(worker_handle);
    }

    let api_state = ApiState {
        db: db.clone(),
        recheck: Arc::new(RecheckController::new(db.clone())),
        fingerprinter: Arc::new(Fingerprinter::new()),
    };
    let api_handle = task::spawn(async move {
        if let Err(e) = api_loop(api_state).await {
            error!(target: TARGET_API, "API server failed: {}", e);
        }
    });

    if let Err(e) = api_handle.await {
        error!(target: TARGET_API, "API task encountered an error: {}", e);
    }

    let results = join_all(worker_handles).await;
    for (i, result) in results.into_iter().enumerate() {
        if let Err(e) = result {
            error!(target: TARGET_WORKER, "Worker {}: task failed with error: {}", i, e);
        }
    }

    Ok(())
}
