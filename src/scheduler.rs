//! Timer-driven background jobs: dispatch, ingest, respond.
//!
//! Each job is a short-lived cycle on its own interval. Cycles are
//! idempotent, so overlap with manual CLI invocations is safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatch::Dispatcher;
use crate::ingest::ResponseIngestor;
use crate::respond::ReplyEngine;

/// Handle to the running background jobs.
pub struct SchedulerHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl SchedulerHandle {
    /// Signal all loops to stop and cancel their pending timers. In-flight
    /// cycles are cut off; their work is retried on the next start.
    pub fn shutdown(self) {
        info!("Scheduler shutting down");
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles {
            handle.abort();
        }
    }
}

/// Spawn the three cycle loops on their configured intervals.
pub fn spawn_jobs(
    dispatcher: Arc<Dispatcher>,
    ingestor: Arc<ResponseIngestor>,
    engine: Arc<ReplyEngine>,
    dispatch_interval: Duration,
    ingest_interval: Duration,
    respond_interval: Duration,
) -> SchedulerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    {
        let shutdown = Arc::clone(&shutdown);
        handles.push(tokio::spawn(async move {
            info!(interval_secs = dispatch_interval.as_secs(), "Dispatch loop started");
            let mut tick = tokio::time::interval(dispatch_interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                match dispatcher.run_cycle(Utc::now()).await {
                    Ok(summary) => info!(?summary, "Dispatch cycle done"),
                    Err(e) => error!(error = %e, "Dispatch cycle failed"),
                }
            }
        }));
    }

    {
        let shutdown = Arc::clone(&shutdown);
        handles.push(tokio::spawn(async move {
            info!(interval_secs = ingest_interval.as_secs(), "Ingest loop started");
            let mut tick = tokio::time::interval(ingest_interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                match ingestor.run_cycle(Utc::now()).await {
                    Ok(summary) => info!(?summary, "Ingest cycle done"),
                    Err(e) => error!(error = %e, "Ingest cycle failed"),
                }
            }
        }));
    }

    {
        let shutdown = Arc::clone(&shutdown);
        handles.push(tokio::spawn(async move {
            info!(interval_secs = respond_interval.as_secs(), "Respond loop started");
            let mut tick = tokio::time::interval(respond_interval);
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                match engine.run_cycle(Utc::now()).await {
                    Ok(summary) => info!(?summary, "Respond cycle done"),
                    Err(e) => error!(error = %e, "Respond cycle failed"),
                }
            }
        }));
    }

    SchedulerHandle { handles, shutdown }
}
