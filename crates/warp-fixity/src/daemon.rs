//! Fixity daemon - the periodic background service

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::FixityMetrics;
use crate::queue::{DrainReport, QueueGate, QueueWorker, WorkQueue};
use crate::service::FixityService;

/// State of the fixity daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Daemon is stopped
    Stopped,
    /// Waiting for the next tick
    Idle,
    /// Running a tick
    Running,
    /// Daemon is shutting down
    ShuttingDown,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Objects enrolled from candidate sources
    pub enrolled: u64,
    /// Stale queue markers cleared
    pub reclaimed: u64,
    /// Records admitted to the work queue
    pub admitted: u64,
    /// Queue items processed by the workers
    pub drained: DrainReport,
    /// Wall time of the tick
    pub duration: Duration,
}

/// Runs enrolment, admission and queue processing on a fixed interval
pub struct FixityDaemon {
    service: Arc<FixityService>,
    gate: QueueGate,
    state: Arc<RwLock<DaemonState>>,
    paused: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    tick_loop: Mutex<Option<JoinHandle<()>>>,
}

impl FixityDaemon {
    /// Create a daemon feeding `queue`
    pub fn new(service: Arc<FixityService>, queue: Arc<dyn WorkQueue>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            gate: QueueGate::new(service.store().clone(), queue),
            service,
            state: Arc::new(RwLock::new(DaemonState::Stopped)),
            paused: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tick_loop: Mutex::new(None),
        }
    }

    /// Start the tick loop
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != DaemonState::Stopped {
            return Ok(());
        }
        *state = DaemonState::Idle;
        drop(state);

        let config = self.service.config();
        info!(
            workers = config.worker_count,
            tick_secs = config.tick_interval_secs,
            "Starting fixity daemon"
        );

        *self.tick_loop.lock() = Some(self.spawn_tick_loop());

        self.service.metrics().record_start();
        info!("Fixity daemon started");

        Ok(())
    }

    /// Stop the tick loop, waiting for a tick in progress to finish
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == DaemonState::Stopped {
            return Ok(());
        }
        *state = DaemonState::ShuttingDown;
        drop(state);

        info!("Stopping fixity daemon");

        let _ = self.shutdown_tx.send(());
        let tick_loop = self.tick_loop.lock().take();
        if let Some(handle) = tick_loop {
            if let Err(e) = handle.await {
                error!(error = %e, "Tick loop task panicked");
            }
        }

        *self.state.write().await = DaemonState::Stopped;
        self.service.metrics().record_stop();
        info!("Fixity daemon stopped");

        Ok(())
    }

    /// Current daemon state
    pub async fn state(&self) -> DaemonState {
        *self.state.read().await
    }

    /// Skip ticks until resumed
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Fixity daemon paused");
    }

    /// Resume ticking
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Fixity daemon resumed");
    }

    /// Whether ticks are being skipped
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Metrics
    pub fn metrics(&self) -> &FixityMetrics {
        self.service.metrics()
    }

    /// Admission gate over the work queue
    pub fn gate(&self) -> &QueueGate {
        &self.gate
    }

    /// Run one tick now, paused or not
    pub async fn tick(&self) -> Result<TickReport> {
        Self::tick_internal(&self.service, &self.gate).await
    }

    // =========================================================================
    // Internal methods
    // =========================================================================

    fn spawn_tick_loop(&self) -> JoinHandle<()> {
        let service = self.service.clone();
        let gate = self.gate.clone();
        let state = self.state.clone();
        let paused = self.paused.clone();
        let period = Duration::from_secs(service.config().tick_interval_secs);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            // first tick one period after start
            let mut ticks = interval_at(tokio::time::Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        if paused.load(Ordering::SeqCst) {
                            debug!("Fixity daemon paused, skipping tick");
                            continue;
                        }
                        {
                            let mut current = state.write().await;
                            if *current != DaemonState::Idle {
                                continue;
                            }
                            *current = DaemonState::Running;
                        }

                        if let Err(e) = Self::tick_internal(&service, &gate).await {
                            error!(error = %e, "Fixity tick failed");
                        }

                        let mut current = state.write().await;
                        if *current == DaemonState::Running {
                            *current = DaemonState::Idle;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Tick loop received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    async fn tick_internal(service: &Arc<FixityService>, gate: &QueueGate) -> Result<TickReport> {
        let start = Instant::now();

        let planner = service.clone();
        let planner_gate = gate.clone();
        let (enrolled, reclaimed, admitted) = tokio::task::spawn_blocking(move || {
            Self::plan(&planner, &planner_gate)
        })
        .await
        .map_err(|e| Error::Internal(format!("tick planning task failed: {e}")))??;

        let config = service.config();
        let per_worker = config.queue_limit.div_ceil(config.worker_count);
        let mut workers = Vec::with_capacity(config.worker_count);
        for _ in 0..config.worker_count {
            let worker = QueueWorker::new(service.clone());
            let queue = gate.queue().clone();
            workers.push(tokio::task::spawn_blocking(move || {
                worker.drain(queue.as_ref(), per_worker)
            }));
        }

        let mut drained = DrainReport::default();
        for handle in workers {
            match handle.await {
                Ok(Ok(report)) => drained.merge(&report),
                Ok(Err(e)) => warn!(error = %e, "Queue worker stopped early"),
                Err(e) => error!(error = %e, "Queue worker task panicked"),
            }
        }

        service.metrics().record_tick();
        let duration = start.elapsed();
        info!(
            enrolled,
            reclaimed,
            admitted,
            checked = drained.checked,
            removed = drained.removed,
            errors = drained.errors,
            duration = ?duration,
            "Fixity tick complete"
        );

        Ok(TickReport {
            enrolled,
            reclaimed,
            admitted,
            drained,
            duration,
        })
    }

    fn plan(service: &FixityService, gate: &QueueGate) -> Result<(u64, u64, u64)> {
        let config = service.config();

        let enrolled = match service.enable_sources(config.source_chunk) {
            Ok(enrolled) => enrolled,
            Err(e) => {
                warn!(error = %e, "Enabling candidate sources failed");
                0
            }
        };

        let now = service.clock().now();
        let reclaimed = gate.reclaim(now.saturating_sub(config.reclaim_after as i64))?;
        service.metrics().record_reclaimed(reclaimed);

        let pass = service.pass()?;
        let admitted = gate.admit_due(&pass, config.queue_limit)?;
        service.metrics().record_admitted(admitted);

        Ok((enrolled, reclaimed, admitted))
    }
}
