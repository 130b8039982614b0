//! Cycle scheduling for the device fleet.
//!
//! Every device runs the same cycle: fetch, apply the outcome to the device,
//! publish. [`CycleRunner`] drives that cycle under one of two topologies:
//!
//! - [`Strategy::PerDevice`]: one task per device, each sleeping its own
//!   interval between cycles.
//! - [`Strategy::Pool`]: a fixed number of workers sharing a rotating queue.
//!   A worker takes the head device, runs one cycle and puts it back at the
//!   tail, so devices are served round-robin.
//!
//! A device is owned by exactly one task at a time (its loop, or the worker
//! that dequeued it), so two cycles of the same device never overlap.
//! Disabled devices are dropped from scheduling and never block others.

use crate::device::{Device, FailureKind};
use crate::fetcher::{FetchError, ImageFetcher};
use crate::publisher::{PublishOutcome, Publisher};
use futures::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PerDevice,
    Pool { workers: usize },
}

/// Timing and failure policy shared by all devices.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub interval: Duration,
    pub initial_jitter: Duration,
    pub fetch_timeout: Duration,
    pub count_publish_failures: bool,
}

/// Totals reported when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub devices: usize,
    pub disabled: usize,
    pub cycles: u64,
    pub panics: u64,
}

#[derive(Default)]
struct RunStats {
    disabled: AtomicUsize,
    cycles: AtomicU64,
    panics: AtomicU64,
}

struct QueuedDevice {
    device: Device,
    not_before: Instant,
}

/// Drives fetch→publish cycles for a set of devices.
#[derive(Clone)]
pub struct CycleRunner {
    strategy: Strategy,
    settings: CycleSettings,
    fetcher: Arc<dyn ImageFetcher>,
    publisher: Arc<Publisher>,
}

impl CycleRunner {
    pub fn new(
        strategy: Strategy,
        settings: CycleSettings,
        fetcher: Arc<dyn ImageFetcher>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            strategy,
            settings,
            fetcher,
            publisher,
        }
    }

    /// Run until `shutdown` fires or every device is disabled. In-flight
    /// cycles are always allowed to finish before this returns.
    pub async fn run(&self, devices: Vec<Device>, shutdown: CancellationToken) -> RunSummary {
        let stats = Arc::new(RunStats::default());
        let device_count = devices.len();

        info!(
            devices = device_count,
            strategy = ?self.strategy,
            interval_secs = self.settings.interval.as_secs(),
            "Starting cycle runner"
        );

        let mut tasks = match self.strategy {
            Strategy::PerDevice => self.spawn_device_loops(devices, &shutdown, &stats),
            Strategy::Pool { workers } => self.spawn_pool(devices, workers, &shutdown, &stats),
        };

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Scheduler task ended abnormally");
            }
        }

        RunSummary {
            devices: device_count,
            disabled: stats.disabled.load(Ordering::SeqCst),
            cycles: stats.cycles.load(Ordering::SeqCst),
            panics: stats.panics.load(Ordering::SeqCst),
        }
    }

    fn spawn_device_loops(
        &self,
        devices: Vec<Device>,
        shutdown: &CancellationToken,
        stats: &Arc<RunStats>,
    ) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for device in devices {
            let runner = self.clone();
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            tasks.spawn(async move { runner.device_loop(device, shutdown, stats).await });
        }
        tasks
    }

    async fn device_loop(self, mut device: Device, shutdown: CancellationToken, stats: Arc<RunStats>) {
        if !self.pause(initial_jitter(self.settings.initial_jitter), &shutdown).await {
            return;
        }

        loop {
            if device.is_disabled() {
                stats.disabled.fetch_add(1, Ordering::SeqCst);
                return;
            }

            self.guarded_cycle(&mut device, &stats).await;

            if device.is_disabled() {
                continue;
            }
            if !self.pause(self.settings.interval, &shutdown).await {
                debug!(device_id = %device.id(), "Device loop stopped");
                return;
            }
        }
    }

    fn spawn_pool(
        &self,
        devices: Vec<Device>,
        workers: usize,
        shutdown: &CancellationToken,
        stats: &Arc<RunStats>,
    ) -> JoinSet<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let active = Arc::new(AtomicUsize::new(devices.len()));
        // Stops the workers on shutdown, or once nothing is left to poll.
        let pool_done = shutdown.child_token();

        let now = Instant::now();
        for device in devices {
            let _ = tx.send(QueuedDevice {
                device,
                not_before: now,
            });
        }
        if active.load(Ordering::SeqCst) == 0 {
            pool_done.cancel();
        }

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers.max(1) {
            let runner = self.clone();
            let tx = tx.clone();
            let rx = rx.clone();
            let active = active.clone();
            let pool_done = pool_done.clone();
            let stats = stats.clone();

            tasks.spawn(async move {
                runner
                    .pool_worker(worker_id, tx, rx, active, pool_done, stats)
                    .await
            });
        }
        tasks
    }

    async fn pool_worker(
        self,
        worker_id: usize,
        tx: mpsc::UnboundedSender<QueuedDevice>,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<QueuedDevice>>>,
        active: Arc<AtomicUsize>,
        pool_done: CancellationToken,
        stats: Arc<RunStats>,
    ) {
        if !self.pause(initial_jitter(self.settings.initial_jitter), &pool_done).await {
            return;
        }

        debug!(worker_id, "Pool worker started");

        loop {
            let next = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = pool_done.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(mut item) = next else {
                break;
            };

            // Queue order is due order, so waiting on the head is fair.
            tokio::select! {
                biased;
                _ = pool_done.cancelled() => break,
                _ = sleep_until(item.not_before) => {}
            }

            if !item.device.is_disabled() {
                self.guarded_cycle(&mut item.device, &stats).await;
            }

            if item.device.is_disabled() {
                stats.disabled.fetch_add(1, Ordering::SeqCst);
                if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                    warn!("Every device is disabled, stopping pool");
                    pool_done.cancel();
                }
                continue;
            }

            item.not_before = Instant::now() + self.settings.interval;
            let _ = tx.send(item);
        }

        debug!(worker_id, "Pool worker stopped");
    }

    /// Sleep unless shutdown arrives first. Returns `false` on shutdown.
    async fn pause(&self, duration: Duration, shutdown: &CancellationToken) -> bool {
        if shutdown.is_cancelled() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }

    /// Run one cycle, containing any panic to this device.
    async fn guarded_cycle(&self, device: &mut Device, stats: &RunStats) {
        let device_id = device.id().to_string();

        match AssertUnwindSafe(self.run_cycle(device)).catch_unwind().await {
            Ok(()) => {
                stats.cycles.fetch_add(1, Ordering::SeqCst);
            }
            Err(panic) => {
                stats.panics.fetch_add(1, Ordering::SeqCst);
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(device_id = %device_id, panic = %message, "Cycle panicked");
            }
        }
    }

    /// One fetch→publish cycle. Publishing runs whatever the fetch outcome.
    pub async fn run_cycle(&self, device: &mut Device) {
        device.begin_fetch();

        let fetched = match timeout(self.settings.fetch_timeout, self.fetcher.fetch(device)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Network(format!(
                "no response within {}s",
                self.settings.fetch_timeout.as_secs_f32()
            ))),
        };

        match fetched {
            Ok(image) => {
                debug!(device_id = %device.id(), size_bytes = image.len(), "Snapshot fetched");
                metrics::counter!("relay.fetch.success").increment(1);
                device.record_success(image);
            }
            Err(e) => {
                let kind = e.kind();
                error!(
                    device_id = %device.id(),
                    kind = %kind,
                    error = %e,
                    "Failed to fetch snapshot"
                );
                metrics::counter!("relay.fetch.failure", "kind" => kind.as_str()).increment(1);
                self.apply_failure(device, kind);
            }
        }

        match self.publisher.publish(device).await {
            Ok(outcome) => {
                debug!(device_id = %device.id(), outcome = outcome.as_str(), "Publish step done");
                match outcome {
                    PublishOutcome::Skipped => {
                        metrics::counter!("relay.publish.skipped").increment(1);
                    }
                    written => {
                        metrics::counter!("relay.publish.written", "payload" => written.as_str())
                            .increment(1);
                    }
                }
            }
            Err(e) => {
                error!(
                    device_id = %device.id(),
                    kind = %FailureKind::Publish,
                    error = %e,
                    "Failed to publish snapshot"
                );
                metrics::counter!("relay.publish.failure").increment(1);
                if self.settings.count_publish_failures {
                    self.apply_failure(device, FailureKind::Publish);
                }
            }
        }
    }

    fn apply_failure(&self, device: &mut Device, kind: FailureKind) {
        if device.record_failure(kind) {
            warn!(
                device_id = %device.id(),
                kind = %kind,
                failures = device.consecutive_failures(),
                "Device disabled, no further cycles will run"
            );
            metrics::counter!("relay.devices.disabled").increment(1);
        }
    }
}

fn initial_jitter(bound: Duration) -> Duration {
    let bound_ms = bound.as_millis() as u64;
    if bound_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=bound_ms))
}
