use super::Prober;
use crate::error::ProbeFailure;
use crate::model::{clock_label, local_now, MonitorConfig, MonitorEvent, ProbeResult, StatsState};
use crate::sink::EventSink;
use crate::stats::StatsAccumulator;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Extra time granted to a prober beyond its own timeout before the
/// scheduler gives up on it and records a timeout itself.
const PROBE_GRACE: Duration = Duration::from_millis(500);

/// State shared between the control side and the probe task.
struct Shared {
    target: String,
    running: bool,
    /// Bumped on every start and effective retarget. A probe result is
    /// recorded only if the generation it was issued under is still current.
    generation: u64,
    /// Bumped on every start. A probe task exits once its run is over.
    run_id: u64,
    stats: StatsAccumulator,
}

impl Shared {
    fn owns_run(&self, run_id: u64) -> bool {
        self.running && self.run_id == run_id
    }
}

struct ProbeTask {
    cancel: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

/// Owns the current target, the running/stopped state and the periodic
/// probe task that feeds the statistics.
pub struct ProbeScheduler {
    shared: Arc<Mutex<Shared>>,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn EventSink>,
    interval: Duration,
    probe_timeout: Duration,
    task: Option<ProbeTask>,
}

impl ProbeScheduler {
    pub fn new(cfg: &MonitorConfig, prober: Arc<dyn Prober>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                target: cfg.target.trim().to_string(),
                running: false,
                generation: 0,
                run_id: 0,
                stats: StatsAccumulator::default(),
            })),
            prober,
            sink,
            interval: cfg.probe_interval,
            probe_timeout: cfg.probe_timeout,
            task: None,
        }
    }

    pub fn target(&self) -> String {
        lock(&self.shared).target.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared).running
    }

    pub fn snapshot(&self) -> StatsState {
        lock(&self.shared).stats.snapshot()
    }

    pub fn set_target(&mut self, target: &str) {
        let target = target.trim();
        let mut shared = lock(&self.shared);
        if target.is_empty() || shared.target == target {
            return;
        }
        shared.target = target.to_string();
        shared.generation += 1;
        shared.stats.reset();
        info!(host = %target, generation = shared.generation, "target changed");

        if shared.running {
            self.sink.emit(MonitorEvent::TargetChanged {
                target: target.to_string(),
            });
            self.sink
                .emit(MonitorEvent::log(format!("Changed target to: {target}")));
        }
        self.sink.emit(MonitorEvent::StatsChanged {
            stats: shared.stats.snapshot(),
        });
    }

    pub fn start(&mut self) {
        let (run_id, target) = {
            let mut shared = lock(&self.shared);
            if shared.running {
                return;
            }
            shared.stats.reset();
            shared.running = true;
            shared.generation += 1;
            shared.run_id += 1;
            info!(host = %shared.target, run_id = shared.run_id, "monitoring started");

            self.sink.emit(MonitorEvent::MonitoringChanged { running: true });
            self.sink.emit(MonitorEvent::log(format!(
                "Starting ping monitoring to {}...",
                shared.target
            )));
            self.sink.emit(MonitorEvent::StatsChanged {
                stats: shared.stats.snapshot(),
            });
            (shared.run_id, shared.target.clone())
        };

        let (cancel, cancel_rx) = watch::channel(false);
        let probe_loop = ProbeLoop {
            shared: self.shared.clone(),
            prober: self.prober.clone(),
            sink: self.sink.clone(),
            interval: self.interval,
            probe_timeout: self.probe_timeout,
            run_id,
        };
        debug!(host = %target, run_id, "spawning probe task");
        let handle = tokio::spawn(probe_loop.run(cancel_rx));
        self.task = Some(ProbeTask {
            cancel,
            _handle: handle,
        });
    }

    /// Stops issuing probes. An in-flight probe is left to finish and its
    /// result is dropped.
    pub fn stop(&mut self) {
        {
            let mut shared = lock(&self.shared);
            if !shared.running {
                return;
            }
            shared.running = false;
            info!(host = %shared.target, "monitoring stopped");
            self.sink.emit(MonitorEvent::MonitoringChanged { running: false });
            self.sink.emit(MonitorEvent::log("Stopped ping monitoring"));
        }
        if let Some(task) = self.task.take() {
            task.cancel.send(true).ok();
        }
    }

    /// User-requested reset, serialized with the probe task's updates.
    pub fn reset_stats(&mut self) {
        let mut shared = lock(&self.shared);
        shared.stats.reset();
        debug!("statistics reset");
        self.sink.emit(MonitorEvent::StatsChanged {
            stats: shared.stats.snapshot(),
        });
    }
}

impl Drop for ProbeScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.cancel.send(true).ok();
        }
    }
}

struct ProbeLoop {
    shared: Arc<Mutex<Shared>>,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn EventSink>,
    interval: Duration,
    probe_timeout: Duration,
    run_id: u64,
}

impl ProbeLoop {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        loop {
            let (target, generation) = {
                let shared = lock(&self.shared);
                if !shared.owns_run(self.run_id) {
                    break;
                }
                (shared.target.clone(), shared.generation)
            };

            let issued_at = local_now();
            debug!(host = %target, generation, "probing");
            let result = match tokio::time::timeout(
                self.probe_timeout + PROBE_GRACE,
                self.prober.probe(&target, self.probe_timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => ProbeResult::failure(ProbeFailure::Timeout),
            };

            {
                let mut shared = lock(&self.shared);
                if !shared.owns_run(self.run_id) {
                    debug!(host = %target, "monitoring stopped, dropping probe result");
                    break;
                }
                if shared.generation != generation {
                    debug!(host = %target, generation, "target changed, dropping stale probe result");
                } else {
                    self.record(&mut shared, &target, issued_at, result);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.changed() => break,
            }
        }
        debug!(run_id = self.run_id, "probe task finished");
    }

    fn record(
        &self,
        shared: &mut Shared,
        target: &str,
        issued_at: time::OffsetDateTime,
        result: ProbeResult,
    ) {
        debug!(host = %target, latency_ms = ?result.latency_ms(), "probe recorded");
        let stamp = clock_label(issued_at);
        let text = match &result {
            ProbeResult::Success { latency_ms } => {
                shared.stats.record(true, *latency_ms);
                format!("[{stamp}] Reply from {target}: time={latency_ms:.1}ms")
            }
            ProbeResult::Failure { reason } => {
                shared.stats.record(false, 0.0);
                if reason.is_timeout() {
                    format!("[{stamp}] Request timed out")
                } else {
                    format!("[{stamp}] Error: {reason}")
                }
            }
        };

        self.sink.emit(MonitorEvent::Log {
            at: issued_at,
            text,
        });
        self.sink.emit(MonitorEvent::Sample {
            target: target.to_string(),
            result,
        });
        self.sink.emit(MonitorEvent::StatsChanged {
            stats: shared.stats.snapshot(),
        });
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
