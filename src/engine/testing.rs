//! Scripted collaborators for scheduler and runner tests.

use super::{PhaseReporter, Prober, ThroughputTester};
use crate::error::{ProbeFailure, ThroughputFailure};
use crate::model::{
    MonitorConfig, MonitorEvent, ProbeResult, ThroughputPhase, ThroughputResult,
};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Reports every probe's target on `calls` and then waits for the test to
/// hand it a result, so tests control exactly when each probe completes.
pub struct ScriptedProber {
    calls: mpsc::UnboundedSender<String>,
    results: Mutex<mpsc::UnboundedReceiver<ProbeResult>>,
}

impl ScriptedProber {
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<ProbeResult>,
    ) {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let prober = Self {
            calls: calls_tx,
            results: Mutex::new(results_rx),
        };
        (prober, calls_rx, results_tx)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, target: &str, _timeout: Duration) -> ProbeResult {
        self.calls.send(target.to_string()).ok();
        self.results
            .lock()
            .await
            .recv()
            .await
            .unwrap_or_else(|| ProbeResult::failure(ProbeFailure::Other("script ended".into())))
    }
}

/// Sleeps through each phase, then returns a fixed outcome.
pub struct SlowTester {
    phase_time: Duration,
    outcome: Result<ThroughputResult, ThroughputFailure>,
}

impl SlowTester {
    pub fn ok(phase_time: Duration) -> Self {
        Self {
            phase_time,
            outcome: Ok(sample_result()),
        }
    }

    pub fn failing(phase_time: Duration, message: &str) -> Self {
        Self {
            phase_time,
            outcome: Err(ThroughputFailure::new(message)),
        }
    }
}

#[async_trait]
impl ThroughputTester for SlowTester {
    async fn measure(
        &self,
        progress: &PhaseReporter,
    ) -> Result<ThroughputResult, ThroughputFailure> {
        for phase in [
            ThroughputPhase::ServerSelection,
            ThroughputPhase::Download,
            ThroughputPhase::Upload,
        ] {
            progress.phase(phase);
            tokio::time::sleep(self.phase_time).await;
        }
        self.outcome.clone()
    }
}

pub fn sample_result() -> ThroughputResult {
    ThroughputResult {
        download_mbps: 250.4,
        upload_mbps: 48.9,
        latency_ms: 11.2,
        server: Some("AMS - Amsterdam - Netherlands".into()),
    }
}

/// Config whose probe timeout never fires during a test.
pub fn test_config(target: &str) -> MonitorConfig {
    MonitorConfig {
        target: target.to_string(),
        probe_interval: Duration::from_secs(1),
        probe_timeout: Duration::from_secs(3600),
        ..MonitorConfig::default()
    }
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

pub fn log_texts(events: &[MonitorEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            MonitorEvent::Log { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}
