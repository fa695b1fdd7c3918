mod cloudflare;
mod dns;
mod latency;
mod scheduler;
#[cfg(test)]
pub(crate) mod testing;
mod throughput;

pub use cloudflare::CloudflareTester;
pub use latency::build_prober;
pub use scheduler::ProbeScheduler;
pub use throughput::ThroughputRunner;

use crate::error::{CommandRejected, ThroughputFailure};
use crate::model::{
    Command, MonitorConfig, MonitorEvent, ProbeResult, StatsState, ThroughputPhase,
    ThroughputResult,
};
use crate::sink::EventSink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One latency measurement against a target. Implementations must resolve
/// within `timeout` (reporting `ProbeFailure::Timeout`) and must not retry.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &str, timeout: Duration) -> ProbeResult;
}

/// Server selection, download and upload as sequential phases. A failure in
/// any phase fails the whole measurement.
#[async_trait]
pub trait ThroughputTester: Send + Sync {
    async fn measure(
        &self,
        progress: &PhaseReporter,
    ) -> Result<ThroughputResult, ThroughputFailure>;
}

/// Handed to a `ThroughputTester` so it can announce each phase.
pub struct PhaseReporter {
    sink: Arc<dyn EventSink>,
}

impl PhaseReporter {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    pub fn phase(&self, phase: ThroughputPhase) {
        tracing::debug!(?phase, "speed test phase");
        self.sink.emit(MonitorEvent::log(phase.progress_line()));
    }
}

/// The command surface: owns the probe scheduler and the throughput runner
/// and applies front-end commands to them.
pub struct Monitor {
    scheduler: ProbeScheduler,
    throughput: ThroughputRunner,
}

impl Monitor {
    pub fn new(
        cfg: &MonitorConfig,
        prober: Arc<dyn Prober>,
        tester: Arc<dyn ThroughputTester>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            scheduler: ProbeScheduler::new(cfg, prober, sink.clone()),
            throughput: ThroughputRunner::new(tester, sink),
        }
    }

    pub fn handle(&mut self, cmd: Command) -> Result<(), CommandRejected> {
        match cmd {
            Command::SetTarget(target) => self.scheduler.set_target(&target),
            Command::Start => self.scheduler.start(),
            Command::Stop => self.scheduler.stop(),
            Command::RunThroughput => {
                self.throughput.run()?;
            }
            Command::ResetStats => self.scheduler.reset_stats(),
        }
        Ok(())
    }

    pub fn stats(&self) -> StatsState {
        self.scheduler.snapshot()
    }

    pub fn target(&self) -> String {
        self.scheduler.target()
    }

    pub fn is_monitoring(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn is_throughput_running(&self) -> bool {
        self.throughput.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{drain, log_texts, test_config, ScriptedProber, SlowTester};
    use super::*;
    use crate::error::ProbeFailure;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn commands_drive_scheduler_and_runner() {
        let (prober, mut calls, results) = ScriptedProber::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = Monitor::new(
            &test_config("1.1.1.1"),
            Arc::new(prober),
            Arc::new(SlowTester::ok(Duration::from_secs(5))),
            Arc::new(tx),
        );

        monitor.handle("start".parse().unwrap()).unwrap();
        assert!(monitor.is_monitoring());
        assert_eq!(calls.recv().await.unwrap(), "1.1.1.1");
        results.send(ProbeResult::success(7.0)).unwrap();
        assert_eq!(calls.recv().await.unwrap(), "1.1.1.1");
        assert_eq!(monitor.stats().total_probes, 1);

        monitor.handle(Command::ResetStats).unwrap();
        assert_eq!(monitor.stats(), StatsState::default());

        monitor.handle(Command::RunThroughput).unwrap();
        assert!(monitor.is_throughput_running());
        assert_eq!(
            monitor.handle(Command::RunThroughput),
            Err(CommandRejected::ThroughputAlreadyRunning)
        );

        monitor.handle(Command::SetTarget("8.8.8.8".into())).unwrap();
        assert_eq!(monitor.target(), "8.8.8.8");
        results
            .send(ProbeResult::failure(ProbeFailure::Timeout))
            .unwrap();
        assert_eq!(calls.recv().await.unwrap(), "8.8.8.8");
        assert_eq!(monitor.stats().total_probes, 0);

        monitor.handle(Command::Stop).unwrap();
        assert!(!monitor.is_monitoring());

        let events = drain(&mut rx);
        assert!(events.contains(&MonitorEvent::TargetChanged {
            target: "8.8.8.8".into()
        }));
    }

    #[test]
    fn phase_reporter_logs_progress_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reporter = PhaseReporter::new(Arc::new(tx));
        reporter.phase(ThroughputPhase::ServerSelection);
        reporter.phase(ThroughputPhase::Upload);

        assert_eq!(
            log_texts(&drain(&mut rx)),
            vec!["Getting best server...", "Testing upload speed..."]
        );
    }
}
