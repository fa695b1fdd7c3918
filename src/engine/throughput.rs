use super::{PhaseReporter, ThroughputTester};
use crate::error::{CommandRejected, ThroughputFailure};
use crate::model::{MonitorEvent, ThroughputResult, ThroughputStatus};
use crate::sink::EventSink;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Runs at most one throughput test at a time. Independent of the probe
/// scheduler and its statistics.
pub struct ThroughputRunner {
    tester: Arc<dyn ThroughputTester>,
    sink: Arc<dyn EventSink>,
    busy: Arc<AtomicBool>,
}

/// Clears the busy flag when the run ends, however it ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ThroughputRunner {
    pub fn new(tester: Arc<dyn ThroughputTester>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            tester,
            sink,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn run(&self) -> Result<JoinHandle<()>, CommandRejected> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("speed test requested while one is in flight");
            return Err(CommandRejected::ThroughputAlreadyRunning);
        }
        let guard = BusyGuard(self.busy.clone());

        info!("speed test started");
        self.sink.emit(MonitorEvent::ThroughputStatus {
            status: ThroughputStatus::Running,
        });

        let tester = self.tester.clone();
        let sink = self.sink.clone();
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let measuring = {
                let sink = sink.clone();
                tokio::spawn(async move {
                    let progress = PhaseReporter::new(sink);
                    tester.measure(&progress).await
                })
            };
            let outcome = match measuring.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_panic() => {
                    error!("speed test task panicked");
                    Err(ThroughputFailure::new("speed test aborted unexpectedly"))
                }
                Err(_) => Err(ThroughputFailure::new("speed test cancelled")),
            };
            report(sink.as_ref(), outcome);
        }))
    }
}

/// Emits the closing log line and the terminal status for one run.
fn report(sink: &dyn EventSink, outcome: Result<ThroughputResult, ThroughputFailure>) {
    match outcome {
        Ok(result) => {
            info!(
                download_mbps = result.download_mbps,
                upload_mbps = result.upload_mbps,
                latency_ms = result.latency_ms,
                "speed test finished"
            );
            sink.emit(MonitorEvent::log(results_text(&result)));
            sink.emit(MonitorEvent::ThroughputStatus {
                status: ThroughputStatus::Success(result),
            });
        }
        Err(failure) => {
            warn!(error = %failure, "speed test failed");
            sink.emit(MonitorEvent::log(format!("Speed test error: {failure}")));
            sink.emit(MonitorEvent::ThroughputStatus {
                status: ThroughputStatus::Failure {
                    message: failure.message,
                },
            });
        }
    }
}

fn results_text(result: &ThroughputResult) -> String {
    let mut text = String::from("Speed test results:\n");
    if let Some(server) = result.server.as_deref() {
        text.push_str(&format!("Server: {server}\n"));
    }
    text.push_str(&format!(
        "Download: {:.1} Mbps\nUpload: {:.1} Mbps\nLatency: {:.1} ms",
        result.download_mbps, result.upload_mbps, result.latency_ms
    ));
    text
}
