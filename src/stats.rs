use crate::model::StatsState;

/// Running probe counters. Only successful probes contribute to the mean,
/// so no sample history needs to be kept.
#[derive(Debug, Default, Clone)]
pub struct StatsAccumulator {
    total: u64,
    failed: u64,
    mean_ms: f64,
}

impl StatsAccumulator {
    pub fn record(&mut self, success: bool, latency_ms: f64) {
        self.total += 1;
        if !success {
            self.failed += 1;
            return;
        }
        let n = (self.total - self.failed) as f64;
        self.mean_ms = (self.mean_ms * (n - 1.0) + latency_ms) / n;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> StatsState {
        let packet_loss_pct = if self.total == 0 {
            0.0
        } else {
            100.0 * (self.failed as f64) / (self.total as f64)
        };
        StatsState {
            total_probes: self.total,
            failed_probes: self.failed,
            mean_latency_ms: self.mean_ms,
            packet_loss_pct,
        }
    }
}
