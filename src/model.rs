use crate::error::ProbeFailure;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

pub const DEFAULT_TARGET: &str = "1.1.1.1";
pub const DEFAULT_BASE_URL: &str = "https://speed.cloudflare.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// TCP handshake time to host:port
    Tcp,
    /// HTTP HEAD round-trip to https://host/
    Http,
}

/// URL scheme for HTTP probes of bare targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HttpScheme {
    /// http on port 80, https otherwise
    Auto,
    Http,
    Https,
}

impl HttpScheme {
    pub fn for_port(self, port: u16) -> &'static str {
        match self {
            HttpScheme::Http => "http",
            HttpScheme::Https => "https",
            HttpScheme::Auto if port == 80 => "http",
            HttpScheme::Auto => "https",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub target: String,
    pub probe_mode: ProbeMode,
    /// Port used when the target does not carry one.
    pub port: u16,
    pub http_scheme: HttpScheme,
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    pub throughput: ThroughputConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            probe_mode: ProbeMode::Tcp,
            port: 443,
            http_scheme: HttpScheme::Auto,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(2),
            throughput: ThroughputConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub download_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub upload_duration: Duration,
    pub concurrency: usize,
    pub download_bytes_per_req: u64,
    pub upload_bytes_per_req: u64,
    /// Idle latency samples taken while selecting the server.
    pub latency_samples: u32,
    pub user_agent: String,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            download_duration: Duration::from_secs(10),
            upload_duration: Duration::from_secs(10),
            concurrency: 6,
            download_bytes_per_req: 10_000_000,
            upload_bytes_per_req: 5_000_000,
            latency_samples: 5,
            user_agent: format!("pingwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            bail!("target must not be empty");
        }
        if self.probe_interval.is_zero() {
            bail!("probe interval must be greater than zero");
        }
        if self.probe_timeout.is_zero() {
            bail!("probe timeout must be greater than zero");
        }
        if self.throughput.concurrency == 0 {
            bail!("speed test concurrency must be at least 1");
        }
        if self.throughput.latency_samples == 0 {
            bail!("speed test needs at least one latency sample");
        }
        Ok(())
    }
}

/// Outcome of one probe. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeResult {
    Success { latency_ms: f64 },
    Failure { reason: ProbeFailure },
}

impl ProbeResult {
    pub fn success(latency_ms: f64) -> Self {
        ProbeResult::Success {
            latency_ms: latency_ms.max(0.0),
        }
    }

    pub fn failure(reason: ProbeFailure) -> Self {
        ProbeResult::Failure { reason }
    }

    pub fn latency_ms(&self) -> Option<f64> {
        match self {
            ProbeResult::Success { latency_ms } => Some(*latency_ms),
            ProbeResult::Failure { .. } => None,
        }
    }
}

/// Point-in-time copy of the running statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsState {
    pub total_probes: u64,
    pub failed_probes: u64,
    pub mean_latency_ms: f64,
    pub packet_loss_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ThroughputStatus {
    Running,
    Success(ThroughputResult),
    Failure { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThroughputPhase {
    ServerSelection,
    Download,
    Upload,
}

impl ThroughputPhase {
    pub fn progress_line(self) -> &'static str {
        match self {
            ThroughputPhase::ServerSelection => "Getting best server...",
            ThroughputPhase::Download => "Testing download speed...",
            ThroughputPhase::Upload => "Testing upload speed...",
        }
    }
}

/// Everything the core tells a front end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Log {
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
        text: String,
    },
    StatsChanged {
        stats: StatsState,
    },
    ThroughputStatus {
        status: ThroughputStatus,
    },
    TargetChanged {
        target: String,
    },
    /// Latest accepted probe, for a "current ping" readout.
    Sample {
        target: String,
        result: ProbeResult,
    },
    MonitoringChanged {
        running: bool,
    },
}

impl MonitorEvent {
    pub fn log(text: impl Into<String>) -> Self {
        MonitorEvent::Log {
            at: local_now(),
            text: text.into(),
        }
    }
}

/// Commands accepted from any front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetTarget(String),
    Start,
    Stop,
    RunThroughput,
    ResetStats,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let line = s.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((w, r)) => (w, r.trim()),
            None => (line, ""),
        };
        match word.to_ascii_lowercase().as_str() {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "speedtest" | "speed" => Ok(Command::RunThroughput),
            "reset" => Ok(Command::ResetStats),
            "target" | "set" => {
                if rest.is_empty() {
                    bail!("`{word}` needs a host, e.g. `target google.com`");
                }
                Ok(Command::SetTarget(rest.to_string()))
            }
            "" => bail!("empty command"),
            other => bail!("unknown command `{other}`"),
        }
    }
}

/// Current wall-clock time in the local offset, UTC if the offset is unknown.
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `HH:MM:SS` prefix used by probe log lines.
pub fn clock_label(at: OffsetDateTime) -> String {
    at.format(time::macros::format_description!(
        "[hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| "--:--:--".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn http_scheme_follows_port_in_auto_mode() {
        assert_eq!(HttpScheme::Auto.for_port(80), "http");
        assert_eq!(HttpScheme::Auto.for_port(443), "https");
        assert_eq!(HttpScheme::Auto.for_port(8080), "https");
        assert_eq!(HttpScheme::Http.for_port(443), "http");
        assert_eq!(HttpScheme::Https.for_port(80), "https");
    }

    #[test]
    fn parses_commands() {
        assert_eq!("start".parse::<Command>().unwrap(), Command::Start);
        assert_eq!(" STOP ".parse::<Command>().unwrap(), Command::Stop);
        assert_eq!("speedtest".parse::<Command>().unwrap(), Command::RunThroughput);
        assert_eq!("reset".parse::<Command>().unwrap(), Command::ResetStats);
        assert_eq!(
            "target   8.8.8.8 ".parse::<Command>().unwrap(),
            Command::SetTarget("8.8.8.8".into())
        );
        assert_eq!(
            "set google.com".parse::<Command>().unwrap(),
            Command::SetTarget("google.com".into())
        );
    }

    #[test]
    fn rejects_bad_commands() {
        assert!("".parse::<Command>().is_err());
        assert!("target".parse::<Command>().is_err());
        assert!("launch".parse::<Command>().is_err());
    }

    #[test]
    fn clock_label_is_hours_minutes_seconds() {
        assert_eq!(clock_label(datetime!(2024-03-01 07:05:09 UTC)), "07:05:09");
    }

    #[test]
    fn config_file_accepts_partial_json_with_humantime_durations() {
        let cfg: MonitorConfig = serde_json::from_str(
            r#"{"target": "9.9.9.9", "probe_interval": "500ms", "throughput": {"download_duration": "3s"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.target, "9.9.9.9");
        assert_eq!(cfg.probe_interval, Duration::from_millis(500));
        assert_eq!(cfg.probe_timeout, Duration::from_secs(2));
        assert_eq!(cfg.throughput.download_duration, Duration::from_secs(3));
        assert_eq!(cfg.throughput.upload_duration, Duration::from_secs(10));
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        let mut cfg = MonitorConfig::default();
        cfg.probe_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = MonitorConfig::default();
        cfg.target = "  ".into();
        assert!(cfg.validate().is_err());

        let mut cfg = MonitorConfig::default();
        cfg.throughput.concurrency = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn events_serialize_as_tagged_json() {
        let ev = MonitorEvent::Sample {
            target: "1.1.1.1".into(),
            result: ProbeResult::failure(ProbeFailure::Timeout),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "sample");
        assert_eq!(v["result"]["outcome"], "failure");
        assert_eq!(v["result"]["reason"], "timeout");

        let ev = MonitorEvent::ThroughputStatus {
            status: ThroughputStatus::Success(ThroughputResult {
                download_mbps: 100.0,
                upload_mbps: 20.0,
                latency_ms: 12.5,
                server: None,
            }),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["status"]["state"], "success");
        assert_eq!(v["status"]["download_mbps"], 100.0);
    }

    #[test]
    fn success_latency_is_never_negative() {
        assert_eq!(ProbeResult::success(-1.0).latency_ms(), Some(0.0));
        assert_eq!(ProbeResult::failure(ProbeFailure::Timeout).latency_ms(), None);
    }
}
