use crate::engine::{build_prober, CloudflareTester, Monitor, ThroughputTester};
use crate::model::{
    Command, HttpScheme, MonitorConfig, MonitorEvent, ProbeMode, StatsState, ThroughputConfig,
    DEFAULT_BASE_URL, DEFAULT_TARGET,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

const HELP: &str = "\
commands:
  start             start ping monitoring
  stop              stop ping monitoring
  target <host>     change the monitored host
  speedtest         run a speed test
  reset             clear statistics
  stats             print statistics
  status            show target, monitoring and speed test state
  quit              exit";

#[derive(Debug, Parser, Clone)]
#[command(
    name = "pingwatch",
    version,
    about = "Ping monitor with running statistics and an on-demand speed test"
)]
pub struct Cli {
    /// Host to monitor: host, host:port, [v6]:port or an IP address
    #[arg(long)]
    pub target: Option<String>,

    /// How each ping is measured
    #[arg(long, value_enum, default_value_t = ProbeMode::Tcp)]
    pub probe_mode: ProbeMode,

    /// Port used when the target does not name one
    #[arg(long, default_value_t = 443)]
    pub port: u16,

    /// Scheme for http probes of bare targets
    #[arg(long, value_enum, default_value_t = HttpScheme::Auto)]
    pub http_scheme: HttpScheme,

    /// Time between pings
    #[arg(long, default_value = "1s")]
    pub interval: humantime::Duration,

    /// Per-ping timeout
    #[arg(long, default_value = "2s")]
    pub probe_timeout: humantime::Duration,

    /// Base URL for the Cloudflare speed test service
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Download phase duration
    #[arg(long, default_value = "10s")]
    pub download_duration: humantime::Duration,

    /// Upload phase duration
    #[arg(long, default_value = "10s")]
    pub upload_duration: humantime::Duration,

    /// Concurrency for download/upload workers
    #[arg(long, default_value_t = 6)]
    pub concurrency: usize,

    /// Bytes per download request
    #[arg(long, default_value_t = 10_000_000)]
    pub download_bytes_per_req: u64,

    /// Bytes per upload request
    #[arg(long, default_value_t = 5_000_000)]
    pub upload_bytes_per_req: u64,

    /// Latency samples taken while picking the speed test server
    #[arg(long, default_value_t = 5)]
    pub latency_samples: u32,

    /// Load settings from a JSON file instead of the flags above (--target still applies)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print every event as a JSON line
    #[arg(long)]
    pub json: bool,

    /// Use --start-on-launch true or --start-on-launch false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,

    /// Run a speed test right after launch
    #[arg(long)]
    pub speedtest: bool,

    /// Exit after this long instead of waiting for `quit`
    #[arg(long)]
    pub run_for: Option<humantime::Duration>,
}

pub fn load_config(path: &Path) -> Result<MonitorConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config from {}", path.display()))
}

/// Build a `MonitorConfig` from CLI arguments or the `--config` file.
pub fn build_config(args: &Cli) -> Result<MonitorConfig> {
    let mut cfg = match &args.config {
        Some(path) => load_config(path)?,
        None => MonitorConfig {
            target: DEFAULT_TARGET.to_string(),
            probe_mode: args.probe_mode,
            port: args.port,
            http_scheme: args.http_scheme,
            probe_interval: Duration::from(args.interval),
            probe_timeout: Duration::from(args.probe_timeout),
            throughput: ThroughputConfig {
                base_url: args.base_url.clone(),
                download_duration: Duration::from(args.download_duration),
                upload_duration: Duration::from(args.upload_duration),
                concurrency: args.concurrency,
                download_bytes_per_req: args.download_bytes_per_req,
                upload_bytes_per_req: args.upload_bytes_per_req,
                latency_samples: args.latency_samples,
                ..ThroughputConfig::default()
            },
        },
    };
    if let Some(target) = &args.target {
        cfg.target = target.trim().to_string();
    }
    cfg.validate()?;
    Ok(cfg)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Text,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub fn stats_block(stats: &StatsState) -> String {
    format!(
        "Statistics:\nAverage Ping: {:.1} ms\nPacket Loss: {:.1}%\nTotal Pings: {}",
        stats.mean_latency_ms, stats.packet_loss_pct, stats.total_probes
    )
}

/// Text mode shows the log lines only; the other events back richer views.
fn render_text(ev: &MonitorEvent) -> Option<String> {
    match ev {
        MonitorEvent::Log { text, .. } => Some(text.clone()),
        _ => None,
    }
}

fn emit(output: Output, ev: &MonitorEvent) -> Result<()> {
    match output {
        Output::Text => {
            if let Some(line) = render_text(ev) {
                println!("{line}");
            }
        }
        Output::Json => println!("{}", serde_json::to_string(ev)?),
    }
    Ok(())
}

fn print_stats(output: Output, stats: StatsState) -> Result<()> {
    match output {
        Output::Text => {
            println!("{}", stats_block(&stats));
            Ok(())
        }
        Output::Json => emit(output, &MonitorEvent::StatsChanged { stats }),
    }
}

fn status_text(monitor: &Monitor) -> String {
    format!(
        "Target: {}\nMonitoring: {}\nSpeed test: {}",
        monitor.target(),
        if monitor.is_monitoring() { "running" } else { "stopped" },
        if monitor.is_throughput_running() { "running" } else { "idle" },
    )
}

fn print_status(output: Output, monitor: &Monitor) -> Result<()> {
    match output {
        Output::Text => println!("{}", status_text(monitor)),
        Output::Json => println!(
            "{}",
            serde_json::to_string(&serde_json::json!({
                "event": "status",
                "target": monitor.target(),
                "running": monitor.is_monitoring(),
                "throughput_running": monitor.is_throughput_running(),
            }))?
        ),
    }
    Ok(())
}

fn handle_line(monitor: &mut Monitor, output: Output, line: &str) -> Result<Flow> {
    let line = line.trim();
    match line.to_ascii_lowercase().as_str() {
        "" => {}
        "quit" | "exit" | "q" => return Ok(Flow::Quit),
        "stats" => print_stats(output, monitor.stats())?,
        "status" => print_status(output, monitor)?,
        "help" | "?" => eprintln!("{HELP}"),
        _ => match line.parse::<Command>() {
            Ok(cmd) => {
                if let Err(rejected) = monitor.handle(cmd) {
                    eprintln!("{rejected}");
                }
            }
            Err(e) => eprintln!("{e:#} (type `help` for commands)"),
        },
    }
    Ok(Flow::Continue)
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args)?;
    let output = if args.json { Output::Json } else { Output::Text };

    let prober = build_prober(&cfg)?;
    let tester: Arc<dyn ThroughputTester> = Arc::new(
        CloudflareTester::new(&cfg.throughput).context("failed to set up speed test client")?,
    );
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<MonitorEvent>();
    let mut monitor = Monitor::new(&cfg, prober, tester, Arc::new(evt_tx));
    info!(target_host = %cfg.target, mode = ?cfg.probe_mode, "monitor ready");

    if output == Output::Text {
        eprintln!("Monitoring {} (type `help` for commands)", cfg.target);
    }
    if args.start_on_launch {
        monitor.handle(Command::Start)?;
    }
    if args.speedtest {
        monitor.handle(Command::RunThroughput)?;
    }

    let deadline = args
        .run_for
        .map(|d| tokio::time::Instant::now() + Duration::from(d));
    let run_for = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(run_for);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            Some(ev) = evt_rx.recv() => emit(output, &ev)?,
            line = lines.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) => {
                        if handle_line(&mut monitor, output, &line)? == Flow::Quit {
                            break;
                        }
                    }
                    None => {
                        stdin_open = false;
                        if deadline.is_none() {
                            break;
                        }
                    }
                }
            }
            _ = &mut run_for => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.handle(Command::Stop)?;
    while let Ok(ev) = evt_rx.try_recv() {
        emit(output, &ev)?;
    }
    print_stats(output, monitor.stats())
}
