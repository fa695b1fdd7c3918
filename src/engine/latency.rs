use crate::engine::dns::{self, Endpoint};
use crate::engine::Prober;
use crate::error::ProbeFailure;
use crate::model::{HttpScheme, MonitorConfig, ProbeMode, ProbeResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

pub fn build_prober(cfg: &MonitorConfig) -> Result<Arc<dyn Prober>> {
    Ok(match cfg.probe_mode {
        ProbeMode::Tcp => Arc::new(TcpProber::new(cfg.port)),
        ProbeMode::Http => Arc::new(HttpProber::new(
            cfg.port,
            cfg.http_scheme,
            &cfg.throughput.user_agent,
        )?),
    })
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Measures the TCP handshake to `host:port`. Name resolution happens first
/// and is not part of the reported latency, but counts against the timeout.
pub struct TcpProber {
    default_port: u16,
}

impl TcpProber {
    pub fn new(default_port: u16) -> Self {
        Self { default_port }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: &str, timeout: Duration) -> ProbeResult {
        let endpoint = Endpoint::parse(target, self.default_port);
        let attempt = async {
            let addr = dns::resolve(&endpoint).await?;
            let start = Instant::now();
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| ProbeFailure::Other(e.to_string()))?;
            let ms = elapsed_ms(start);
            drop(stream);
            Ok::<f64, ProbeFailure>(ms)
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(ms)) => ProbeResult::success(ms),
            Ok(Err(reason)) => ProbeResult::failure(reason),
            Err(_) => ProbeResult::failure(ProbeFailure::Timeout),
        }
    }
}

/// Measures an HTTP `HEAD` round-trip. Bare hosts get the configured
/// scheme; targets that already carry one are requested as given.
pub struct HttpProber {
    default_port: u16,
    scheme: HttpScheme,
    http: reqwest::Client,
}

impl HttpProber {
    pub fn new(default_port: u16, scheme: HttpScheme, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            default_port,
            scheme,
            http,
        })
    }

    fn url_for(&self, target: &str, endpoint: &Endpoint) -> String {
        let target = target.trim();
        if target.contains("://") {
            target.to_string()
        } else {
            let scheme = self.scheme.for_port(endpoint.port);
            match (scheme, endpoint.port) {
                ("https", 443) | ("http", 80) => format!("{scheme}://{}/", endpoint.url_host()),
                _ => format!("{scheme}://{endpoint}/"),
            }
        }
    }
}

fn classify(err: reqwest::Error) -> ProbeFailure {
    if err.is_timeout() {
        ProbeFailure::Timeout
    } else {
        ProbeFailure::Other(err.to_string())
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, target: &str, timeout: Duration) -> ProbeResult {
        let endpoint = Endpoint::parse(target, self.default_port);
        let url = self.url_for(target, &endpoint);
        let attempt = async {
            dns::resolve(&endpoint).await?;
            let start = Instant::now();
            self.http
                .head(&url)
                .timeout(timeout)
                .send()
                .await
                .map_err(classify)?;
            Ok::<f64, ProbeFailure>(elapsed_ms(start))
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(ms)) => ProbeResult::success(ms),
            Ok(Err(reason)) => ProbeResult::failure(reason),
            Err(_) => ProbeResult::failure(ProbeFailure::Timeout),
        }
    }
}
