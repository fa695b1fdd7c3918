use crate::engine::{PhaseReporter, ThroughputTester};
use crate::error::ThroughputFailure;
use crate::model::{ThroughputConfig, ThroughputPhase, ThroughputResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use rand::RngCore;
use reqwest::header::HeaderMap;
use reqwest::Url;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Chunk size for upload stream generation (64 KB)
const UPLOAD_CHUNK_SIZE: u64 = 64 * 1024;
const SAMPLE_TICK: Duration = Duration::from_millis(200);
const LATENCY_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct CloudflareClient {
    pub base_url: Url,
    pub http: reqwest::Client,
}

impl CloudflareClient {
    pub fn new(cfg: &ThroughputConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid base_url")?;
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(15))
            .build()
            .context("failed to build http client")?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("join {path}"))
    }

    pub fn down_url(&self) -> Result<Url> {
        self.endpoint("/__down")
    }

    pub fn up_url(&self) -> Result<Url> {
        self.endpoint("/__up")
    }

    /// Round-trip of an empty download. Returns the latency and the colo
    /// that served it, when the response names one.
    pub async fn probe_latency_ms(&self, meas_id: &str) -> Result<(f64, Option<String>)> {
        let mut url = self.down_url()?;
        url.query_pairs_mut()
            .append_pair("bytes", "0")
            .append_pair("measId", meas_id);

        let start = Instant::now();
        let resp = self
            .http
            .get(url)
            .timeout(LATENCY_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let colo = colo_from_headers(resp.headers());
        // Consume body to keep behavior consistent
        let _ = resp.bytes().await;
        Ok((start.elapsed().as_secs_f64() * 1000.0, colo))
    }

    pub async fn fetch_meta(&self, meas_id: &str) -> Result<serde_json::Value> {
        let mut url = self.endpoint("/meta")?;
        url.query_pairs_mut().append_pair("measId", meas_id);
        let v: serde_json::Value = self.http.get(url).send().await?.json().await?;
        Ok(v)
    }

    pub async fn fetch_locations(&self) -> Result<serde_json::Value> {
        let url = self.endpoint("/locations")?;
        let v: serde_json::Value = self.http.get(url).send().await?.json().await?;
        Ok(v)
    }
}

fn colo_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(colo) = headers.get("cf-meta-colo").and_then(|h| h.to_str().ok()) {
        return Some(colo.to_string());
    }
    // cf-ray looks like "8c1f2a3b4c5d6e7f-AMS"
    headers
        .get("cf-ray")
        .and_then(|h| h.to_str().ok())
        .and_then(|ray| ray.split('-').nth(1))
        .map(str::to_string)
}

pub fn map_colo_to_server(locations: &serde_json::Value, colo: &str) -> Option<String> {
    // Search for any object whose colo-like key matches `colo`; the
    // /locations schema is not stable.
    fn visit<'a>(
        v: &'a serde_json::Value,
        colo: &str,
    ) -> Option<&'a serde_json::Map<String, serde_json::Value>> {
        match v {
            serde_json::Value::Array(a) => a.iter().find_map(|x| visit(x, colo)),
            serde_json::Value::Object(m) => {
                let matched = ["iata", "colo", "code", "id"]
                    .iter()
                    .any(|k| m.get(*k).and_then(|x| x.as_str()) == Some(colo));
                if matched {
                    Some(m)
                } else {
                    m.values().find_map(|x| visit(x, colo))
                }
            }
            _ => None,
        }
    }

    let m = visit(locations, colo)?;
    let field = |k: &str| m.get(k).and_then(|v| v.as_str());
    let city = field("city").or_else(|| field("name"));
    let region = field("region");
    let country = field("country").or_else(|| field("countryName"));

    let mut parts = vec![colo.to_string()];
    parts.extend(city.or(region).map(str::to_string));
    parts.extend(country.map(str::to_string));
    Some(parts.join(" - "))
}

fn gen_meas_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}

fn mbps(bytes: u64, window: Duration) -> f64 {
    let secs = window.as_secs_f64().max(1e-9);
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

/// Bytes and elapsed time after the ramp-up (the first 20% of the run, at
/// least one second). `None` when the remaining window is too short to trust.
fn estimate_steady_window(
    samples: &[(Instant, u64)],
    total_duration: Duration,
) -> Option<(u64, Duration)> {
    if samples.len() < 2 {
        return None;
    }
    let ignore = total_duration.mul_f64(0.20).max(Duration::from_secs(1));
    let t0 = samples[0].0 + ignore;
    let start_idx = samples.iter().position(|(t, _)| *t >= t0).unwrap_or(0);
    let (t_start, b_start) = samples[start_idx];
    let (t_end, b_end) = *samples.last()?;
    let dt = t_end.saturating_duration_since(t_start);
    if dt.as_millis() < 200 {
        return None;
    }
    Some((b_end.saturating_sub(b_start), dt))
}

/// Samples the byte counter until `duration` has passed and returns the
/// steady-window estimate, or the whole run when no steady window exists.
async fn sample_transfer(
    total: &AtomicU64,
    duration: Duration,
    phase: ThroughputPhase,
) -> (u64, Duration) {
    let start = Instant::now();
    let mut samples: Vec<(Instant, u64)> = Vec::with_capacity(256);
    while start.elapsed() < duration {
        let now_total = total.load(Ordering::Relaxed);
        trace!(?phase, bytes_total = now_total, "throughput tick");
        samples.push((Instant::now(), now_total));
        tokio::time::sleep(SAMPLE_TICK).await;
    }
    samples.push((Instant::now(), total.load(Ordering::Relaxed)));

    let elapsed = start.elapsed();
    estimate_steady_window(&samples, elapsed)
        .unwrap_or_else(|| (total.load(Ordering::Relaxed), elapsed))
}

fn stop_workers(stop: &AtomicBool, handles: Vec<JoinHandle<()>>) {
    stop.store(true, Ordering::Relaxed);
    for h in handles {
        h.abort();
    }
}

/// Speed test against Cloudflare's speed endpoints (`__down`, `__up`,
/// `/meta`, `/locations`).
pub struct CloudflareTester {
    cfg: ThroughputConfig,
    client: CloudflareClient,
}

struct ServerChoice {
    latency_ms: f64,
    label: Option<String>,
}

impl CloudflareTester {
    pub fn new(cfg: &ThroughputConfig) -> Result<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            client: CloudflareClient::new(cfg)?,
        })
    }

    async fn select_server(&self, meas_id: &str) -> Result<ServerChoice, ThroughputFailure> {
        let mut samples = Vec::new();
        let mut colo = None;
        let mut last_err = None;
        for _ in 0..self.cfg.latency_samples {
            match self.client.probe_latency_ms(meas_id).await {
                Ok((ms, c)) => {
                    samples.push(ms);
                    colo = colo.or(c);
                }
                Err(e) => {
                    debug!(error = %e, "latency sample failed");
                    last_err = Some(e);
                }
            }
        }

        if samples.is_empty() {
            let detail = last_err.map(|e| format!(": {e:#}")).unwrap_or_default();
            return Err(ThroughputFailure::new(format!(
                "could not reach {}{detail}",
                self.client.base_url
            )));
        }
        let latency_ms = samples.iter().sum::<f64>() / samples.len() as f64;

        if colo.is_none() {
            colo = self
                .client
                .fetch_meta(meas_id)
                .await
                .ok()
                .and_then(|m| m.get("colo").and_then(|v| v.as_str()).map(str::to_string));
        }
        let label = match colo {
            Some(colo) => {
                let mapped = match self.client.fetch_locations().await {
                    Ok(loc) => map_colo_to_server(&loc, &colo),
                    Err(e) => {
                        debug!(error = %e, "locations lookup failed");
                        None
                    }
                };
                Some(mapped.unwrap_or(colo))
            }
            None => None,
        };

        info!(latency_ms, server = ?label, "server selected");
        Ok(ServerChoice { latency_ms, label })
    }

    async fn run_download(&self, meas_id: &str) -> Result<f64, ThroughputFailure> {
        let mut url = self.client.down_url()?;
        url.query_pairs_mut()
            .append_pair("measId", meas_id)
            .append_pair("bytes", &self.cfg.download_bytes_per_req.to_string());

        let stop = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(self.cfg.concurrency);
        for _ in 0..self.cfg.concurrency {
            let http = self.client.http.clone();
            let url = url.clone();
            let stop2 = stop.clone();
            let total2 = total.clone();

            handles.push(tokio::spawn(async move {
                while !stop2.load(Ordering::Relaxed) {
                    let resp = match http.get(url.clone()).send().await {
                        Ok(r) => r,
                        Err(e) => {
                            debug!(error = %e, "download request failed");
                            tokio::time::sleep(RETRY_DELAY).await;
                            continue;
                        }
                    };
                    let mut stream = resp.bytes_stream();
                    while let Some(chunk) = stream.next().await {
                        let Ok(b) = chunk else { break };
                        total2.fetch_add(b.len() as u64, Ordering::Relaxed);
                        if stop2.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                }
            }));
        }

        let (bytes, window) =
            sample_transfer(&total, self.cfg.download_duration, ThroughputPhase::Download).await;
        stop_workers(&stop, handles);

        if bytes == 0 {
            return Err(ThroughputFailure::new("no data received during download"));
        }
        Ok(mbps(bytes, window))
    }

    async fn run_upload(&self, meas_id: &str) -> Result<f64, ThroughputFailure> {
        let mut url = self.client.up_url()?;
        url.query_pairs_mut().append_pair("measId", meas_id);

        let stop = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::with_capacity(self.cfg.concurrency);
        for _ in 0..self.cfg.concurrency {
            let http = self.client.http.clone();
            let url = url.clone();
            let stop2 = stop.clone();
            let total2 = total.clone();
            let bytes_per_req = self.cfg.upload_bytes_per_req;

            handles.push(tokio::spawn(async move {
                while !stop2.load(Ordering::Relaxed) {
                    // Bytes are counted as chunks are handed to reqwest, which
                    // tracks bytes put on the wire closely enough.
                    let chunk = Bytes::from(vec![0u8; UPLOAD_CHUNK_SIZE as usize]);
                    let full = bytes_per_req / UPLOAD_CHUNK_SIZE;
                    let tail = bytes_per_req % UPLOAD_CHUNK_SIZE;

                    let total2a = total2.clone();
                    let chunk_full = chunk.clone();
                    let s_full = stream::iter(0..full).map(move |_| {
                        total2a.fetch_add(UPLOAD_CHUNK_SIZE, Ordering::Relaxed);
                        Ok::<Bytes, std::io::Error>(chunk_full.clone())
                    });

                    let body_stream = if tail == 0 {
                        s_full.boxed()
                    } else {
                        let total2b = total2.clone();
                        let chunk_tail = chunk.slice(..tail as usize);
                        let s_tail = stream::once(async move {
                            total2b.fetch_add(tail, Ordering::Relaxed);
                            Ok::<Bytes, std::io::Error>(chunk_tail)
                        });
                        s_full.chain(s_tail).boxed()
                    };

                    let body = reqwest::Body::wrap_stream(body_stream);
                    if let Err(e) = http.post(url.clone()).body(body).send().await {
                        debug!(error = %e, "upload request failed");
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }));
        }

        let (bytes, window) =
            sample_transfer(&total, self.cfg.upload_duration, ThroughputPhase::Upload).await;
        stop_workers(&stop, handles);

        if bytes == 0 {
            return Err(ThroughputFailure::new("no data sent during upload"));
        }
        Ok(mbps(bytes, window))
    }
}

#[async_trait]
impl ThroughputTester for CloudflareTester {
    async fn measure(
        &self,
        progress: &PhaseReporter,
    ) -> Result<ThroughputResult, ThroughputFailure> {
        let meas_id = gen_meas_id();

        progress.phase(ThroughputPhase::ServerSelection);
        let server = self.select_server(&meas_id).await?;

        progress.phase(ThroughputPhase::Download);
        let download_mbps = self.run_download(&meas_id).await?;

        progress.phase(ThroughputPhase::Upload);
        let upload_mbps = self.run_upload(&meas_id).await?;

        Ok(ThroughputResult {
            download_mbps,
            upload_mbps,
            latency_ms: server.latency_ms,
            server: server.label,
        })
    }
}
