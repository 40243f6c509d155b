//! Probe results and the HTTP probe.
//!
//! A probe never errors: connection failures, timeouts, and non-2xx
//! responses are all recorded as a failed result.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use rollguard_core::epoch_secs;
use rollguard_state::TargetId;

/// Outcome of checking one target once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub target: TargetId,
    /// Unix timestamp (seconds) when the probe ran.
    pub timestamp: u64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ProbeResult {
    pub fn pass(target: &str, timestamp: u64) -> Self {
        Self {
            target: target.to_string(),
            timestamp,
            passed: true,
            latency_ms: None,
        }
    }

    pub fn fail(target: &str, timestamp: u64) -> Self {
        Self {
            target: target.to_string(),
            timestamp,
            passed: false,
            latency_ms: None,
        }
    }
}

/// Probe `url` (plain `http://host[:port]/path`) and fold the outcome into a result.
///
/// 2xx passes; anything else, including a timeout, fails.
pub async fn http_probe(target: &str, url: &str, timeout: Duration) -> ProbeResult {
    let timestamp = epoch_secs();
    let started = Instant::now();

    let passed = match tokio::time::timeout(timeout, get_status(url)).await {
        Ok(Ok(status)) if status.is_success() => true,
        Ok(Ok(status)) => {
            debug!(%target, %url, %status, "health probe non-2xx");
            false
        }
        Ok(Err(reason)) => {
            debug!(%target, %url, %reason, "health probe failed");
            false
        }
        Err(_) => {
            debug!(%target, %url, "health probe timed out");
            false
        }
    };

    ProbeResult {
        target: target.to_string(),
        timestamp,
        passed,
        latency_ms: Some(started.elapsed().as_millis() as u64),
    }
}

async fn get_status(url: &str) -> Result<http::StatusCode, String> {
    let uri: http::Uri = url.parse().map_err(|e| format!("invalid url: {e}"))?;
    if uri.scheme_str() != Some("http") {
        return Err(format!("unsupported scheme in {url}"));
    }
    let host = uri.host().ok_or_else(|| format!("missing host in {url}"))?;
    let address = format!("{host}:{}", uri.port_u16().unwrap_or(80));

    let stream = tokio::net::TcpStream::connect(&address)
        .await
        .map_err(|e| format!("connect {address}: {e}"))?;

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| format!("handshake: {e}"))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", address.as_str())
        .header("user-agent", "rollguard-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
        .map_err(|e| format!("request: {e}"))?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| format!("request: {e}"))?;
    Ok(resp.status())
}
