//! Probe monitor — background task per target that probes on a fixed cadence.
//!
//! The `ProbeMonitor` is the reference scheduler: every interval it runs
//! [`http_probe`] and hands the result to a sink. The daemon wires the sink
//! to the guard's `record`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rollguard_core::{ConfigError, TargetConfig};

use crate::probe::{http_probe, ProbeResult};

/// Receives every probe result.
pub type ProbeSink = Arc<dyn Fn(ProbeResult) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// What to probe and how often.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSpec {
    pub target: String,
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl TryFrom<&TargetConfig> for ProbeSpec {
    type Error = ConfigError;

    fn try_from(config: &TargetConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            target: config.name.clone(),
            url: config.url.clone(),
            interval: config.interval()?,
            timeout: config.timeout()?,
        })
    }
}

/// Per-target monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages probe loops for all monitored targets.
pub struct ProbeMonitor {
    /// Active monitors: target → slot.
    monitors: Arc<RwLock<HashMap<String, MonitorSlot>>>,
    sink: ProbeSink,
}

impl ProbeMonitor {
    pub fn new(sink: ProbeSink) -> Self {
        Self {
            monitors: Arc::new(RwLock::new(HashMap::new())),
            sink,
        }
    }

    /// Start probing a target, replacing any monitor already running for it.
    pub async fn start_monitor(&self, spec: ProbeSpec) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let target = spec.target.clone();
        let url = spec.url.clone();
        let sink = self.sink.clone();

        let handle = tokio::spawn(async move {
            run_probe_loop(spec, sink, shutdown_rx).await;
        });

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            target.clone(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        info!(%target, %url, "probe monitor started");
    }

    pub async fn stop_monitor(&self, target: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(target) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%target, "probe monitor stopped");
        }
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (target, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%target, "probe monitor stopped");
        }
        info!("all probe monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, target: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(target)
    }
}

async fn run_probe_loop(spec: ProbeSpec, sink: ProbeSink, mut shutdown: watch::Receiver<bool>) {
    debug!(target = %spec.target, interval = ?spec.interval, "probe loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(spec.interval) => {
                let result = http_probe(&spec.target, &spec.url, spec.timeout).await;
                sink(result).await;
            }
            _ = shutdown.changed() => {
                debug!(target = %spec.target, "probe loop shutting down");
                break;
            }
        }
    }
}
