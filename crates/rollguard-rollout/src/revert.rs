//! Revert actions — the hosting platform's "put version X back" call.
//!
//! The controller calls a [`RevertAction`] at most once per episode and
//! never retries it; retry and backoff belong to the platform.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use serde::Serialize;
use tracing::{debug, warn};

use rollguard_core::RevertConfig;

use crate::error::RevertError;

pub type RevertFuture<'a> = Pin<Box<dyn Future<Output = Result<(), RevertError>> + Send + 'a>>;

/// Restore `version_id` on `target`.
///
/// Implementations should be idempotent on the platform side: the same
/// call for the same version must be safe to receive twice.
pub trait RevertAction: Send + Sync {
    fn revert<'a>(&'a self, target: &'a str, version_id: &'a str) -> RevertFuture<'a>;
}

/// Build the revert action described by `[revert]`, if any.
///
/// Without one every revert fails, which still opens the cooldown.
pub fn from_config(config: Option<&RevertConfig>) -> Arc<dyn RevertAction> {
    match config {
        Some(RevertConfig::Webhook { url, token_env }) => {
            let token = token_env.as_deref().and_then(|name| match std::env::var(name) {
                Ok(token) => Some(token),
                Err(_) => {
                    warn!(env = %name, "revert token variable not set, sending without auth");
                    None
                }
            });
            Arc::new(WebhookRevert::new(url.clone(), token))
        }
        Some(RevertConfig::Command { program, args }) => {
            Arc::new(CommandRevert::new(program.clone(), args.clone()))
        }
        None => Arc::new(UnconfiguredRevert),
    }
}

/// Fails every call; used when no `[revert]` section is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredRevert;

impl RevertAction for UnconfiguredRevert {
    fn revert<'a>(&'a self, _target: &'a str, _version_id: &'a str) -> RevertFuture<'a> {
        Box::pin(async { Err(RevertError::Unconfigured) })
    }
}

// ── Webhook ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct RevertRequest<'a> {
    target: &'a str,
    version: &'a str,
}

/// POSTs `{"target", "version"}` to a plain-HTTP endpoint; 2xx is success.
#[derive(Debug, Clone)]
pub struct WebhookRevert {
    url: String,
    token: Option<String>,
}

impl WebhookRevert {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self { url, token }
    }

    async fn post(&self, target: &str, version_id: &str) -> Result<(), RevertError> {
        let uri: http::Uri = self
            .url
            .parse()
            .map_err(|e| RevertError::Transport(format!("invalid url {}: {e}", self.url)))?;
        if uri.scheme_str() != Some("http") {
            return Err(RevertError::Transport(format!(
                "unsupported scheme in {}",
                self.url
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| RevertError::Transport(format!("missing host in {}", self.url)))?;
        let address = format!("{host}:{}", uri.port_u16().unwrap_or(80));

        let body = serde_json::to_vec(&RevertRequest {
            target,
            version: version_id,
        })
        .map_err(|e| RevertError::Transport(format!("encode: {e}")))?;

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| RevertError::Transport(format!("connect {address}: {e}")))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| RevertError::Transport(format!("handshake: {e}")))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let path = uri.path_and_query().map_or("/", |p| p.as_str());
        let mut req = http::Request::builder()
            .method("POST")
            .uri(path)
            .header("host", address.as_str())
            .header("content-type", "application/json")
            .header("user-agent", "rollguard-rollout/0.1");
        if let Some(token) = &self.token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let req = req
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RevertError::Transport(format!("request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| RevertError::Transport(format!("request: {e}")))?;
        if resp.status().is_success() {
            debug!(%target, version = %version_id, status = %resp.status(), "revert webhook accepted");
            Ok(())
        } else {
            Err(RevertError::Rejected(format!("webhook returned {}", resp.status())))
        }
    }
}

impl RevertAction for WebhookRevert {
    fn revert<'a>(&'a self, target: &'a str, version_id: &'a str) -> RevertFuture<'a> {
        Box::pin(self.post(target, version_id))
    }
}

// ── Command ───────────────────────────────────────────────────────

/// Runs a local program with `ROLLGUARD_TARGET` and `ROLLGUARD_VERSION` set.
#[derive(Debug, Clone)]
pub struct CommandRevert {
    program: String,
    args: Vec<String>,
}

impl CommandRevert {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    async fn run(&self, target: &str, version_id: &str) -> Result<(), RevertError> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("ROLLGUARD_TARGET", target)
            .env("ROLLGUARD_VERSION", version_id)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RevertError::Transport(format!("spawn {}: {e}", self.program)))?;

        if output.status.success() {
            debug!(%target, version = %version_id, program = %self.program, "revert command succeeded");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(RevertError::Rejected(format!(
            "{} exited with {}: {}",
            self.program,
            output.status,
            stderr.trim()
        )))
    }
}

impl RevertAction for CommandRevert {
    fn revert<'a>(&'a self, target: &'a str, version_id: &'a str) -> RevertFuture<'a> {
        Box::pin(self.run(target, version_id))
    }
}
