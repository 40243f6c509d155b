//! Minimal HTTP/1.1 client for the daemon's own API.
//!
//! The client subcommands talk to a running `rollguardd serve` over plain
//! HTTP; every response body is the API's JSON envelope.

use anyhow::Context;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};

/// A decoded API response.
#[derive(Debug)]
pub struct ApiReply {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl ApiReply {
    /// `data` from the envelope, or `error` when there is no data.
    pub fn payload(&self) -> &serde_json::Value {
        match self.body.get("data") {
            Some(data) => data,
            None => self.body.get("error").unwrap_or(&self.body),
        }
    }
}

pub async fn request(
    server: &str,
    method: Method,
    path: &str,
    body: Option<serde_json::Value>,
) -> anyhow::Result<ApiReply> {
    let stream = tokio::net::TcpStream::connect(server)
        .await
        .with_context(|| format!("connect to rollguardd at {server}"))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .context("http handshake")?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let payload = match body {
        Some(body) => Bytes::from(serde_json::to_vec(&body)?),
        None => Bytes::new(),
    };
    let req = http::Request::builder()
        .method(method)
        .uri(path)
        .header("host", server)
        .header("content-type", "application/json")
        .header("user-agent", "rollguardd/0.1")
        .body(Full::new(payload))?;

    let resp = sender.send_request(req).await.context("send request")?;
    let status = resp.status();
    let bytes = resp.into_body().collect().await?.to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .with_context(|| format!("decode response from {path} ({status})"))?
    };
    Ok(ApiReply { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use rollguard_core::ManualClock;
    use rollguard_rollout::{Guard, GuardPolicy, UnconfiguredRevert};
    use rollguard_state::StateStore;

    async fn spawn_server() -> String {
        let guard = Guard::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(UnconfiguredRevert),
            GuardPolicy::default(),
            Arc::new(ManualClock::new(1_700_000_000)),
        );
        let router = rollguard_api::build_router(Arc::new(guard));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn authorize_round_trip() {
        let server = spawn_server().await;
        let reply = request(&server, Method::GET, "/api/v1/targets/api/authorize", None)
            .await
            .unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.payload()["decision"], "allowed");
    }

    #[tokio::test]
    async fn posts_json_bodies() {
        let server = spawn_server().await;
        let reply = request(
            &server,
            Method::POST,
            "/api/v1/targets/api/deployments",
            Some(serde_json::json!({ "version": "v3" })),
        )
        .await
        .unwrap();
        assert_eq!(reply.status, StatusCode::OK);

        let reply = request(&server, Method::GET, "/api/v1/flags/live_version/api", None)
            .await
            .unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.payload()["key"], "live_version/api");
    }

    #[tokio::test]
    async fn missing_flag_reports_error() {
        let server = spawn_server().await;
        let reply = request(&server, Method::GET, "/api/v1/flags/nope", None)
            .await
            .unwrap();
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(reply.payload(), "flag not found");
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error() {
        let err = request("127.0.0.1:1", Method::GET, "/", None).await.unwrap_err();
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
