//! Config sinks: where generated router configs are sent.
//!
//! [`AdminApiSink`] POSTs the JSON document to the router's admin endpoint
//! over a plain HTTP/1.1 connection.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tracing::debug;

use crate::config::RouterConfig;
use crate::error::PushError;

/// Destination for router configuration documents.
#[async_trait]
pub trait ConfigSink: Send + Sync {
    /// Apply `config`. One call is one network attempt.
    async fn push(&self, config: &RouterConfig) -> Result<(), PushError>;
}

/// Pushes configs to an HTTP admin API (`POST {path}` with a JSON body).
#[derive(Debug, Clone)]
pub struct AdminApiSink {
    /// host:port of the admin listener.
    address: String,
    path: String,
    timeout: Duration,
}

impl AdminApiSink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: "/load".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post(&self, body: Vec<u8>) -> Result<(), PushError> {
        let uri = format!("http://{}{}", self.address, self.path);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| PushError::Network(format!("connect {}: {e}", self.address)))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| PushError::Network(format!("handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .header("user-agent", "fleetgrid-proxy/0.1")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| PushError::Network(format!("request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| PushError::Network(format!("send: {e}")))?;
        let status = resp.status();
        if status.is_success() {
            debug!(%uri, %status, "router config accepted");
            return Ok(());
        }

        let body = match resp.into_body().collect().await {
            Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
            Err(_) => String::new(),
        };
        Err(PushError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ConfigSink for AdminApiSink {
    async fn push(&self, config: &RouterConfig) -> Result<(), PushError> {
        let body = serde_json::to_vec(config)
            .map_err(|e| PushError::Network(format!("encode config: {e}")))?;
        match tokio::time::timeout(self.timeout, self.post(body)).await {
            Ok(result) => result,
            Err(_) => Err(PushError::Network(format!(
                "timed out after {:?} pushing to {}",
                self.timeout, self.address
            ))),
        }
    }
}
