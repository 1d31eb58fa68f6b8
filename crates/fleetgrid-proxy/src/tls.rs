//! TLS policy selection for the router.
//!
//! When the internal certificate authority answers on its TCP address the
//! router is told to issue certificates from it; otherwise it falls back to
//! self-signed certificates.

use std::time::Duration;

use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Certificate issuance policy placed in the generated router config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issuer", rename_all = "snake_case")]
pub enum TlsPolicy {
    /// Certificates come from the internal ACME CA at `ca_url`.
    Internal { ca_url: String },
    SelfSigned,
}

/// Probe `ca_addr` (host:port) and choose a policy.
pub async fn probe_internal_ca(ca_addr: Option<&str>) -> TlsPolicy {
    let Some(addr) = ca_addr else {
        return TlsPolicy::SelfSigned;
    };
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => TlsPolicy::Internal {
            ca_url: format!("https://{addr}/acme/directory"),
        },
        Ok(Err(e)) => {
            debug!(error = %e, %addr, "internal CA unreachable");
            TlsPolicy::SelfSigned
        }
        Err(_) => {
            debug!(%addr, "internal CA probe timed out");
            TlsPolicy::SelfSigned
        }
    }
}
