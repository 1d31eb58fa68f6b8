//! Agent token verification.
//!
//! Servers store only the SHA-256 hex digest of their agent token.

use sha2::{Digest, Sha256};
use tracing::warn;

use fleetgrid_state::{ServerRecord, StateStore};

use crate::error::{ChannelError, ChannelResult};

/// Hex SHA-256 digest of an agent token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Compare without short-circuiting on the first differing byte.
fn digests_match(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

/// Look up `server_id` and check `token` against its stored hash.
pub fn authenticate(store: &StateStore, server_id: &str, token: &str) -> ChannelResult<ServerRecord> {
    let Some(server) = store.get_server(server_id)? else {
        warn!(%server_id, "auth from unknown server");
        return Err(ChannelError::AuthFailed(server_id.to_string()));
    };
    match &server.token_hash {
        Some(expected) if digests_match(expected, &hash_token(token)) => Ok(server),
        _ => {
            warn!(%server_id, "agent token rejected");
            Err(ChannelError::AuthFailed(server_id.to_string()))
        }
    }
}
