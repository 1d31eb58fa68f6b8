//! Proxy controller: idempotent, circuit-broken router config pushes.
//!
//! Every push goes through one lock so the push state (last applied hash,
//! last known good config, consecutive failure count) is only ever updated
//! by one caller at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigGenerator, RouterConfig};
use crate::error::PushError;
use crate::sink::ConfigSink;

/// Consecutive failed pushes after which the circuit opens.
pub const CIRCUIT_THRESHOLD: u32 = 3;

/// Backoff for transient push failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (1-based), plus up to
    /// 50% random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(self.max_delay);
        let mut buf = [0u8; 4];
        let roll = match getrandom::getrandom(&mut buf) {
            Ok(()) => u32::from_le_bytes(buf),
            Err(_) => 0,
        };
        let jitter_ms = (exp.as_millis() as u64 / 2) * u64::from(roll) / u64::from(u32::MAX);
        exp + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Default)]
struct ProxyPushState {
    last_hash: Option<String>,
    last_good: Option<RouterConfig>,
    consecutive_failures: u32,
}

pub struct ProxyController {
    generator: ConfigGenerator,
    sink: Arc<dyn ConfigSink>,
    retry: RetryPolicy,
    state: Mutex<ProxyPushState>,
}

impl ProxyController {
    pub fn new(generator: ConfigGenerator, sink: Arc<dyn ConfigSink>) -> Self {
        Self {
            generator,
            sink,
            retry: RetryPolicy::default(),
            state: Mutex::new(ProxyPushState::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn generator(&self) -> &ConfigGenerator {
        &self.generator
    }

    /// Generate the config from current routes and push it.
    ///
    /// Returns `true` when the router runs the current config afterwards,
    /// including when nothing changed since the last push.
    pub async fn push_config(&self) -> bool {
        match self.generator.generate().await {
            Ok(config) => self.apply(config).await,
            Err(e) => {
                error!(error = %e, "failed to generate router config");
                false
            }
        }
    }

    /// Push a specific config document.
    pub async fn apply(&self, config: RouterConfig) -> bool {
        let hash = match config.content_hash() {
            Ok(hash) => hash,
            Err(e) => {
                error!(error = %e, "failed to hash router config");
                return false;
            }
        };

        let mut state = self.state.lock().await;
        if state.last_hash.as_deref() == Some(hash.as_str()) {
            debug!(%hash, "router config unchanged, skipping push");
            return true;
        }
        if state.consecutive_failures >= CIRCUIT_THRESHOLD {
            warn!(
                failures = state.consecutive_failures,
                "proxy circuit open, skipping push"
            );
            return false;
        }

        match self.push_with_retry(&config).await {
            Ok(()) => {
                state.last_hash = Some(hash);
                state.last_good = Some(config);
                state.consecutive_failures = 0;
                info!(
                    http_routes = state.last_good.as_ref().map_or(0, |c| c.http.len()),
                    "router config applied"
                );
                true
            }
            Err(err) => {
                state.consecutive_failures += 1;
                error!(
                    error = %err,
                    failures = state.consecutive_failures,
                    "router config push failed"
                );
                if err.is_rejection()
                    && let Some(good) = &state.last_good
                {
                    match self.sink.push(good).await {
                        Ok(()) => warn!("restored last known good router config"),
                        Err(e) => error!(error = %e, "failed to restore last good router config"),
                    }
                }
                if state.consecutive_failures == CIRCUIT_THRESHOLD {
                    error!(threshold = CIRCUIT_THRESHOLD, "proxy circuit opened");
                }
                false
            }
        }
    }

    async fn push_with_retry(&self, config: &RouterConfig) -> Result<(), PushError> {
        let mut attempt = 1;
        loop {
            match self.sink.push(config).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(error = %err, attempt, ?delay, "transient push failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Close the circuit so pushes are attempted again.
    pub async fn reset_circuit(&self) {
        let mut state = self.state.lock().await;
        if state.consecutive_failures > 0 {
            info!(failures = state.consecutive_failures, "proxy circuit reset");
        }
        state.consecutive_failures = 0;
    }

    pub async fn is_circuit_open(&self) -> bool {
        self.state.lock().await.consecutive_failures >= CIRCUIT_THRESHOLD
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }
}
