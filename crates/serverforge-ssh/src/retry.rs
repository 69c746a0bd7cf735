//! Waiting for a freshly booted server to accept SSH

use crate::connector::{SshConnector, SshTarget, probe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Backoff policy for readiness probing
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_delay: Duration::from_secs(5),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReadinessPolicy {
    /// Delay after failed attempt `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay as u64).min(self.max_delay)
    }
}

/// Polls a server until a session can be opened
#[derive(Clone)]
pub struct ConnectionRetryCoordinator {
    connector: Arc<dyn SshConnector>,
    policy: ReadinessPolicy,
}

impl ConnectionRetryCoordinator {
    pub fn new(connector: Arc<dyn SshConnector>, policy: ReadinessPolicy) -> Self {
        Self { connector, policy }
    }

    pub fn policy(&self) -> &ReadinessPolicy {
        &self.policy
    }

    /// Probe until success or until the attempt budget is spent.
    ///
    /// Probe failures are logged, never returned.
    pub async fn wait_for_ready(&self, target: &SshTarget, username: &str) -> bool {
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            match probe(self.connector.as_ref(), target, username).await {
                Ok(true) => {
                    info!(host = %target.host, username, attempt, "SSH ready");
                    return true;
                }
                Ok(false) => {
                    warn!(host = %target.host, username, attempt, max_attempts, "SSH probe returned unexpected output");
                }
                Err(e) => {
                    warn!(host = %target.host, username, attempt, max_attempts, error = %e, "SSH not ready yet");
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.delay_for_attempt(attempt - 1)).await;
            }
        }

        warn!(host = %target.host, username, max_attempts, "SSH never became ready");
        false
    }
}
