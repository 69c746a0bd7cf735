//! Cloud provider trait definition

use crate::error::Result;
use crate::types::{
    CreateServerRequest, CreatedServer, InstanceStatus, ProviderCredentials, Region, Size, Vendor,
};
use async_trait::async_trait;
use std::time::Duration;

/// Cloud provider abstraction trait
///
/// Every vendor driver (DigitalOcean, Hetzner, Vultr) implements this trait.
/// Field mapping, price units and address extraction are the driver's job;
/// callers only ever see the normalized types.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Which vendor this driver talks to
    fn vendor(&self) -> Vendor;

    /// Returns the provider display name for UI
    fn display_name(&self) -> &str {
        self.vendor().display_name()
    }

    /// Bind the driver to one account's credentials
    fn set_credentials(&mut self, credentials: ProviderCredentials);

    /// Check the configured credentials against the vendor.
    ///
    /// Never fails: any error (network, auth, missing credentials) is `false`.
    async fn validate_credentials(&self) -> bool;

    /// Available regions, sorted by slug
    async fn list_regions(&self) -> Result<Vec<Region>>;

    /// Available, non-deprecated sizes sorted ascending by monthly price
    async fn list_sizes(&self) -> Result<Vec<Size>>;

    async fn create_server(&self, request: &CreateServerRequest) -> Result<CreatedServer>;

    async fn get_server_status(&self, server_id: &str) -> Result<InstanceStatus>;

    /// Delete an instance. An instance that no longer exists is success.
    async fn delete_server(&self, server_id: &str) -> Result<()>;

    /// Register a public key, returning the vendor's key id
    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<String>;

    /// Delete a registered key. A key that no longer exists is success.
    async fn delete_ssh_key(&self, key_id: &str) -> Result<()>;
}

/// Retry configuration for idempotent API reads
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Short fixed spacing used by the HTTP layer: 3 attempts, 100ms apart
    pub fn reads() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 1.0,
        }
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::reads()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(delay as u64).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}
