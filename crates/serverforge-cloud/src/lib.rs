//! ServerForge Cloud Providers
//!
//! This crate provides the vendor-neutral compute API used by the
//! ServerForge control plane: instances, regions, sizes and SSH keys.
//!
//! # Supported Providers
//!
//! - **DigitalOcean**: Droplets (`serverforge-cloud-digitalocean`)
//! - **Hetzner Cloud**: Servers (`serverforge-cloud-hetzner`)
//! - **Vultr**: Instances (`serverforge-cloud-vultr`)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │            serverforge-controlplane             │
//! │      (ProviderRegistry / lifecycle jobs)        │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               serverforge-cloud                 │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │          Provider Abstraction            │   │
//! │  │  trait CloudProvider { ... }             │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐             │
//! │  │  ApiClient   │  │ Value types  │             │
//! │  └──────────────┘  └──────────────┘             │
//! └───────┬─────────────────┬─────────────┬─────────┘
//!         │                 │             │
//! ┌───────▼──────┐ ┌────────▼─────┐ ┌─────▼────────┐
//! │ digitalocean │ │   hetzner    │ │    vultr     │
//! └──────────────┘ └──────────────┘ └──────────────┘
//! ```

pub mod error;
pub mod http;
pub mod provider;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use error::{CloudError, Result};
pub use http::ApiClient;
pub use provider::{CloudProvider, RetryConfig};
pub use types::{
    CreateServerRequest, CreatedServer, InstanceStatus, ProviderCredentials, Region, Size, Vendor,
};
