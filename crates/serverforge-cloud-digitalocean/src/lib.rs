//! DigitalOcean provider for ServerForge
//!
//! Implements [`CloudProvider`](serverforge_cloud::CloudProvider) over the
//! DigitalOcean API v2 (Droplets, regions, sizes, account SSH keys).
//!
//! # Example
//!
//! ```ignore
//! use serverforge_cloud::{CloudProvider, ProviderCredentials};
//! use serverforge_cloud_digitalocean::DigitalOceanProvider;
//!
//! let provider = DigitalOceanProvider::new()
//!     .with_credentials(ProviderCredentials::new(token));
//!
//! for size in provider.list_sizes().await? {
//!     println!("{}: {}", size.slug, size.description());
//! }
//! ```

pub mod api;
pub mod provider;

pub use provider::{DIGITALOCEAN_API_BASE, DigitalOceanProvider};
