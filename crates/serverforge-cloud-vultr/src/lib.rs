//! Vultr provider for ServerForge
//!
//! Implements [`CloudProvider`](serverforge_cloud::CloudProvider) over the
//! Vultr API v2. Only `vc2` cloud compute plans are offered.

pub mod api;
pub mod provider;

pub use provider::{VULTR_API_BASE, VultrProvider};
