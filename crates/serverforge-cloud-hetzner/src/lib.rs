//! Hetzner Cloud provider for ServerForge
//!
//! Implements [`CloudProvider`](serverforge_cloud::CloudProvider) over the
//! Hetzner Cloud API v1. Server type prices are quoted gross at `fsn1`.

pub mod api;
pub mod provider;

pub use provider::{HETZNER_API_BASE, HetznerProvider};
