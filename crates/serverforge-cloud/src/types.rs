//! Normalized value objects shared by every vendor driver

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CloudError;

/// Supported cloud vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    DigitalOcean,
    Hetzner,
    Vultr,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [Vendor::DigitalOcean, Vendor::Hetzner, Vendor::Vultr];

    /// Stable identifier used in configuration and persisted records
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::DigitalOcean => "digitalocean",
            Vendor::Hetzner => "hetzner",
            Vendor::Vultr => "vultr",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Vendor::DigitalOcean => "DigitalOcean",
            Vendor::Hetzner => "Hetzner",
            Vendor::Vultr => "Vultr",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Vendor {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "digitalocean" | "do" => Ok(Vendor::DigitalOcean),
            "hetzner" => Ok(Vendor::Hetzner),
            "vultr" => Ok(Vendor::Vultr),
            other => Err(CloudError::UnknownProvider(other.to_string())),
        }
    }
}

/// API credentials for one provider account
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub api_token: String,
}

impl ProviderCredentials {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_token: api_token.into(),
        }
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("api_token", &"<redacted>")
            .finish()
    }
}

/// A datacenter location offered by a vendor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub slug: String,
    pub name: String,
}

impl Region {
    pub fn new(slug: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            name: name.into(),
        }
    }
}

/// An instance size (plan) offered by a vendor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub slug: String,
    pub vcpus: u32,
    /// Memory in megabytes
    pub memory_mb: u64,
    /// Disk in gigabytes
    pub disk_gb: u64,
    /// Monthly price in USD (EUR for Hetzner)
    pub price_monthly: f64,
}

impl Size {
    /// Human readable summary, e.g. `2 vCPU, 4 GB RAM, 80 GB SSD - $24.00/mo`
    pub fn description(&self) -> String {
        format!(
            "{} vCPU, {} RAM, {} GB SSD - ${:.2}/mo",
            self.vcpus,
            self.memory_label(),
            self.disk_gb,
            self.price_monthly
        )
    }

    pub fn memory_label(&self) -> String {
        if self.memory_mb < 1024 {
            format!("{} MB", self.memory_mb)
        } else if self.memory_mb % 1024 == 0 {
            format!("{} GB", self.memory_mb / 1024)
        } else {
            format!("{:.1} GB", self.memory_mb as f64 / 1024.0)
        }
    }
}

/// Parameters for creating an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub size: String,
    pub region: String,
    pub ssh_key_id: String,
}

/// Result of an instance creation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedServer {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// Normalized instance status
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// Raw vendor status string
    pub status: String,
    pub is_active: bool,
    pub ip: Option<String>,
    pub private_ip: Option<String>,
}

impl InstanceStatus {
    /// Running and reachable: active with a public address assigned
    pub fn is_reachable(&self) -> bool {
        self.is_active && self.ip.is_some()
    }
}

/// Sort sizes ascending by monthly price, ties broken by slug
pub fn sort_sizes(sizes: &mut [Size]) {
    sizes.sort_by(|a, b| {
        a.price_monthly
            .total_cmp(&b.price_monthly)
            .then_with(|| a.slug.cmp(&b.slug))
    });
}

/// Regions carry no price; order them by slug
pub fn sort_regions(regions: &mut [Region]) {
    regions.sort_by(|a, b| a.slug.cmp(&b.slug));
}

/// Normalize an address field: vendors report unassigned addresses as
/// empty strings or `0.0.0.0`.
pub fn assigned_ip(value: Option<&str>) -> Option<String> {
    match value.map(str::trim) {
        None | Some("") | Some("0.0.0.0") => None,
        Some(ip) => Some(ip.to_string()),
    }
}
