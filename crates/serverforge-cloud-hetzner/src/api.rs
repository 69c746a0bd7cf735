//! Hetzner Cloud API v1 wire types

use serde::{Deserialize, Serialize};
use serverforge_cloud::{InstanceStatus, Region, Size, types::assigned_ip};
use std::collections::BTreeMap;

/// Location whose price is quoted when a size is listed
pub const PRICE_LOCATION: &str = "fsn1";

#[derive(Debug, Deserialize)]
pub struct LocationsResponse {
    pub locations: Vec<Location>,
}

#[derive(Debug, Deserialize)]
pub struct Location {
    pub name: String,
    pub description: String,
    pub city: String,
}

impl From<Location> for Region {
    fn from(location: Location) -> Self {
        let name = format!("{} ({})", location.description, location.city);
        Region::new(location.name, name)
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerTypesResponse {
    pub server_types: Vec<ServerType>,
}

#[derive(Debug, Deserialize)]
pub struct ServerType {
    pub name: String,
    pub cores: u32,
    /// Gigabytes, may be fractional
    pub memory: f64,
    pub disk: u64,
    #[serde(default)]
    pub deprecated: Option<bool>,
    #[serde(default)]
    pub deprecation: Option<serde_json::Value>,
    #[serde(default)]
    pub prices: Vec<LocationPrice>,
}

#[derive(Debug, Deserialize)]
pub struct LocationPrice {
    pub location: String,
    pub price_monthly: Price,
}

/// Prices are decimal strings
#[derive(Debug, Deserialize)]
pub struct Price {
    pub net: String,
    pub gross: String,
}

impl ServerType {
    pub fn is_deprecated(&self) -> bool {
        self.deprecated.unwrap_or(false) || self.deprecation.as_ref().is_some_and(|d| !d.is_null())
    }

    /// Gross monthly price at the reference location, else the first quoted one
    pub fn monthly_price(&self) -> Option<f64> {
        self.prices
            .iter()
            .find(|p| p.location == PRICE_LOCATION)
            .or_else(|| self.prices.first())
            .and_then(|p| p.price_monthly.gross.trim().parse::<f64>().ok())
    }

    pub fn to_size(&self) -> Option<Size> {
        Some(Size {
            slug: self.name.clone(),
            vcpus: self.cores,
            memory_mb: (self.memory * 1024.0).round() as u64,
            disk_gb: self.disk,
            price_monthly: self.monthly_price()?,
        })
    }
}

/// `POST /servers` body
#[derive(Debug, Serialize)]
pub struct CreateServerBody<'a> {
    pub name: &'a str,
    pub server_type: &'a str,
    pub location: &'a str,
    pub image: &'a str,
    pub ssh_keys: Vec<serde_json::Value>,
    pub start_after_create: bool,
    pub labels: BTreeMap<&'a str, &'a str>,
}

#[derive(Debug, Deserialize)]
pub struct ServerResponse {
    pub server: Server,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub public_net: PublicNet,
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PublicNet {
    #[serde(default)]
    pub ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
pub struct Ipv4 {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct PrivateNet {
    pub ip: String,
}

impl Server {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn to_status(&self) -> InstanceStatus {
        InstanceStatus {
            status: self.status.clone(),
            is_active: self.is_running(),
            ip: assigned_ip(self.public_net.ipv4.as_ref().map(|v| v.ip.as_str())),
            private_ip: assigned_ip(self.private_net.first().map(|n| n.ip.as_str())),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateKeyRequest<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
    pub labels: BTreeMap<&'a str, &'a str>,
}

#[derive(Debug, Deserialize)]
pub struct KeyResponse {
    pub ssh_key: KeyInfo,
}

#[derive(Debug, Deserialize)]
pub struct KeyInfo {
    pub id: u64,
}

/// Hetzner accepts key ids or key names
pub fn ssh_key_reference(id: &str) -> serde_json::Value {
    match id.parse::<u64>() {
        Ok(numeric) => serde_json::Value::from(numeric),
        Err(_) => serde_json::Value::from(id),
    }
}
