//! DigitalOcean API v2 wire types

use serde::{Deserialize, Serialize};
use serverforge_cloud::{InstanceStatus, Region, Size, types::assigned_ip};

#[derive(Debug, Deserialize)]
pub struct RegionsResponse {
    pub regions: Vec<RegionInfo>,
}

#[derive(Debug, Deserialize)]
pub struct RegionInfo {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub available: bool,
}

impl From<RegionInfo> for Region {
    fn from(info: RegionInfo) -> Self {
        Region::new(info.slug, info.name)
    }
}

#[derive(Debug, Deserialize)]
pub struct SizesResponse {
    pub sizes: Vec<SizeInfo>,
}

#[derive(Debug, Deserialize)]
pub struct SizeInfo {
    pub slug: String,
    pub vcpus: u32,
    /// Megabytes
    pub memory: u64,
    /// Gigabytes
    pub disk: u64,
    pub price_monthly: f64,
    #[serde(default)]
    pub available: bool,
}

impl From<SizeInfo> for Size {
    fn from(info: SizeInfo) -> Self {
        Size {
            slug: info.slug,
            vcpus: info.vcpus,
            memory_mb: info.memory,
            disk_gb: info.disk,
            price_monthly: info.price_monthly,
        }
    }
}

/// `POST /droplets` body
#[derive(Debug, Serialize)]
pub struct CreateDropletRequest<'a> {
    pub name: &'a str,
    pub region: &'a str,
    pub size: &'a str,
    pub image: &'a str,
    /// Numeric key ids or key fingerprints
    pub ssh_keys: Vec<serde_json::Value>,
    pub backups: bool,
    pub ipv6: bool,
    pub monitoring: bool,
    pub tags: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct DropletResponse {
    pub droplet: Droplet,
}

#[derive(Debug, Deserialize)]
pub struct Droplet {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub networks: Networks,
}

#[derive(Debug, Default, Deserialize)]
pub struct Networks {
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkV4 {
    pub ip_address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl Droplet {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }

    fn address(&self, kind: &str) -> Option<String> {
        assigned_ip(
            self.networks
                .v4
                .iter()
                .find(|n| n.kind == kind)
                .map(|n| n.ip_address.as_str()),
        )
    }

    pub fn public_ip(&self) -> Option<String> {
        self.address("public")
    }

    pub fn private_ip(&self) -> Option<String> {
        self.address("private")
    }

    pub fn to_status(&self) -> InstanceStatus {
        InstanceStatus {
            status: self.status.clone(),
            is_active: self.is_active(),
            ip: self.public_ip(),
            private_ip: self.private_ip(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateKeyRequest<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct KeyResponse {
    pub ssh_key: KeyInfo,
}

#[derive(Debug, Deserialize)]
pub struct KeyInfo {
    pub id: u64,
}

/// DigitalOcean accepts integer key ids or fingerprint strings
pub fn ssh_key_reference(id: &str) -> serde_json::Value {
    match id.parse::<u64>() {
        Ok(numeric) => serde_json::Value::from(numeric),
        Err(_) => serde_json::Value::from(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_droplet_addresses_from_networks() {
        let droplet: Droplet = serde_json::from_str(
            r#"{
                "id": 3164444,
                "name": "web-1",
                "status": "active",
                "networks": {
                    "v4": [
                        {"ip_address": "10.128.192.124", "type": "private"},
                        {"ip_address": "192.241.165.154", "type": "public"}
                    ]
                }
            }"#,
        )
        .unwrap();

        let status = droplet.to_status();
        assert!(status.is_active);
        assert_eq!(status.ip.as_deref(), Some("192.241.165.154"));
        assert_eq!(status.private_ip.as_deref(), Some("10.128.192.124"));
    }

    #[test]
    fn test_new_droplet_has_no_addresses() {
        let droplet: Droplet =
            serde_json::from_str(r#"{"id": 1, "name": "web-1", "status": "new"}"#).unwrap();
        let status = droplet.to_status();
        assert!(!status.is_active);
        assert_eq!(status.ip, None);
        assert_eq!(status.private_ip, None);
    }

    #[test]
    fn test_ssh_key_reference() {
        assert_eq!(ssh_key_reference("512189"), serde_json::json!(512189));
        assert_eq!(
            ssh_key_reference("3b:16:bf:e4"),
            serde_json::json!("3b:16:bf:e4")
        );
    }
}
