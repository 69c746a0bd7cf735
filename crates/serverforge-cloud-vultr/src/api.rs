//! Vultr API v2 wire types

use serde::{Deserialize, Serialize};
use serverforge_cloud::{InstanceStatus, Region, Size, types::assigned_ip};

/// Ubuntu 22.04 x64
pub const UBUNTU_OS_ID: u32 = 1743;

/// Shared-CPU cloud compute plans
pub const PLAN_TYPE: &str = "vc2";

#[derive(Debug, Deserialize)]
pub struct RegionsResponse {
    pub regions: Vec<RegionInfo>,
}

#[derive(Debug, Deserialize)]
pub struct RegionInfo {
    pub id: String,
    pub city: String,
    pub country: String,
}

impl From<RegionInfo> for Region {
    fn from(info: RegionInfo) -> Self {
        let name = format!("{}, {}", info.city, info.country);
        Region::new(info.id, name)
    }
}

#[derive(Debug, Deserialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

#[derive(Debug, Deserialize)]
pub struct Plan {
    pub id: String,
    pub vcpu_count: u32,
    /// Megabytes
    pub ram: u64,
    /// Gigabytes
    pub disk: u64,
    pub monthly_cost: f64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub locations: Vec<String>,
}

impl Plan {
    /// Cloud compute plan deployable in at least one region
    pub fn is_offered(&self) -> bool {
        self.kind == PLAN_TYPE && !self.locations.is_empty()
    }
}

impl From<Plan> for Size {
    fn from(plan: Plan) -> Self {
        Size {
            slug: plan.id,
            vcpus: plan.vcpu_count,
            memory_mb: plan.ram,
            disk_gb: plan.disk,
            price_monthly: plan.monthly_cost,
        }
    }
}

/// `POST /instances` body
#[derive(Debug, Serialize)]
pub struct CreateInstanceRequest<'a> {
    pub region: &'a str,
    pub plan: &'a str,
    pub os_id: u32,
    pub label: &'a str,
    pub hostname: &'a str,
    pub sshkey_id: Vec<&'a str>,
    pub tags: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct InstanceResponse {
    pub instance: Instance,
}

#[derive(Debug, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "pending")]
    pub status: String,
    #[serde(default)]
    pub power_status: String,
    #[serde(default)]
    pub main_ip: Option<String>,
    #[serde(default)]
    pub internal_ip: Option<String>,
}

fn pending() -> String {
    "pending".to_string()
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == "active" && self.power_status == "running"
    }

    pub fn to_status(&self) -> InstanceStatus {
        InstanceStatus {
            status: self.status.clone(),
            is_active: self.is_running(),
            ip: assigned_ip(self.main_ip.as_deref()),
            private_ip: assigned_ip(self.internal_ip.as_deref()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateKeyRequest<'a> {
    pub name: &'a str,
    pub ssh_key: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct KeyResponse {
    pub ssh_key: KeyInfo,
}

#[derive(Debug, Deserialize)]
pub struct KeyInfo {
    pub id: String,
}
