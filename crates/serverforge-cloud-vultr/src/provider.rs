//! Vultr provider implementation

use crate::api::{
    CreateInstanceRequest, CreateKeyRequest, InstanceResponse, KeyResponse, PlansResponse,
    RegionsResponse, UBUNTU_OS_ID,
};
use async_trait::async_trait;
use serverforge_cloud::types::{sort_regions, sort_sizes};
use serverforge_cloud::{
    ApiClient, CloudProvider, CreateServerRequest, CreatedServer, InstanceStatus,
    ProviderCredentials, Region, Result, Size, Vendor,
};
use tracing::{info, warn};

pub const VULTR_API_BASE: &str = "https://api.vultr.com/v2";

/// Vultr provider
pub struct VultrProvider {
    api: ApiClient,
}

impl VultrProvider {
    pub fn new() -> Self {
        Self::with_base_url(VULTR_API_BASE)
    }

    /// Point the driver at a different API endpoint
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiClient::new(Vendor::Vultr, base_url),
        }
    }

    pub fn with_credentials(mut self, credentials: ProviderCredentials) -> Self {
        self.set_credentials(credentials);
        self
    }
}

impl Default for VultrProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for VultrProvider {
    fn vendor(&self) -> Vendor {
        Vendor::Vultr
    }

    fn set_credentials(&mut self, credentials: ProviderCredentials) {
        self.api.set_token(credentials.api_token);
    }

    async fn validate_credentials(&self) -> bool {
        match self.api.probe("account").await {
            Ok(()) => true,
            Err(e) => {
                warn!(vendor = %self.vendor(), error = %e, "Credential validation failed");
                false
            }
        }
    }

    async fn list_regions(&self) -> Result<Vec<Region>> {
        let response: RegionsResponse = self.api.get("regions?per_page=500").await?;
        let mut regions: Vec<Region> = response.regions.into_iter().map(Region::from).collect();
        sort_regions(&mut regions);
        Ok(regions)
    }

    async fn list_sizes(&self) -> Result<Vec<Size>> {
        let response: PlansResponse = self.api.get("plans?per_page=500").await?;
        let mut sizes: Vec<Size> = response
            .plans
            .into_iter()
            .filter(|p| p.is_offered())
            .map(Size::from)
            .collect();
        sort_sizes(&mut sizes);
        Ok(sizes)
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<CreatedServer> {
        let body = CreateInstanceRequest {
            region: &request.region,
            plan: &request.size,
            os_id: UBUNTU_OS_ID,
            label: &request.name,
            hostname: &request.name,
            sshkey_id: vec![request.ssh_key_id.as_str()],
            tags: vec!["serverforge"],
        };

        let response: InstanceResponse = self.api.post("instances", &body).await?;
        let instance = response.instance;
        info!(instance_id = %instance.id, label = %instance.label, "Instance created");

        Ok(CreatedServer {
            id: instance.id,
            name: instance.label,
            status: instance.status,
        })
    }

    async fn get_server_status(&self, server_id: &str) -> Result<InstanceStatus> {
        let response: InstanceResponse = self.api.get(&format!("instances/{}", server_id)).await?;
        Ok(response.instance.to_status())
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        self.api.delete(&format!("instances/{}", server_id)).await
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        let body = CreateKeyRequest {
            name,
            ssh_key: public_key,
        };
        let response: KeyResponse = self.api.post("ssh-keys", &body).await?;
        Ok(response.ssh_key.id)
    }

    async fn delete_ssh_key(&self, key_id: &str) -> Result<()> {
        self.api.delete(&format!("ssh-keys/{}", key_id)).await
    }
}
