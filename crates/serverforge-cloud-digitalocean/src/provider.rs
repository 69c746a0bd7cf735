//! DigitalOcean provider implementation

use crate::api::{
    CreateDropletRequest, CreateKeyRequest, DropletResponse, KeyResponse, RegionsResponse,
    SizesResponse, ssh_key_reference,
};
use async_trait::async_trait;
use serverforge_cloud::types::{sort_regions, sort_sizes};
use serverforge_cloud::{
    ApiClient, CloudProvider, CreateServerRequest, CreatedServer, InstanceStatus,
    ProviderCredentials, Region, Result, Size, Vendor,
};
use tracing::{info, warn};

pub const DIGITALOCEAN_API_BASE: &str = "https://api.digitalocean.com/v2";

/// Ubuntu 22.04 LTS
const IMAGE: &str = "ubuntu-22-04-x64";

/// DigitalOcean provider
pub struct DigitalOceanProvider {
    api: ApiClient,
}

impl DigitalOceanProvider {
    pub fn new() -> Self {
        Self::with_base_url(DIGITALOCEAN_API_BASE)
    }

    /// Point the driver at a different API endpoint
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiClient::new(Vendor::DigitalOcean, base_url),
        }
    }

    pub fn with_credentials(mut self, credentials: ProviderCredentials) -> Self {
        self.set_credentials(credentials);
        self
    }
}

impl Default for DigitalOceanProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    fn vendor(&self) -> Vendor {
        Vendor::DigitalOcean
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
        let response: RegionsResponse = self.api.get("regions?per_page=200").await?;
        let mut regions: Vec<Region> = response
            .regions
            .into_iter()
            .filter(|r| r.available)
            .map(Region::from)
            .collect();
        sort_regions(&mut regions);
        Ok(regions)
    }

    async fn list_sizes(&self) -> Result<Vec<Size>> {
        let response: SizesResponse = self.api.get("sizes?per_page=200").await?;
        let mut sizes: Vec<Size> = response
            .sizes
            .into_iter()
            .filter(|s| s.available)
            .map(Size::from)
            .collect();
        sort_sizes(&mut sizes);
        Ok(sizes)
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<CreatedServer> {
        let body = CreateDropletRequest {
            name: &request.name,
            region: &request.region,
            size: &request.size,
            image: IMAGE,
            ssh_keys: vec![ssh_key_reference(&request.ssh_key_id)],
            backups: false,
            ipv6: false,
            monitoring: true,
            tags: vec!["serverforge"],
        };

        let response: DropletResponse = self.api.post("droplets", &body).await?;
        let droplet = response.droplet;
        info!(droplet_id = droplet.id, name = %droplet.name, "Droplet created");

        Ok(CreatedServer {
            id: droplet.id.to_string(),
            name: droplet.name,
            status: droplet.status,
        })
    }

    async fn get_server_status(&self, server_id: &str) -> Result<InstanceStatus> {
        let response: DropletResponse = self.api.get(&format!("droplets/{}", server_id)).await?;
        Ok(response.droplet.to_status())
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        self.api.delete(&format!("droplets/{}", server_id)).await
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        let response: KeyResponse = self
            .api
            .post("account/keys", &CreateKeyRequest { name, public_key })
            .await?;
        Ok(response.ssh_key.id.to_string())
    }

    async fn delete_ssh_key(&self, key_id: &str) -> Result<()> {
        self.api.delete(&format!("account/keys/{}", key_id)).await
    }
}
