//! Hetzner Cloud provider implementation

use crate::api::{
    CreateKeyRequest, CreateServerBody, KeyResponse, LocationsResponse, ServerResponse,
    ServerTypesResponse, ssh_key_reference,
};
use async_trait::async_trait;
use serverforge_cloud::types::{sort_regions, sort_sizes};
use serverforge_cloud::{
    ApiClient, CloudProvider, CreateServerRequest, CreatedServer, InstanceStatus,
    ProviderCredentials, Region, Result, Size, Vendor,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub const HETZNER_API_BASE: &str = "https://api.hetzner.cloud/v1";

const IMAGE: &str = "ubuntu-22.04";

fn labels() -> BTreeMap<&'static str, &'static str> {
    BTreeMap::from([("app", "serverforge")])
}

/// Hetzner Cloud provider
pub struct HetznerProvider {
    api: ApiClient,
}

impl HetznerProvider {
    pub fn new() -> Self {
        Self::with_base_url(HETZNER_API_BASE)
    }

    /// Point the driver at a different API endpoint
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            api: ApiClient::new(Vendor::Hetzner, base_url),
        }
    }

    pub fn with_credentials(mut self, credentials: ProviderCredentials) -> Self {
        self.set_credentials(credentials);
        self
    }
}

impl Default for HetznerProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    fn vendor(&self) -> Vendor {
        Vendor::Hetzner
    }

    fn set_credentials(&mut self, credentials: ProviderCredentials) {
        self.api.set_token(credentials.api_token);
    }

    async fn validate_credentials(&self) -> bool {
        match self.api.probe("servers?per_page=1").await {
            Ok(()) => true,
            Err(e) => {
                warn!(vendor = %self.vendor(), error = %e, "Credential validation failed");
                false
            }
        }
    }

    async fn list_regions(&self) -> Result<Vec<Region>> {
        let response: LocationsResponse = self.api.get("locations").await?;
        let mut regions: Vec<Region> = response.locations.into_iter().map(Region::from).collect();
        sort_regions(&mut regions);
        Ok(regions)
    }

    async fn list_sizes(&self) -> Result<Vec<Size>> {
        let response: ServerTypesResponse = self.api.get("server_types?per_page=50").await?;
        let mut sizes = Vec::new();
        for server_type in response.server_types {
            if server_type.is_deprecated() {
                continue;
            }
            match server_type.to_size() {
                Some(size) => sizes.push(size),
                None => debug!(server_type = %server_type.name, "Skipping server type without price"),
            }
        }
        sort_sizes(&mut sizes);
        Ok(sizes)
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<CreatedServer> {
        let body = CreateServerBody {
            name: &request.name,
            server_type: &request.size,
            location: &request.region,
            image: IMAGE,
            ssh_keys: vec![ssh_key_reference(&request.ssh_key_id)],
            start_after_create: true,
            labels: labels(),
        };

        let response: ServerResponse = self.api.post("servers", &body).await?;
        let server = response.server;
        info!(hetzner_server_id = server.id, name = %server.name, "Server created");

        Ok(CreatedServer {
            id: server.id.to_string(),
            name: server.name,
            status: server.status,
        })
    }

    async fn get_server_status(&self, server_id: &str) -> Result<InstanceStatus> {
        let response: ServerResponse = self.api.get(&format!("servers/{}", server_id)).await?;
        Ok(response.server.to_status())
    }

    async fn delete_server(&self, server_id: &str) -> Result<()> {
        self.api.delete(&format!("servers/{}", server_id)).await
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        let body = CreateKeyRequest {
            name,
            public_key,
            labels: labels(),
        };
        let response: KeyResponse = self.api.post("ssh_keys", &body).await?;
        Ok(response.ssh_key.id.to_string())
    }

    async fn delete_ssh_key(&self, key_id: &str) -> Result<()> {
        self.api.delete(&format!("ssh_keys/{}", key_id)).await
    }
}
