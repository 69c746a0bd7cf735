//! Control-plane records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serverforge_cloud::Vendor;
use serverforge_provision::{
    PhpVersion, ProjectType, ProvisioningStep, RepositoryProvider, ServiceKind, StackSelection,
};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::lifecycle::LifecycleState;

/// Where a server is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[default]
    Pending,
    Creating,
    Provisioning,
    Active,
    Error,
    Deleting,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Pending => "pending",
            ServerStatus::Creating => "creating",
            ServerStatus::Provisioning => "provisioning",
            ServerStatus::Active => "active",
            ServerStatus::Error => "error",
            ServerStatus::Deleting => "deleting",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServerStatus::Pending => "Pending",
            ServerStatus::Creating => "Creating",
            ServerStatus::Provisioning => "Provisioning",
            ServerStatus::Active => "Active",
            ServerStatus::Error => "Error",
            ServerStatus::Deleting => "Deleting",
        }
    }

    /// Automated creation or provisioning is still running
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            ServerStatus::Pending | ServerStatus::Creating | ServerStatus::Provisioning
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the last SSH reachability check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Successful,
    Failed,
}

impl ConnectionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionStatus::Unknown => "Unknown",
            ConnectionStatus::Successful => "Connected",
            ConnectionStatus::Failed => "Connection failed",
        }
    }
}

/// Versioned per-server extension data.
///
/// Bump `SCHEMA_VERSION` whenever a field is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerExtension {
    pub schema_version: u32,
    /// Vendor id of the SSH key registered for this server
    pub provider_ssh_key_id: Option<String>,
    /// Services installed by provisioning
    #[serde(default)]
    pub services: BTreeSet<ServiceKind>,
}

impl ServerExtension {
    pub const SCHEMA_VERSION: u32 = 1;
}

impl Default for ServerExtension {
    fn default() -> Self {
        Self {
            schema_version: Self::SCHEMA_VERSION,
            provider_ssh_key_id: None,
            services: BTreeSet::new(),
        }
    }
}

/// One managed server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub account_id: Uuid,
    pub vendor: Vendor,
    /// Vendor-assigned instance id, set once the instance exists
    pub provider_id: Option<String>,
    pub name: String,
    pub size: String,
    pub region: String,
    pub ip_address: Option<String>,
    pub private_ip_address: Option<String>,
    pub status: ServerStatus,
    pub provisioning_step: ProvisioningStep,
    pub stack: StackSelection,
    pub ssh_port: u16,
    /// Operational account created by provisioning
    pub server_user: String,
    pub os_version: Option<String>,
    /// Deploy key generated on the server itself
    pub local_public_key: Option<String>,
    pub connection_status: ConnectionStatus,
    pub extension: ServerExtension,
    /// Fencing token, bumped by every persisted update
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub last_ssh_connection_at: Option<DateTime<Utc>>,
}

impl ServerRecord {
    pub fn lifecycle_state(&self) -> LifecycleState {
        LifecycleState {
            status: self.status,
            step: self.provisioning_step,
        }
    }

    pub fn set_lifecycle_state(&mut self, state: LifecycleState) {
        self.status = state.status;
        self.provisioning_step = state.step;
    }
}

/// A cloud account the servers are created under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub vendor: Vendor,
    pub name: String,
    /// API token, encrypted at rest
    pub encrypted_token: String,
    pub is_valid: bool,
    pub validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    PrivateKey,
    PublicKey,
    SudoPassword,
    DatabasePassword,
}

impl CredentialKind {
    pub const ALL: [CredentialKind; 4] = [
        CredentialKind::PrivateKey,
        CredentialKind::PublicKey,
        CredentialKind::SudoPassword,
        CredentialKind::DatabasePassword,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::PrivateKey => "private_key",
            CredentialKind::PublicKey => "public_key",
            CredentialKind::SudoPassword => "sudo_password",
            CredentialKind::DatabasePassword => "database_password",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secret scoped to one server. Never updated in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub server_id: Uuid,
    pub kind: CredentialKind,
    pub encrypted_value: String,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(server_id: Uuid, kind: CredentialKind, encrypted_value: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id,
            kind,
            encrypted_value,
            created_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Where a hosted site is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    #[default]
    Pending,
    Installing,
    Deployed,
    Deploying,
    Failed,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Pending => "pending",
            SiteStatus::Installing => "installing",
            SiteStatus::Deployed => "deployed",
            SiteStatus::Deploying => "deploying",
            SiteStatus::Failed => "failed",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SiteStatus::Pending => "Pending",
            SiteStatus::Installing => "Installing",
            SiteStatus::Deployed => "Deployed",
            SiteStatus::Deploying => "Deploying",
            SiteStatus::Failed => "Failed",
        }
    }

    /// A job is working on the site
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SiteStatus::Pending | SiteStatus::Installing | SiteStatus::Deploying
        )
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A website hosted on a server, one nginx virtual host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub id: Uuid,
    pub server_id: Uuid,
    pub domain: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Public directory relative to the site root, e.g. `/public`
    pub directory: String,
    pub repository: Option<String>,
    pub repository_provider: RepositoryProvider,
    pub branch: String,
    pub project_type: ProjectType,
    pub php_version: PhpVersion,
    pub status: SiteStatus,
    pub deploy_script: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deployment_started_at: Option<DateTime<Utc>>,
    pub deployment_finished_at: Option<DateTime<Utc>>,
}

impl SiteRecord {
    /// Checkout directory on the server
    pub fn root_path(&self, server_user: &str) -> String {
        format!("/home/{}/{}", server_user, self.domain)
    }

    /// Directory nginx serves
    pub fn web_root(&self, server_user: &str) -> String {
        let root = self.root_path(server_user);
        match self.directory.trim_end_matches('/') {
            "" => root,
            directory => format!("{}{}", root, directory),
        }
    }

    pub fn clone_url(&self) -> Option<String> {
        self.repository
            .as_deref()
            .map(|repository| self.repository_provider.clone_url(repository))
    }
}

/// One variable of a site's `.env` file, value encrypted at rest
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub key: String,
    pub encrypted_value: String,
}

impl fmt::Debug for EnvironmentVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentVariable")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    #[default]
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "Pending",
            DeploymentStatus::Running => "Running",
            DeploymentStatus::Finished => "Finished",
            DeploymentStatus::Failed => "Failed",
            DeploymentStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Finished | DeploymentStatus::Failed | DeploymentStatus::Cancelled
        )
    }
}

/// One run of a site's deploy script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub site_id: Uuid,
    pub status: DeploymentStatus,
    /// Who asked for it, e.g. `cli`
    pub triggered_by: String,
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub output: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn new(site_id: Uuid, triggered_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_id,
            status: DeploymentStatus::Pending,
            triggered_by: triggered_by.into(),
            commit_hash: None,
            output: Vec::new(),
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            created_at: Utc::now(),
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = DeploymentStatus::Running;
        self.started_at = Some(now);
    }

    pub fn finish(&mut self, status: DeploymentStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
        self.duration_seconds = self.started_at.map(|started| (now - started).num_seconds());
    }
}
