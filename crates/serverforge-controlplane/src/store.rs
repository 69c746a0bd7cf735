//! Persistence interface
//!
//! Server updates are compare-and-swap on [`ServerRecord::revision`]: the
//! caller passes the record as it last read it, and the write is rejected if
//! anyone else wrote in between.

use crate::model::{
    Credential, Deployment, EnvironmentVariable, ProviderAccount, ServerRecord, SiteRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    #[error("Record already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Revision conflict on {id}: expected {expected}, found {found}")]
    Conflict { id: Uuid, expected: u64, found: u64 },

    #[error("State file error: {0}")]
    State(String),

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Insert a server together with its credentials, all or nothing
    async fn insert_server(
        &self,
        server: ServerRecord,
        credentials: Vec<Credential>,
    ) -> Result<ServerRecord>;

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerRecord>>;

    async fn list_servers(&self) -> Result<Vec<ServerRecord>>;

    /// Compare-and-swap write; returns the stored record with its new revision
    async fn update_server(&self, server: &ServerRecord) -> Result<ServerRecord>;

    /// Remove a server and its credentials
    async fn delete_server(&self, id: Uuid) -> Result<()>;

    async fn credentials(&self, server_id: Uuid) -> Result<Vec<Credential>>;

    async fn insert_account(&self, account: ProviderAccount) -> Result<()>;

    async fn get_account(&self, id: Uuid) -> Result<Option<ProviderAccount>>;

    async fn list_accounts(&self) -> Result<Vec<ProviderAccount>>;

    async fn update_account(&self, account: &ProviderAccount) -> Result<()>;

    /// Insert a site; its server must exist
    async fn insert_site(&self, site: SiteRecord) -> Result<()>;

    async fn get_site(&self, id: Uuid) -> Result<Option<SiteRecord>>;

    async fn list_sites(&self, server_id: Uuid) -> Result<Vec<SiteRecord>>;

    /// Overwrite a site; `NotFound` once it was deleted
    async fn update_site(&self, site: &SiteRecord) -> Result<()>;

    /// Remove a site with its environment and deployment history
    async fn delete_site(&self, id: Uuid) -> Result<()>;

    async fn environment(&self, site_id: Uuid) -> Result<Vec<EnvironmentVariable>>;

    /// Replace a site's environment as a whole
    async fn set_environment(&self, site_id: Uuid, variables: Vec<EnvironmentVariable>)
    -> Result<()>;

    async fn insert_deployment(&self, deployment: Deployment) -> Result<()>;

    async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>>;

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Deployments of a site, newest first
    async fn deployments(&self, site_id: Uuid) -> Result<Vec<Deployment>>;
}

/// Everything the control plane persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub servers: HashMap<Uuid, ServerRecord>,
    #[serde(default)]
    pub credentials: HashMap<Uuid, Vec<Credential>>,
    #[serde(default)]
    pub accounts: HashMap<Uuid, ProviderAccount>,
    #[serde(default)]
    pub sites: HashMap<Uuid, SiteRecord>,
    /// Keyed by site id
    #[serde(default)]
    pub environment: HashMap<Uuid, Vec<EnvironmentVariable>>,
    #[serde(default)]
    pub deployments: HashMap<Uuid, Deployment>,
}

impl StoreData {
    pub fn insert_server(
        &mut self,
        mut server: ServerRecord,
        credentials: Vec<Credential>,
    ) -> Result<ServerRecord> {
        if self.servers.contains_key(&server.id) {
            return Err(StoreError::AlreadyExists(server.id));
        }
        if let Some(stray) = credentials.iter().find(|c| c.server_id != server.id) {
            return Err(StoreError::State(format!(
                "credential {} belongs to server {}",
                stray.id, stray.server_id
            )));
        }
        server.revision = 1;
        self.credentials.insert(server.id, credentials);
        self.servers.insert(server.id, server.clone());
        Ok(server)
    }

    pub fn update_server(&mut self, server: &ServerRecord, now: DateTime<Utc>) -> Result<ServerRecord> {
        let stored = self
            .servers
            .get_mut(&server.id)
            .ok_or(StoreError::NotFound(server.id))?;
        if stored.revision != server.revision {
            return Err(StoreError::Conflict {
                id: server.id,
                expected: server.revision,
                found: stored.revision,
            });
        }
        let mut next = server.clone();
        next.revision = server.revision + 1;
        next.updated_at = now;
        *stored = next.clone();
        Ok(next)
    }

    pub fn delete_server(&mut self, id: Uuid) -> Result<()> {
        self.servers.remove(&id).ok_or(StoreError::NotFound(id))?;
        self.credentials.remove(&id);
        let sites: Vec<Uuid> = self
            .sites
            .values()
            .filter(|site| site.server_id == id)
            .map(|site| site.id)
            .collect();
        for site_id in sites {
            self.delete_site(site_id)?;
        }
        Ok(())
    }

    pub fn insert_site(&mut self, site: SiteRecord) -> Result<()> {
        if self.sites.contains_key(&site.id) {
            return Err(StoreError::AlreadyExists(site.id));
        }
        if !self.servers.contains_key(&site.server_id) {
            return Err(StoreError::NotFound(site.server_id));
        }
        self.sites.insert(site.id, site);
        Ok(())
    }

    pub fn update_site(&mut self, site: &SiteRecord, now: DateTime<Utc>) -> Result<()> {
        let stored = self
            .sites
            .get_mut(&site.id)
            .ok_or(StoreError::NotFound(site.id))?;
        *stored = site.clone();
        stored.updated_at = now;
        Ok(())
    }

    pub fn delete_site(&mut self, id: Uuid) -> Result<()> {
        self.sites.remove(&id).ok_or(StoreError::NotFound(id))?;
        self.environment.remove(&id);
        self.deployments.retain(|_, deployment| deployment.site_id != id);
        Ok(())
    }

    pub fn set_environment(
        &mut self,
        site_id: Uuid,
        variables: Vec<EnvironmentVariable>,
    ) -> Result<()> {
        if !self.sites.contains_key(&site_id) {
            return Err(StoreError::NotFound(site_id));
        }
        self.environment.insert(site_id, variables);
        Ok(())
    }

    pub fn insert_deployment(&mut self, deployment: Deployment) -> Result<()> {
        if self.deployments.contains_key(&deployment.id) {
            return Err(StoreError::AlreadyExists(deployment.id));
        }
        if !self.sites.contains_key(&deployment.site_id) {
            return Err(StoreError::NotFound(deployment.site_id));
        }
        self.deployments.insert(deployment.id, deployment);
        Ok(())
    }

    pub fn update_deployment(&mut self, deployment: &Deployment) -> Result<()> {
        let stored = self
            .deployments
            .get_mut(&deployment.id)
            .ok_or(StoreError::NotFound(deployment.id))?;
        *stored = deployment.clone();
        Ok(())
    }

    pub fn sorted_sites(&self, server_id: Uuid) -> Vec<SiteRecord> {
        let mut sites: Vec<SiteRecord> = self
            .sites
            .values()
            .filter(|site| site.server_id == server_id)
            .cloned()
            .collect();
        sites.sort_by(|a, b| a.domain.cmp(&b.domain));
        sites
    }

    pub fn site_deployments(&self, site_id: Uuid) -> Vec<Deployment> {
        let mut deployments: Vec<Deployment> = self
            .deployments
            .values()
            .filter(|deployment| deployment.site_id == site_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        deployments
    }

    pub fn insert_account(&mut self, account: ProviderAccount) -> Result<()> {
        if self.accounts.contains_key(&account.id) {
            return Err(StoreError::AlreadyExists(account.id));
        }
        self.accounts.insert(account.id, account);
        Ok(())
    }

    pub fn update_account(&mut self, account: &ProviderAccount) -> Result<()> {
        let stored = self
            .accounts
            .get_mut(&account.id)
            .ok_or(StoreError::NotFound(account.id))?;
        *stored = account.clone();
        Ok(())
    }

    pub fn sorted_servers(&self) -> Vec<ServerRecord> {
        let mut servers: Vec<ServerRecord> = self.servers.values().cloned().collect();
        servers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        servers
    }

    pub fn sorted_accounts(&self) -> Vec<ProviderAccount> {
        let mut accounts: Vec<ProviderAccount> = self.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        accounts
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn insert_server(
        &self,
        server: ServerRecord,
        credentials: Vec<Credential>,
    ) -> Result<ServerRecord> {
        self.data.write().await.insert_server(server, credentials)
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerRecord>> {
        Ok(self.data.read().await.servers.get(&id).cloned())
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.data.read().await.sorted_servers())
    }

    async fn update_server(&self, server: &ServerRecord) -> Result<ServerRecord> {
        self.data.write().await.update_server(server, Utc::now())
    }

    async fn delete_server(&self, id: Uuid) -> Result<()> {
        self.data.write().await.delete_server(id)
    }

    async fn credentials(&self, server_id: Uuid) -> Result<Vec<Credential>> {
        Ok(self
            .data
            .read()
            .await
            .credentials
            .get(&server_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_account(&self, account: ProviderAccount) -> Result<()> {
        self.data.write().await.insert_account(account)
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<ProviderAccount>> {
        Ok(self.data.read().await.accounts.get(&id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<ProviderAccount>> {
        Ok(self.data.read().await.sorted_accounts())
    }

    async fn update_account(&self, account: &ProviderAccount) -> Result<()> {
        self.data.write().await.update_account(account)
    }

    async fn insert_site(&self, site: SiteRecord) -> Result<()> {
        self.data.write().await.insert_site(site)
    }

    async fn get_site(&self, id: Uuid) -> Result<Option<SiteRecord>> {
        Ok(self.data.read().await.sites.get(&id).cloned())
    }

    async fn list_sites(&self, server_id: Uuid) -> Result<Vec<SiteRecord>> {
        Ok(self.data.read().await.sorted_sites(server_id))
    }

    async fn update_site(&self, site: &SiteRecord) -> Result<()> {
        self.data.write().await.update_site(site, Utc::now())
    }

    async fn delete_site(&self, id: Uuid) -> Result<()> {
        self.data.write().await.delete_site(id)
    }

    async fn environment(&self, site_id: Uuid) -> Result<Vec<EnvironmentVariable>> {
        Ok(self
            .data
            .read()
            .await
            .environment
            .get(&site_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_environment(
        &self,
        site_id: Uuid,
        variables: Vec<EnvironmentVariable>,
    ) -> Result<()> {
        self.data.write().await.set_environment(site_id, variables)
    }

    async fn insert_deployment(&self, deployment: Deployment) -> Result<()> {
        self.data.write().await.insert_deployment(deployment)
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        Ok(self.data.read().await.deployments.get(&id).cloned())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.data.write().await.update_deployment(deployment)
    }

    async fn deployments(&self, site_id: Uuid) -> Result<Vec<Deployment>> {
        Ok(self.data.read().await.site_deployments(site_id))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures;
    use super::*;
    use crate::model::{CredentialKind, ServerStatus, SiteStatus};

    #[tokio::test]
    async fn test_insert_sets_first_revision() {
        let store = MemoryStore::new();
        let server = fixtures::server("web-1");
        let credential = Credential::new(server.id, CredentialKind::PublicKey, "ENC".into());

        let stored = store.insert_server(server.clone(), vec![credential]).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(store.credentials(server.id).await.unwrap().len(), 1);
        assert!(matches!(
            store.insert_server(server, vec![]).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_rejects_foreign_credentials() {
        let store = MemoryStore::new();
        let server = fixtures::server("web-1");
        let stray = Credential::new(Uuid::new_v4(), CredentialKind::PublicKey, "ENC".into());

        assert!(store.insert_server(server.clone(), vec![stray]).await.is_err());
        assert!(store.get_server(server.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_is_compare_and_swap() {
        let store = MemoryStore::new();
        let stored = store
            .insert_server(fixtures::server("web-1"), vec![])
            .await
            .unwrap();

        let mut first = stored.clone();
        first.status = ServerStatus::Creating;
        let first = store.update_server(&first).await.unwrap();
        assert_eq!(first.revision, 2);

        let mut stale = stored;
        stale.status = ServerStatus::Error;
        let err = store.update_server(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                found: 2,
                ..
            }
        ));

        let current = store.get_server(first.id).await.unwrap().unwrap();
        assert_eq!(current.status, ServerStatus::Creating);
    }

    #[tokio::test]
    async fn test_delete_removes_credentials() {
        let store = MemoryStore::new();
        let server = fixtures::server("web-1");
        let credential = Credential::new(server.id, CredentialKind::PrivateKey, "ENC".into());
        store.insert_server(server.clone(), vec![credential]).await.unwrap();

        store.delete_server(server.id).await.unwrap();
        assert!(store.get_server(server.id).await.unwrap().is_none());
        assert!(store.credentials(server.id).await.unwrap().is_empty());
        assert!(matches!(
            store.delete_server(server.id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_site_requires_server() {
        let store = MemoryStore::new();
        let orphan = fixtures::site(Uuid::new_v4(), "example.com");
        assert!(matches!(
            store.insert_site(orphan).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deleting_server_removes_its_sites() {
        let store = MemoryStore::new();
        let server = store
            .insert_server(fixtures::server("web-1"), vec![])
            .await
            .unwrap();
        let site = fixtures::site(server.id, "example.com");
        store.insert_site(site.clone()).await.unwrap();
        store
            .set_environment(
                site.id,
                vec![EnvironmentVariable {
                    key: "APP_ENV".into(),
                    encrypted_value: "ENC".into(),
                }],
            )
            .await
            .unwrap();
        store
            .insert_deployment(Deployment::new(site.id, "cli"))
            .await
            .unwrap();

        store.delete_server(server.id).await.unwrap();
        assert!(store.get_site(site.id).await.unwrap().is_none());
        assert!(store.environment(site.id).await.unwrap().is_empty());
        assert!(store.deployments(site.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_of_deleted_site_fails() {
        let store = MemoryStore::new();
        let server = store
            .insert_server(fixtures::server("web-1"), vec![])
            .await
            .unwrap();
        let mut site = fixtures::site(server.id, "example.com");
        store.insert_site(site.clone()).await.unwrap();
        store.delete_site(site.id).await.unwrap();

        site.status = SiteStatus::Deployed;
        assert!(matches!(
            store.update_site(&site).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.set_environment(site.id, vec![]).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deployments_newest_first() {
        let store = MemoryStore::new();
        let server = store
            .insert_server(fixtures::server("web-1"), vec![])
            .await
            .unwrap();
        let site = fixtures::site(server.id, "example.com");
        store.insert_site(site.clone()).await.unwrap();

        let mut older = Deployment::new(site.id, "cli");
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = Deployment::new(site.id, "cli");
        store.insert_deployment(older.clone()).await.unwrap();
        store.insert_deployment(newer.clone()).await.unwrap();

        let ids: Vec<Uuid> = store
            .deployments(site.id)
            .await
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn test_accounts() {
        let store = MemoryStore::new();
        let mut account = fixtures::account("main");
        store.insert_account(account.clone()).await.unwrap();

        account.is_valid = false;
        store.update_account(&account).await.unwrap();
        let loaded = store.get_account(account.id).await.unwrap().unwrap();
        assert!(!loaded.is_valid);
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
    }
}
