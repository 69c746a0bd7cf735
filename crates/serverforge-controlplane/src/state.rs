//! JSON state-file store
//!
//! Keeps everything in `<data dir>/state.json`. The previous version is kept
//! as `state.json.bak`, and `lock.json` guards against a second process
//! opening the same directory.

use crate::model::{
    Credential, Deployment, EnvironmentVariable, ProviderAccount, ServerRecord, SiteRecord,
};
use crate::store::{Result, ServerStore, StoreData, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

const STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.bak";
const LOCK_FILE: &str = "lock.json";
/// Locks older than this are considered abandoned
const STALE_LOCK_HOURS: i64 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    data: StoreData,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Lock file guard, removed on drop
struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if self.path.exists()
            && let Err(e) = std::fs::remove_file(&self.path)
        {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release state lock");
        }
    }
}

/// [`ServerStore`] persisted to a JSON file
pub struct JsonFileStore {
    dir: PathBuf,
    data: Mutex<StoreData>,
    _lock: StateLock,
}

impl JsonFileStore {
    /// Lock `dir` and load its state file
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
            tracing::debug!("Created state directory: {}", dir.display());
        }

        let lock = acquire_lock(&dir).await?;
        let data = load(&dir.join(STATE_FILE)).await?;

        Ok(Self {
            dir,
            data: Mutex::new(data),
            _lock: lock,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP)
    }

    async fn save(&self, data: &StoreData) -> Result<()> {
        let path = self.state_path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
        }

        let file = StateFile {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            data: data.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        fs::write(&path, content).await?;

        tracing::debug!(
            servers = data.servers.len(),
            accounts = data.accounts.len(),
            sites = data.sites.len(),
            "Saved state"
        );
        Ok(())
    }

    /// Apply `change` to a copy of the state and write it out; memory is
    /// only updated once the file write succeeded.
    async fn mutate<T>(&self, change: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut guard = self.data.lock().await;
        let mut next = guard.clone();
        let value = change(&mut next)?;
        self.save(&next).await?;
        *guard = next;
        Ok(value)
    }
}

async fn load(path: &Path) -> Result<StoreData> {
    if !path.exists() {
        tracing::debug!("State file not found, starting empty");
        return Ok(StoreData::default());
    }

    let content = fs::read_to_string(path).await?;
    let file: StateFile = serde_json::from_str(&content)?;

    if file.version > STATE_VERSION {
        return Err(StoreError::State(format!(
            "State file version {} is newer than supported version {}",
            file.version, STATE_VERSION
        )));
    }

    tracing::debug!(
        servers = file.data.servers.len(),
        accounts = file.data.accounts.len(),
        "Loaded state"
    );
    Ok(file.data)
}

async fn acquire_lock(dir: &Path) -> Result<StateLock> {
    let path = dir.join(LOCK_FILE);

    if path.exists() {
        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<LockInfo>(&content) {
            Ok(info) => {
                let age = Utc::now().signed_duration_since(info.acquired_at);
                if age.num_hours() < STALE_LOCK_HOURS {
                    return Err(StoreError::Lock(format!(
                        "State is locked by {} (pid {}) since {}",
                        info.holder, info.pid, info.acquired_at
                    )));
                }
                tracing::warn!(holder = %info.holder, "Removing stale state lock");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Replacing unreadable state lock");
            }
        }
    }

    let info = LockInfo {
        holder: std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown".to_string()),
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    fs::write(&path, serde_json::to_string_pretty(&info)?).await?;

    tracing::debug!("Acquired state lock");
    Ok(StateLock { path })
}

#[async_trait]
impl ServerStore for JsonFileStore {
    async fn insert_server(
        &self,
        server: ServerRecord,
        credentials: Vec<Credential>,
    ) -> Result<ServerRecord> {
        self.mutate(|data| data.insert_server(server, credentials))
            .await
    }

    async fn get_server(&self, id: Uuid) -> Result<Option<ServerRecord>> {
        Ok(self.data.lock().await.servers.get(&id).cloned())
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.data.lock().await.sorted_servers())
    }

    async fn update_server(&self, server: &ServerRecord) -> Result<ServerRecord> {
        let now = Utc::now();
        self.mutate(|data| data.update_server(server, now)).await
    }

    async fn delete_server(&self, id: Uuid) -> Result<()> {
        self.mutate(|data| data.delete_server(id)).await
    }

    async fn credentials(&self, server_id: Uuid) -> Result<Vec<Credential>> {
        Ok(self
            .data
            .lock()
            .await
            .credentials
            .get(&server_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_account(&self, account: ProviderAccount) -> Result<()> {
        self.mutate(|data| data.insert_account(account)).await
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<ProviderAccount>> {
        Ok(self.data.lock().await.accounts.get(&id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<ProviderAccount>> {
        Ok(self.data.lock().await.sorted_accounts())
    }

    async fn update_account(&self, account: &ProviderAccount) -> Result<()> {
        self.mutate(|data| data.update_account(account)).await
    }

    async fn insert_site(&self, site: SiteRecord) -> Result<()> {
        self.mutate(|data| data.insert_site(site)).await
    }

    async fn get_site(&self, id: Uuid) -> Result<Option<SiteRecord>> {
        Ok(self.data.lock().await.sites.get(&id).cloned())
    }

    async fn list_sites(&self, server_id: Uuid) -> Result<Vec<SiteRecord>> {
        Ok(self.data.lock().await.sorted_sites(server_id))
    }

    async fn update_site(&self, site: &SiteRecord) -> Result<()> {
        let now = Utc::now();
        self.mutate(|data| data.update_site(site, now)).await
    }

    async fn delete_site(&self, id: Uuid) -> Result<()> {
        self.mutate(|data| data.delete_site(id)).await
    }

    async fn environment(&self, site_id: Uuid) -> Result<Vec<EnvironmentVariable>> {
        Ok(self
            .data
            .lock()
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
        self.mutate(|data| data.set_environment(site_id, variables))
            .await
    }

    async fn insert_deployment(&self, deployment: Deployment) -> Result<()> {
        self.mutate(|data| data.insert_deployment(deployment)).await
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Option<Deployment>> {
        Ok(self.data.lock().await.deployments.get(&id).cloned())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.mutate(|data| data.update_deployment(deployment)).await
    }

    async fn deployments(&self, site_id: Uuid) -> Result<Vec<Deployment>> {
        Ok(self.data.lock().await.site_deployments(site_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialKind, ServerStatus};
    use crate::store::fixtures;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
        assert!(store.list_servers().await.unwrap().is_empty());
        assert!(!store.state_path().exists());
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp_dir = tempdir().unwrap();
        let server = fixtures::server("web-1");
        let account = fixtures::account("main");

        {
            let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
            store.insert_account(account.clone()).await.unwrap();
            let credential = Credential::new(server.id, CredentialKind::SudoPassword, "ENC".into());
            let stored = store.insert_server(server.clone(), vec![credential]).await.unwrap();

            let mut next = stored;
            next.status = ServerStatus::Creating;
            store.update_server(&next).await.unwrap();
        }

        let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
        let loaded = store.get_server(server.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ServerStatus::Creating);
        assert_eq!(loaded.revision, 2);
        assert_eq!(store.credentials(server.id).await.unwrap().len(), 1);
        assert!(store.get_account(account.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sites_survive_reopen() {
        let temp_dir = tempdir().unwrap();
        let server = fixtures::server("web-1");
        let site = fixtures::site(server.id, "example.com");

        {
            let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
            store.insert_server(server.clone(), vec![]).await.unwrap();
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
        }

        let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
        let sites = store.list_sites(server.id).await.unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].domain, "example.com");
        assert_eq!(store.environment(site.id).await.unwrap()[0].key, "APP_ENV");
    }

    #[tokio::test]
    async fn test_state_without_sites_still_loads() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(
            temp_dir.path().join(STATE_FILE),
            r#"{"version": 1, "updated_at": "2026-01-01T00:00:00Z", "servers": {}, "accounts": {}}"#,
        )
        .unwrap();

        let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
        assert!(store.list_sites(Uuid::nil()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_keeps_backup() {
        let temp_dir = tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).await.unwrap();

        store.insert_account(fixtures::account("a")).await.unwrap();
        assert!(!temp_dir.path().join(STATE_BACKUP).exists());

        store.insert_account(fixtures::account("b")).await.unwrap();
        let backup = std::fs::read_to_string(temp_dir.path().join(STATE_BACKUP)).unwrap();
        let previous: StateFile = serde_json::from_str(&backup).unwrap();
        assert_eq!(previous.data.accounts.len(), 1);
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out() {
        let temp_dir = tempdir().unwrap();
        let _first = JsonFileStore::open(temp_dir.path()).await.unwrap();

        let second = JsonFileStore::open(temp_dir.path()).await;
        assert!(matches!(second, Err(StoreError::Lock(_))));
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let temp_dir = tempdir().unwrap();
        drop(JsonFileStore::open(temp_dir.path()).await.unwrap());

        assert!(!temp_dir.path().join(LOCK_FILE).exists());
        assert!(JsonFileStore::open(temp_dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_replaced() {
        let temp_dir = tempdir().unwrap();
        let stale = LockInfo {
            holder: "old-host".to_string(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        std::fs::write(
            temp_dir.path().join(LOCK_FILE),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        assert!(JsonFileStore::open(temp_dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_newer_state_version() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(
            temp_dir.path().join(STATE_FILE),
            r#"{"version": 99, "updated_at": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        assert!(matches!(
            JsonFileStore::open(temp_dir.path()).await,
            Err(StoreError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_change_leaves_state_untouched() {
        let temp_dir = tempdir().unwrap();
        let store = JsonFileStore::open(temp_dir.path()).await.unwrap();
        let stored = store
            .insert_server(fixtures::server("web-1"), vec![])
            .await
            .unwrap();

        let mut stale = stored.clone();
        stale.revision = 0;
        assert!(store.update_server(&stale).await.is_err());
        assert_eq!(
            store.get_server(stored.id).await.unwrap().unwrap().revision,
            1
        );
    }
}
