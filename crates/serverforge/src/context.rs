//! Wiring shared by all state-backed commands

use crate::progress;
use anyhow::{Context as _, bail};
use serverforge_config::Settings;
use serverforge_controlplane::{
    AesGcmCipher, BroadcastEvents, JsonFileStore, LifecycleConfig, ProviderAccount,
    ProviderRegistry, ServerLifecycleOrchestrator, ServerRecord, ServerStore, SiteRecord,
    WorkerPool,
};
use serverforge_ssh::Ssh2Connector;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use uuid::Uuid;

const SECRET_KEY_FILE: &str = "secret.key";

/// Single-operator CLI: everything belongs to the nil owner
pub const OWNER: Uuid = Uuid::nil();

pub struct AppContext {
    pub store: Arc<JsonFileStore>,
    pub orchestrator: Arc<ServerLifecycleOrchestrator>,
    pub events: Arc<BroadcastEvents>,
    pool: WorkerPool,
}

impl AppContext {
    pub async fn open(settings: &Settings) -> anyhow::Result<Self> {
        let data_dir = settings.data_dir()?;
        let store = Arc::new(
            JsonFileStore::open(&data_dir)
                .await
                .with_context(|| format!("Failed to open state in {}", data_dir.display()))?,
        );
        let cipher = Arc::new(load_cipher(settings, &data_dir)?);
        let events = Arc::new(BroadcastEvents::default());

        let mut pool = WorkerPool::new(settings.workers.concurrency);
        let orchestrator = Arc::new(ServerLifecycleOrchestrator::new(
            store.clone(),
            Arc::new(ProviderRegistry::new()),
            Arc::new(Ssh2Connector::default()),
            Arc::new(pool.queue()),
            events.clone(),
            cipher,
            LifecycleConfig::from(settings),
        )?);
        pool.start(orchestrator.clone());

        tracing::debug!(data_dir = %data_dir.display(), "Control plane ready");
        Ok(Self {
            store,
            orchestrator,
            events,
            pool,
        })
    }

    /// Look an account up by id or by unique name
    pub async fn account(&self, key: &str) -> anyhow::Result<ProviderAccount> {
        let accounts = self.store.list_accounts().await?;
        if let Ok(id) = Uuid::parse_str(key)
            && let Some(account) = accounts.iter().find(|a| a.id == id)
        {
            return Ok(account.clone());
        }

        let mut matches = accounts.into_iter().filter(|a| a.name == key);
        match (matches.next(), matches.next()) {
            (Some(account), None) => Ok(account),
            (Some(_), Some(_)) => bail!("Several accounts are named '{}'; use the id", key),
            (None, _) => bail!("Account '{}' not found", key),
        }
    }

    /// Look a server up by id or by unique name
    pub async fn server(&self, key: &str) -> anyhow::Result<ServerRecord> {
        let servers = self.store.list_servers().await?;
        if let Ok(id) = Uuid::parse_str(key)
            && let Some(server) = servers.iter().find(|s| s.id == id)
        {
            return Ok(server.clone());
        }

        let mut matches = servers.into_iter().filter(|s| s.name == key);
        match (matches.next(), matches.next()) {
            (Some(server), None) => Ok(server),
            (Some(_), Some(_)) => bail!("Several servers are named '{}'; use the id", key),
            (None, _) => bail!("Server '{}' not found", key),
        }
    }

    /// Look a site up by id or by domain; a domain hosted on several
    /// servers must be narrowed with `server`
    pub async fn site(&self, key: &str, server: Option<&str>) -> anyhow::Result<SiteRecord> {
        if let Ok(id) = Uuid::parse_str(key)
            && let Some(site) = self.store.get_site(id).await?
        {
            return Ok(site);
        }

        let servers = match server {
            Some(server) => vec![self.server(server).await?],
            None => self.store.list_servers().await?,
        };
        let mut matches = Vec::new();
        for server in &servers {
            matches.extend(
                self.store
                    .list_sites(server.id)
                    .await?
                    .into_iter()
                    .filter(|site| site.domain == key),
            );
        }

        let mut matches = matches.into_iter();
        match (matches.next(), matches.next()) {
            (Some(site), None) => Ok(site),
            (Some(_), Some(_)) => bail!("{} is hosted on several servers; pass --server", key),
            (None, _) => bail!("Site '{}' not found", key),
        }
    }

    /// Run queued jobs to completion, printing progress, then stop the workers.
    /// Returns how many jobs were given up on.
    pub async fn run_until_idle(self, names: HashMap<Uuid, String>) -> usize {
        let (stop_tx, stop_rx) = oneshot::channel();
        let printer = tokio::spawn(progress::follow(self.events.subscribe(), names, stop_rx));

        self.pool.wait_idle().await;
        let _ = stop_tx.send(());
        if let Err(e) = printer.await {
            tracing::warn!(error = %e, "Progress printer stopped unexpectedly");
        }
        let exhausted = self.pool.exhausted();
        self.pool.shutdown();
        exhausted
    }
}

/// Key from the configured env var, else `<data dir>/secret.key`, created on first use
fn load_cipher(settings: &Settings, data_dir: &Path) -> anyhow::Result<AesGcmCipher> {
    if let Ok(encoded) = std::env::var(&settings.secrets.key_env) {
        return AesGcmCipher::from_base64_key(encoded.trim())
            .with_context(|| format!("{} is not a valid key", settings.secrets.key_env));
    }

    let path = data_dir.join(SECRET_KEY_FILE);
    let encoded = if path.exists() {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    } else {
        let key = AesGcmCipher::generate_key();
        write_private_file(&path, &key)?;
        tracing::info!(path = %path.display(), "Generated secret key");
        key
    };

    AesGcmCipher::from_base64_key(encoded.trim())
        .with_context(|| format!("{} does not hold a valid key", path.display()))
}

fn write_private_file(path: &Path, content: &str) -> anyhow::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
