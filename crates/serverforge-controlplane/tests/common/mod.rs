//! Shared fixtures for control-plane integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use serverforge_cloud::{
    CloudError, CloudProvider, CreateServerRequest, CreatedServer, InstanceStatus,
    ProviderCredentials, Region, Size, Vendor,
};
use serverforge_controlplane::{
    AesGcmCipher, BroadcastEvents, Credential, CredentialKind, Deployment, EnvironmentVariable,
    Job, JobHandler, JobQueue, LifecycleConfig, LifecycleError, MemoryStore, NewServer, NewSite,
    ProviderAccount, ProviderRegistry, SecretCipher, ServerEvent, ServerLifecycleOrchestrator,
    ServerRecord, ServerStore, SiteRecord, StoreError,
};
use serverforge_provision::{DatabaseKind, PhpVersion, ProjectType, RepositoryProvider, StackSelection};
use serverforge_ssh::ReadinessPolicy;
use serverforge_ssh::testing::{FakeConnector, FakeHost};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const OWNER: Uuid = Uuid::from_u128(0x5eed);
pub const TOKEN: &str = "hetzner-token";

// ----------------------------------------------------------------------------
// Vendor fake
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct ProviderState {
    pub valid: bool,
    /// Replayed by `get_server_status`; the last one repeats
    pub statuses: Vec<InstanceStatus>,
    pub status_polls: u32,
    pub tokens: Vec<String>,
    pub created: Vec<CreateServerRequest>,
    pub deleted_servers: Vec<String>,
    pub ssh_keys: Vec<(String, String)>,
    pub deleted_keys: Vec<String>,
    pub fail_delete_server: Option<CloudError>,
    /// How long `create_server` takes to answer
    pub create_delay: Duration,
}

#[derive(Clone)]
pub struct FakeProvider {
    pub state: Arc<Mutex<ProviderState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState {
                valid: true,
                statuses: vec![reachable("203.0.113.10")],
                ..ProviderState::default()
            })),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap()
    }

    pub fn set_statuses(&self, statuses: Vec<InstanceStatus>) {
        self.state().statuses = statuses;
    }
}

pub fn starting() -> InstanceStatus {
    InstanceStatus {
        status: "initializing".to_string(),
        is_active: false,
        ip: None,
        private_ip: None,
    }
}

pub fn reachable(ip: &str) -> InstanceStatus {
    InstanceStatus {
        status: "running".to_string(),
        is_active: true,
        ip: Some(ip.to_string()),
        private_ip: Some("10.0.0.2".to_string()),
    }
}

pub fn api_error(status: u16) -> CloudError {
    CloudError::ProviderApi {
        vendor: Vendor::Hetzner,
        status,
        body: format!("HTTP {}", status),
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    fn vendor(&self) -> Vendor {
        Vendor::Hetzner
    }

    fn set_credentials(&mut self, credentials: ProviderCredentials) {
        self.state().tokens.push(credentials.api_token);
    }

    async fn validate_credentials(&self) -> bool {
        self.state().valid
    }

    async fn list_regions(&self) -> serverforge_cloud::Result<Vec<Region>> {
        Ok(vec![Region::new("fsn1", "Falkenstein")])
    }

    async fn list_sizes(&self) -> serverforge_cloud::Result<Vec<Size>> {
        Ok(vec![])
    }

    async fn create_server(
        &self,
        request: &CreateServerRequest,
    ) -> serverforge_cloud::Result<CreatedServer> {
        let delay = self.state().create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.created.push(request.clone());
        Ok(CreatedServer {
            id: format!("vm-{}", state.created.len()),
            name: request.name.clone(),
            status: "initializing".to_string(),
        })
    }

    async fn get_server_status(&self, _server_id: &str) -> serverforge_cloud::Result<InstanceStatus> {
        let mut state = self.state();
        let index = (state.status_polls as usize).min(state.statuses.len().saturating_sub(1));
        state.status_polls += 1;
        state
            .statuses
            .get(index)
            .cloned()
            .ok_or_else(|| api_error(500))
    }

    async fn delete_server(&self, server_id: &str) -> serverforge_cloud::Result<()> {
        let mut state = self.state();
        state.deleted_servers.push(server_id.to_string());
        match state.fail_delete_server.take() {
            Some(e) => {
                state.fail_delete_server = Some(api_error(e.status().unwrap_or(500)));
                Err(e)
            }
            None => Ok(()),
        }
    }

    async fn create_ssh_key(&self, name: &str, public_key: &str) -> serverforge_cloud::Result<String> {
        let mut state = self.state();
        state.ssh_keys.push((name.to_string(), public_key.to_string()));
        Ok(format!("key-{}", state.ssh_keys.len()))
    }

    async fn delete_ssh_key(&self, key_id: &str) -> serverforge_cloud::Result<()> {
        self.state().deleted_keys.push(key_id.to_string());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Store wrapper with injectable failures
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    pub fail_inserts: AtomicU32,
    pub fail_deletes: AtomicU32,
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ServerStore for FlakyStore {
    async fn insert_server(
        &self,
        server: ServerRecord,
        credentials: Vec<Credential>,
    ) -> serverforge_controlplane::store::Result<ServerRecord> {
        if take_failure(&self.fail_inserts) {
            return Err(StoreError::State("disk full".to_string()));
        }
        self.inner.insert_server(server, credentials).await
    }

    async fn get_server(&self, id: Uuid) -> serverforge_controlplane::store::Result<Option<ServerRecord>> {
        self.inner.get_server(id).await
    }

    async fn list_servers(&self) -> serverforge_controlplane::store::Result<Vec<ServerRecord>> {
        self.inner.list_servers().await
    }

    async fn update_server(&self, server: &ServerRecord) -> serverforge_controlplane::store::Result<ServerRecord> {
        self.inner.update_server(server).await
    }

    async fn delete_server(&self, id: Uuid) -> serverforge_controlplane::store::Result<()> {
        if take_failure(&self.fail_deletes) {
            return Err(StoreError::State("database unavailable".to_string()));
        }
        self.inner.delete_server(id).await
    }

    async fn credentials(&self, server_id: Uuid) -> serverforge_controlplane::store::Result<Vec<Credential>> {
        self.inner.credentials(server_id).await
    }

    async fn insert_account(&self, account: ProviderAccount) -> serverforge_controlplane::store::Result<()> {
        self.inner.insert_account(account).await
    }

    async fn get_account(&self, id: Uuid) -> serverforge_controlplane::store::Result<Option<ProviderAccount>> {
        self.inner.get_account(id).await
    }

    async fn list_accounts(&self) -> serverforge_controlplane::store::Result<Vec<ProviderAccount>> {
        self.inner.list_accounts().await
    }

    async fn update_account(&self, account: &ProviderAccount) -> serverforge_controlplane::store::Result<()> {
        self.inner.update_account(account).await
    }

    async fn insert_site(&self, site: SiteRecord) -> serverforge_controlplane::store::Result<()> {
        self.inner.insert_site(site).await
    }

    async fn get_site(&self, id: Uuid) -> serverforge_controlplane::store::Result<Option<SiteRecord>> {
        self.inner.get_site(id).await
    }

    async fn list_sites(&self, server_id: Uuid) -> serverforge_controlplane::store::Result<Vec<SiteRecord>> {
        self.inner.list_sites(server_id).await
    }

    async fn update_site(&self, site: &SiteRecord) -> serverforge_controlplane::store::Result<()> {
        self.inner.update_site(site).await
    }

    async fn delete_site(&self, id: Uuid) -> serverforge_controlplane::store::Result<()> {
        if take_failure(&self.fail_deletes) {
            return Err(StoreError::State("database unavailable".to_string()));
        }
        self.inner.delete_site(id).await
    }

    async fn environment(&self, site_id: Uuid) -> serverforge_controlplane::store::Result<Vec<EnvironmentVariable>> {
        self.inner.environment(site_id).await
    }

    async fn set_environment(
        &self,
        site_id: Uuid,
        variables: Vec<EnvironmentVariable>,
    ) -> serverforge_controlplane::store::Result<()> {
        self.inner.set_environment(site_id, variables).await
    }

    async fn insert_deployment(&self, deployment: Deployment) -> serverforge_controlplane::store::Result<()> {
        self.inner.insert_deployment(deployment).await
    }

    async fn get_deployment(&self, id: Uuid) -> serverforge_controlplane::store::Result<Option<Deployment>> {
        self.inner.get_deployment(id).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> serverforge_controlplane::store::Result<()> {
        self.inner.update_deployment(deployment).await
    }

    async fn deployments(&self, site_id: Uuid) -> serverforge_controlplane::store::Result<Vec<Deployment>> {
        self.inner.deployments(site_id).await
    }
}

// ----------------------------------------------------------------------------
// Queue that only records
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<(Job, Duration)>>,
}

impl RecordingQueue {
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().iter().map(|(j, _)| j.clone()).collect()
    }

    pub fn take(&self) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap()
            .drain(..)
            .map(|(j, _)| j)
            .collect()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> serverforge_controlplane::Result<()> {
        self.jobs.lock().unwrap().push((job, delay));
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

pub fn test_config() -> LifecycleConfig {
    LifecycleConfig {
        poll_interval: Duration::from_secs(5),
        poll_attempts: 10,
        readiness: ReadinessPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 1.0,
            max_delay: Duration::from_secs(1),
        },
        ..LifecycleConfig::default()
    }
}

pub fn stack() -> StackSelection {
    StackSelection {
        php_version: PhpVersion::Php83,
        database: DatabaseKind::Mysql,
    }
}

/// Script output of a clean provisioning run
pub fn successful_script() -> Vec<String> {
    vec![
        "Starting provisioning".to_string(),
        "###STEP:1###".to_string(),
        "###DATA:ubuntu_version=24.04###".to_string(),
        "###STEP:2###".to_string(),
        "###STEP:3###".to_string(),
        "###STEP:4###".to_string(),
        "###STEP:5###".to_string(),
        "###STEP:6###".to_string(),
        "###STEP:7###".to_string(),
        "###DATA:local_public_key=ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKeyFromServer artisan@web###"
            .to_string(),
        "###STEP:8###".to_string(),
        "###STEP:9###".to_string(),
    ]
}

pub struct Harness {
    pub orchestrator: Arc<ServerLifecycleOrchestrator>,
    pub store: Arc<FlakyStore>,
    pub provider: FakeProvider,
    pub host: FakeHost,
    pub queue: Arc<RecordingQueue>,
    pub cipher: Arc<AesGcmCipher>,
    pub events: broadcast::Receiver<ServerEvent>,
    pub account: ProviderAccount,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_queue(None).await
    }

    /// Harness whose orchestrator enqueues onto `queue` instead of recording
    pub async fn with_queue(queue: Option<Arc<dyn JobQueue>>) -> Self {
        let store = Arc::new(FlakyStore::default());
        let provider = FakeProvider::new();
        let host = FakeHost::new();
        let recording = Arc::new(RecordingQueue::default());
        let cipher = Arc::new(
            AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap(),
        );
        let events = Arc::new(BroadcastEvents::new(1024));
        let receiver = events.subscribe();

        let driver = provider.clone();
        let registry = ProviderRegistry::empty().register(Vendor::Hetzner, move || {
            Box::new(driver.clone()) as Box<dyn CloudProvider>
        });

        let orchestrator = ServerLifecycleOrchestrator::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(FakeConnector::new(host.clone())),
            queue.unwrap_or_else(|| recording.clone() as Arc<dyn JobQueue>),
            events,
            cipher.clone(),
            test_config(),
        )
        .unwrap();

        let account = ProviderAccount {
            id: Uuid::new_v4(),
            owner_id: OWNER,
            vendor: Vendor::Hetzner,
            name: "main".to_string(),
            encrypted_token: cipher.encrypt(TOKEN).unwrap(),
            is_valid: true,
            validated_at: None,
            created_at: chrono::Utc::now(),
        };
        store.insert_account(account.clone()).await.unwrap();

        Self {
            orchestrator: Arc::new(orchestrator),
            store,
            provider,
            host,
            queue: recording,
            cipher,
            events: receiver,
            account,
        }
    }

    pub fn request(&self, name: &str) -> NewServer {
        NewServer {
            owner_id: OWNER,
            account_id: self.account.id,
            name: name.to_string(),
            size: "cx22".to_string(),
            region: "fsn1".to_string(),
            stack: stack(),
            ssh_port: None,
        }
    }

    pub async fn create(&self, name: &str) -> ServerRecord {
        self.orchestrator.create_server(self.request(name)).await.unwrap()
    }

    /// Run `job` and every successor it returns
    pub async fn run_chain(&self, job: Job) -> Result<(), LifecycleError> {
        let mut next = Some(job);
        while let Some(job) = next {
            next = self.orchestrator.handle(&job).await?;
        }
        Ok(())
    }

    /// Run the jobs queued so far
    pub async fn drain(&self) -> Vec<Result<(), LifecycleError>> {
        let mut results = Vec::new();
        for job in self.queue.take() {
            results.push(self.run_chain(job).await);
        }
        results
    }

    pub async fn server(&self, id: Uuid) -> Option<ServerRecord> {
        self.store.get_server(id).await.unwrap()
    }

    pub async fn secret(&self, server_id: Uuid, kind: CredentialKind) -> String {
        let credentials = self.store.credentials(server_id).await.unwrap();
        let sealed = credentials.iter().find(|c| c.kind == kind).unwrap();
        self.cipher.decrypt(&sealed.encrypted_value).unwrap()
    }

    /// Provisioned server that accepts its own key
    pub async fn active_server(&mut self, name: &str) -> ServerRecord {
        let server = self.create(name).await;
        self.host
            .authorize_key(self.secret(server.id, CredentialKind::PublicKey).await);
        self.host.script_output(successful_script(), 0);
        for result in self.drain().await {
            result.unwrap();
        }
        self.collect_events();
        self.server(server.id).await.unwrap()
    }

    pub fn site_request(&self, server_id: Uuid, domain: &str) -> NewSite {
        NewSite {
            server_id,
            domain: domain.to_string(),
            aliases: vec![format!("www.{}", domain)],
            directory: None,
            repository: Some("acme/shop".to_string()),
            repository_provider: RepositoryProvider::Github,
            branch: "main".to_string(),
            project_type: ProjectType::Laravel,
            php_version: None,
            deploy_script: None,
        }
    }

    pub async fn site(&self, id: Uuid) -> Option<SiteRecord> {
        self.store.get_site(id).await.unwrap()
    }

    pub fn collect_events(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
