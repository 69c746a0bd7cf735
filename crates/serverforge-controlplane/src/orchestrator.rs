//! Server lifecycle orchestration
//!
//! Request-path operations ([`create_server`], [`request_delete`], ...)
//! validate input, persist, and enqueue a job. Everything slow runs in the
//! job handlers, one job per server at a time:
//!
//! ```text
//! create_server ──▶ CreateAtProvider ──▶ InstallStack
//! request_delete ──▶ DeleteServer
//! ```
//!
//! Site hosting on active servers lives in [`sites`].
//!
//! Every persisted update goes through the record's revision, so a job whose
//! record was deleted or changed under it stops with
//! [`LifecycleError::Superseded`] instead of overwriting newer state.
//!
//! [`create_server`]: ServerLifecycleOrchestrator::create_server
//! [`request_delete`]: ServerLifecycleOrchestrator::request_delete

use crate::error::{LifecycleError, Result};
use crate::events::{EventSink, ServerEvent};
use crate::jobs::{Job, JobHandler, JobPolicy, JobQueue};
use crate::lifecycle::{Effect, LifecycleEvent, transition};
use crate::model::{
    ConnectionStatus, Credential, CredentialKind, ProviderAccount, ServerExtension, ServerRecord,
    ServerStatus,
};
use crate::registry::ProviderRegistry;
use crate::secrets::{SecretCipher, random_alphanumeric};
use crate::store::{ServerStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use serverforge_cloud::{CloudProvider, CreateServerRequest, Vendor};
use serverforge_config::Settings;
use serverforge_provision::markers::{DATA_LOCAL_PUBLIC_KEY, DATA_OS_VERSION};
use serverforge_provision::{
    DataMarker, ProvisioningParams, ProvisioningScriptBuilder, ProvisioningStep, ScriptLine,
    ServiceKind, SiteTemplates, StackSelection,
};
use serverforge_ssh::{
    ConnectionRetryCoordinator, KeyPairGenerator, ReadinessPolicy, RemoteShell, SshConnector,
    SshTarget, normalize_public_key, probe, shell_quote,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

mod sites;

pub use sites::NewSite;

/// Identity used for the first session on a fresh instance
pub const BOOTSTRAP_USER: &str = "root";

const PASSWORD_LENGTH: usize = 32;
const KEY_NAME_SUFFIX_LENGTH: usize = 8;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub server_user: String,
    pub ssh_port: u16,
    /// Gap between instance status polls
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub readiness: ReadinessPolicy,
    pub script_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for LifecycleConfig {
    fn from(settings: &Settings) -> Self {
        let p = &settings.provisioning;
        Self {
            server_user: settings.server.user.clone(),
            ssh_port: settings.server.ssh_port,
            poll_interval: Duration::from_secs(p.poll_interval_secs),
            poll_attempts: p.poll_attempts,
            readiness: ReadinessPolicy {
                max_attempts: p.ssh_max_attempts,
                initial_delay: Duration::from_secs(p.ssh_initial_delay_secs),
                max_delay: Duration::from_secs(p.ssh_max_delay_secs),
                ..ReadinessPolicy::default()
            },
            script_timeout: Duration::from_secs(p.script_timeout_secs),
            command_timeout: Duration::from_secs(p.command_timeout_secs),
        }
    }
}

/// A request to create and provision a server
#[derive(Debug, Clone)]
pub struct NewServer {
    pub owner_id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub size: String,
    pub region: String,
    pub stack: StackSelection,
    /// Defaults to the configured port
    pub ssh_port: Option<u16>,
}

pub struct ServerLifecycleOrchestrator {
    store: Arc<dyn ServerStore>,
    registry: Arc<ProviderRegistry>,
    connector: Arc<dyn SshConnector>,
    queue: Arc<dyn JobQueue>,
    events: Arc<dyn EventSink>,
    cipher: Arc<dyn SecretCipher>,
    scripts: ProvisioningScriptBuilder,
    site_templates: SiteTemplates,
    config: LifecycleConfig,
}

impl ServerLifecycleOrchestrator {
    pub fn new(
        store: Arc<dyn ServerStore>,
        registry: Arc<ProviderRegistry>,
        connector: Arc<dyn SshConnector>,
        queue: Arc<dyn JobQueue>,
        events: Arc<dyn EventSink>,
        cipher: Arc<dyn SecretCipher>,
        config: LifecycleConfig,
    ) -> Result<Self> {
        Ok(Self {
            store,
            registry,
            connector,
            queue,
            events,
            cipher,
            scripts: ProvisioningScriptBuilder::new()?,
            site_templates: SiteTemplates::new()?,
            config,
        })
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Validate a token with the vendor and store the account
    pub async fn add_account(
        &self,
        owner_id: Uuid,
        vendor: Vendor,
        name: &str,
        api_token: &str,
    ) -> Result<ProviderAccount> {
        if name.trim().is_empty() {
            return Err(LifecycleError::InvalidRequest(
                "account name must not be empty".to_string(),
            ));
        }
        // unsupported vendors fail here, before the token leaves the process
        let driver = self.registry.driver(vendor)?;

        let provider = self.registry.for_token(vendor, api_token)?;
        if !provider.validate_credentials().await {
            warn!(vendor = driver.display_name(), "API token rejected");
            return Err(LifecycleError::InvalidCredentials(vendor));
        }

        let now = Utc::now();
        let account = ProviderAccount {
            id: Uuid::new_v4(),
            owner_id,
            vendor,
            name: name.trim().to_string(),
            encrypted_token: self.cipher.encrypt(api_token)?,
            is_valid: true,
            validated_at: Some(now),
            created_at: now,
        };
        self.store.insert_account(account.clone()).await?;

        info!(account_id = %account.id, vendor = %vendor, "Provider account added");
        Ok(account)
    }

    pub async fn request_account_validation(&self, account_id: Uuid) -> Result<()> {
        self.load_account(account_id).await?;
        self.queue
            .enqueue(Job::ValidateAccount { account_id }, Duration::ZERO)
            .await
    }

    /// Provider for an account, with its token injected
    pub async fn provider_for(&self, account_id: Uuid) -> Result<Box<dyn CloudProvider>> {
        let account = self.load_account(account_id).await?;
        self.registry.for_account(&account, self.cipher.as_ref())
    }

    #[instrument(skip(self))]
    async fn validate_account(&self, account_id: Uuid) -> Result<Option<Job>> {
        let mut account = self.load_account(account_id).await?;
        let provider = self
            .registry
            .for_account(&account, self.cipher.as_ref())?;

        let valid = provider.validate_credentials().await;
        account.is_valid = valid;
        if valid {
            account.validated_at = Some(Utc::now());
        }
        self.store.update_account(&account).await?;

        info!(account_id = %account.id, vendor = %account.vendor, valid, "Account validated");
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Register a key with the vendor, persist the server with its
    /// credentials, and start the creation chain.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_server(&self, request: NewServer) -> Result<ServerRecord> {
        validate_server_name(&request.name)?;

        let account = self.load_account(request.account_id).await?;
        if account.owner_id != request.owner_id {
            return Err(LifecycleError::Forbidden(account.id));
        }

        let provider = self
            .registry
            .for_account(&account, self.cipher.as_ref())?;
        if !provider.validate_credentials().await {
            return Err(LifecycleError::InvalidCredentials(account.vendor));
        }

        let keypair = KeyPairGenerator::with_comment(format!("serverforge-{}", request.name))
            .generate()?;
        let key_name = format!(
            "serverforge-{}-{}",
            request.name,
            random_alphanumeric(KEY_NAME_SUFFIX_LENGTH)
        );
        let key_id = provider.create_ssh_key(&key_name, &keypair.public_key).await?;
        info!(vendor = %account.vendor, key_id = %key_id, "Registered SSH key with provider");

        let now = Utc::now();
        let server = ServerRecord {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            account_id: account.id,
            vendor: account.vendor,
            provider_id: None,
            name: request.name.clone(),
            size: request.size.clone(),
            region: request.region.clone(),
            ip_address: None,
            private_ip_address: None,
            status: ServerStatus::Pending,
            provisioning_step: ProvisioningStep::Pending,
            stack: request.stack,
            ssh_port: request.ssh_port.unwrap_or(self.config.ssh_port),
            server_user: self.config.server_user.clone(),
            os_version: None,
            local_public_key: None,
            connection_status: ConnectionStatus::Unknown,
            extension: ServerExtension {
                provider_ssh_key_id: Some(key_id.clone()),
                ..ServerExtension::default()
            },
            revision: 0,
            created_at: now,
            updated_at: now,
            provisioned_at: None,
            last_ssh_connection_at: None,
        };

        let stored = match self.persist_new_server(server, &keypair.private_key, &keypair.public_key).await {
            Ok(stored) => stored,
            Err(e) => {
                if let Err(cleanup) = provider.delete_ssh_key(&key_id).await {
                    warn!(key_id = %key_id, error = %cleanup, "Failed to remove provider SSH key after failed create");
                }
                return Err(e);
            }
        };

        self.queue
            .enqueue(Job::CreateAtProvider { server_id: stored.id }, Duration::ZERO)
            .await?;

        info!(server_id = %stored.id, vendor = %stored.vendor, "Server accepted");
        Ok(stored)
    }

    async fn persist_new_server(
        &self,
        server: ServerRecord,
        private_key: &str,
        public_key: &str,
    ) -> Result<ServerRecord> {
        let secrets = [
            (CredentialKind::PrivateKey, private_key.to_string()),
            (CredentialKind::PublicKey, public_key.to_string()),
            (CredentialKind::SudoPassword, random_alphanumeric(PASSWORD_LENGTH)),
            (CredentialKind::DatabasePassword, random_alphanumeric(PASSWORD_LENGTH)),
        ];

        let mut credentials = Vec::with_capacity(secrets.len());
        for (kind, value) in secrets {
            credentials.push(Credential::new(server.id, kind, self.cipher.encrypt(&value)?));
        }

        Ok(self.store.insert_server(server, credentials).await?)
    }

    #[instrument(skip(self))]
    async fn create_at_provider(&self, server_id: Uuid) -> Result<Option<Job>> {
        let server = self.load_for_job(server_id).await?;
        let (mut server, _) = self.advance(server, LifecycleEvent::StartCreating).await?;

        let account = self.load_account(server.account_id).await?;
        let provider = self
            .registry
            .for_account(&account, self.cipher.as_ref())?;
        let ssh_key_id = server
            .extension
            .provider_ssh_key_id
            .clone()
            .ok_or(LifecycleError::MissingProviderKey(server.id))?;

        let created = provider
            .create_server(&CreateServerRequest {
                name: server.name.clone(),
                size: server.size.clone(),
                region: server.region.clone(),
                ssh_key_id,
            })
            .await?;
        info!(server_id = %server.id, provider_id = %created.id, "Instance created at provider");

        // The record may have been deleted or moved to Deleting while the
        // vendor call was in flight; then nothing else knows this instance.
        server.provider_id = Some(created.id.clone());
        let mut server = match self.persist(&server).await {
            Ok(server) => server,
            Err(e) => {
                self.release_orphan(provider.as_ref(), server.id, &created.id).await;
                return Err(e);
            }
        };

        for attempt in 1..=self.config.poll_attempts {
            self.ensure_current(&server).await?;

            match provider.get_server_status(&created.id).await {
                Ok(status) if status.is_reachable() => {
                    info!(server_id = %server.id, attempt, ip = ?status.ip, "Instance is reachable");
                    server.ip_address = status.ip;
                    server.private_ip_address = status.private_ip;
                    let (_, effects) = self.advance(server, LifecycleEvent::InstanceReachable).await?;
                    return Ok(effects
                        .contains(&Effect::EnqueueInstallStack)
                        .then_some(Job::InstallStack { server_id }));
                }
                Ok(status) => {
                    debug!(server_id = %server.id, attempt, status = %status.status, "Instance not ready yet");
                }
                Err(e) if e.is_transient() => {
                    warn!(server_id = %server.id, attempt, error = %e, "Instance status poll failed");
                }
                Err(e) => return Err(e.into()),
            }

            if attempt < self.config.poll_attempts {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        Err(LifecycleError::Timeout(format!(
            "instance {} did not become active with a public IP after {} polls",
            created.id, self.config.poll_attempts
        )))
    }

    /// Best-effort delete of an instance no record points at
    async fn release_orphan(&self, provider: &dyn CloudProvider, server_id: Uuid, provider_id: &str) {
        match provider.delete_server(provider_id).await {
            Ok(()) => info!(server_id = %server_id, provider_id, "Deleted instance created for a superseded record"),
            Err(e) => error!(server_id = %server_id, provider_id, error = %e, "Instance left behind at provider; delete it manually"),
        }
    }

    // ------------------------------------------------------------------
    // Provision
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    async fn install_stack(&self, server_id: Uuid) -> Result<Option<Job>> {
        let server = self.load_for_job(server_id).await?;
        let (server, _) = self
            .advance(server, LifecycleEvent::ProvisioningStarted)
            .await?;

        let target = self.ssh_target(&server).await?;
        let coordinator =
            ConnectionRetryCoordinator::new(self.connector.clone(), self.config.readiness.clone());
        if !coordinator.wait_for_ready(&target, BOOTSTRAP_USER).await {
            return Err(LifecycleError::Timeout(format!(
                "SSH on {} did not become ready after {} attempts",
                target.host, self.config.readiness.max_attempts
            )));
        }
        self.ensure_current(&server).await?;

        let shell = self.connector.connect(&target, BOOTSTRAP_USER).await?;
        let outcome = self.provision_over(&server, shell.as_ref()).await;
        shell.disconnect().await;
        let server = outcome?;

        info!(server_id = %server.id, os_version = ?server.os_version, "Server provisioned");
        Ok(None)
    }

    async fn provision_over(&self, server: &ServerRecord, shell: &dyn RemoteShell) -> Result<ServerRecord> {
        let mut server = server.clone();
        server.last_ssh_connection_at = Some(Utc::now());
        let server = self.persist(&server).await?;

        let params = ProvisioningParams {
            stack: server.stack,
            server_user: server.server_user.clone(),
            ssh_port: server.ssh_port,
            sudo_password: self.credential(server.id, CredentialKind::SudoPassword).await?,
            database_password: self
                .credential(server.id, CredentialKind::DatabasePassword)
                .await?,
        };
        let script = self.scripts.build(&params)?;

        let path = format!("/root/serverforge-provision-{}.sh", server.id);
        shell.upload(script.as_bytes(), &path).await?;
        shell
            .exec(&format!("chmod +x {}", shell_quote(&path)), self.config.command_timeout)
            .await?;

        let (exit_code, mut server) = self.run_script(server, shell, &path).await?;
        if exit_code != 0 {
            error!(server_id = %server.id, exit_code, step = ?server.provisioning_step, "Provisioning script failed");
            return Err(LifecycleError::ScriptFailed(exit_code));
        }

        if let Err(e) = shell
            .exec(&format!("rm -f {}", shell_quote(&path)), self.config.command_timeout)
            .await
        {
            warn!(server_id = %server.id, error = %e, "Failed to remove provisioning script");
        }

        server.connection_status = ConnectionStatus::Successful;
        server.extension.services = server.stack.services();
        let (server, _) = self.advance(server, LifecycleEvent::Completed).await?;
        Ok(server)
    }

    /// Stream the script, applying markers as they arrive
    async fn run_script(
        &self,
        server: ServerRecord,
        shell: &dyn RemoteShell,
        path: &str,
    ) -> Result<(i32, ServerRecord)> {
        let server_id = server.id;
        let (tx, mut rx) = mpsc::unbounded_channel::<ScriptLine>();
        let command = format!("bash {}", shell_quote(path));
        let timeout = self.config.script_timeout;

        let stream = async move {
            let mut on_line = |line: &str| {
                debug!(server_id = %server_id, "{}", line);
                if let Some(parsed) = ScriptLine::parse(line) {
                    // receiver only goes away when applying failed
                    let _ = tx.send(parsed);
                }
            };
            let exit_code = shell.exec_streaming(&command, timeout, &mut on_line).await?;
            Ok::<i32, LifecycleError>(exit_code)
        };

        let apply = async move {
            let mut server = server;
            while let Some(line) = rx.recv().await {
                server = self.apply_script_line(server, line).await?;
            }
            Ok::<ServerRecord, LifecycleError>(server)
        };

        futures_util::future::try_join(stream, apply).await
    }

    async fn apply_script_line(&self, mut server: ServerRecord, line: ScriptLine) -> Result<ServerRecord> {
        match line {
            ScriptLine::Step(code) => match ProvisioningStep::from_code(code) {
                Some(step) => {
                    let (server, effects) = self.advance(server, LifecycleEvent::StepReached(step)).await?;
                    if effects.is_empty() {
                        debug!(server_id = %server.id, code, "Ignoring step marker that does not advance");
                    } else {
                        info!(server_id = %server.id, step = ?step, "{}", step.label());
                    }
                    Ok(server)
                }
                None => {
                    warn!(server_id = %server.id, code, "Unknown step marker");
                    Ok(server)
                }
            },
            ScriptLine::Data(DataMarker { key, value }) => {
                match key.as_str() {
                    DATA_OS_VERSION => server.os_version = Some(value),
                    DATA_LOCAL_PUBLIC_KEY => server.local_public_key = Some(value),
                    _ => warn!(server_id = %server.id, key = %key, "Unknown data marker"),
                }
                Ok(server)
            }
        }
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Move the server to Deleting and queue the teardown
    pub async fn request_delete(&self, server_id: Uuid) -> Result<()> {
        let server = self.load_server(server_id).await?;
        if server.status != ServerStatus::Deleting {
            self.advance(server, LifecycleEvent::DeleteRequested).await?;
        }
        self.queue
            .enqueue(Job::DeleteServer { server_id }, Duration::ZERO)
            .await
    }

    #[instrument(skip(self))]
    async fn delete_server(&self, server_id: Uuid) -> Result<Option<Job>> {
        let Some(mut server) = self.store.get_server(server_id).await? else {
            info!(server_id = %server_id, "Server already removed");
            return Ok(None);
        };
        if server.status != ServerStatus::Deleting {
            server = self.advance(server, LifecycleEvent::DeleteRequested).await?.0;
        }

        self.teardown_at_provider(&server).await;

        if let Err(e) = self.store.delete_server(server.id).await {
            error!(server_id = %server.id, error = %e, "Failed to remove server record");
            if let Ok(Some(current)) = self.store.get_server(server.id).await
                && let Err(mark) = self.advance(current, LifecycleEvent::DeletionFailed).await
            {
                warn!(server_id = %server.id, error = %mark, "Could not mark server as failed");
            }
            return Err(e.into());
        }

        info!(server_id = %server.id, "Server deleted");
        Ok(None)
    }

    /// Best effort; failures are logged only
    async fn teardown_at_provider(&self, server: &ServerRecord) {
        let provider = match self.load_account(server.account_id).await.and_then(|account| {
            self.registry
                .for_account(&account, self.cipher.as_ref())
        }) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(server_id = %server.id, error = %e, "Skipping provider teardown");
                return;
            }
        };

        if let Some(provider_id) = &server.provider_id {
            match provider.delete_server(provider_id).await {
                Ok(()) => info!(server_id = %server.id, provider_id = %provider_id, "Instance deleted at provider"),
                Err(e) => warn!(server_id = %server.id, provider_id = %provider_id, error = %e, "Failed to delete instance at provider"),
            }
        }

        if let Some(key_id) = &server.extension.provider_ssh_key_id
            && let Err(e) = provider.delete_ssh_key(key_id).await
        {
            warn!(server_id = %server.id, key_id = %key_id, error = %e, "Failed to delete SSH key at provider");
        }
    }

    // ------------------------------------------------------------------
    // Operations on active servers
    // ------------------------------------------------------------------

    pub async fn request_restart(&self, server_id: Uuid, service: ServiceKind) -> Result<()> {
        let server = self.load_active(server_id).await?;
        ensure_installed(&server, service)?;
        self.queue
            .enqueue(Job::RestartService { server_id, service }, Duration::ZERO)
            .await
    }

    pub async fn request_authorize_key(&self, server_id: Uuid, public_key: &str) -> Result<()> {
        let public_key = normalize_public_key(public_key)?;
        self.load_active(server_id).await?;
        self.queue
            .enqueue(Job::SyncAuthorizedKey { server_id, public_key }, Duration::ZERO)
            .await
    }

    pub async fn request_revoke_key(&self, server_id: Uuid, public_key: &str) -> Result<()> {
        let public_key = normalize_public_key(public_key)?;
        self.load_active(server_id).await?;
        self.queue
            .enqueue(Job::RevokeAuthorizedKey { server_id, public_key }, Duration::ZERO)
            .await
    }

    #[instrument(skip(self))]
    async fn restart_service(&self, server_id: Uuid, service: ServiceKind) -> Result<Option<Job>> {
        let server = self.load_active(server_id).await?;
        ensure_installed(&server, service)?;

        let command = service.restart_command(server.stack.php_version);
        self.run_as_server_user(&server, &command, true).await?;

        info!(server_id = %server.id, service = %service, "Service restarted");
        Ok(None)
    }

    #[instrument(skip(self, public_key))]
    async fn sync_authorized_key(&self, server_id: Uuid, public_key: &str) -> Result<Option<Job>> {
        let key = shell_quote(&normalize_public_key(public_key)?);
        let server = self.load_active(server_id).await?;

        let command = format!(
            "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys && \
             chmod 600 ~/.ssh/authorized_keys && \
             (grep -qxF {key} ~/.ssh/authorized_keys || echo {key} >> ~/.ssh/authorized_keys)"
        );
        self.run_as_server_user(&server, &command, false).await?;

        info!(server_id = %server.id, "Authorized key synced");
        Ok(None)
    }

    #[instrument(skip(self, public_key))]
    async fn revoke_authorized_key(&self, server_id: Uuid, public_key: &str) -> Result<Option<Job>> {
        let key = shell_quote(&normalize_public_key(public_key)?);
        let server = self.load_active(server_id).await?;

        let command = format!(
            "touch ~/.ssh/authorized_keys && \
             {{ grep -vxF {key} ~/.ssh/authorized_keys || true; }} > ~/.ssh/authorized_keys.tmp && \
             mv ~/.ssh/authorized_keys.tmp ~/.ssh/authorized_keys && \
             chmod 600 ~/.ssh/authorized_keys"
        );
        self.run_as_server_user(&server, &command, false).await?;

        info!(server_id = %server.id, "Authorized key revoked");
        Ok(None)
    }

    /// Probe SSH as the operational user and record the result
    pub async fn test_connection(&self, server_id: Uuid) -> Result<ConnectionStatus> {
        let mut server = self.load_server(server_id).await?;
        let target = self.ssh_target(&server).await?;

        let status = match probe(self.connector.as_ref(), &target, &server.server_user).await {
            Ok(true) => ConnectionStatus::Successful,
            Ok(false) => ConnectionStatus::Failed,
            Err(e) => {
                warn!(server_id = %server.id, error = %e, "Connection test failed");
                ConnectionStatus::Failed
            }
        };

        server.connection_status = status;
        if status == ConnectionStatus::Successful {
            server.last_ssh_connection_at = Some(Utc::now());
        }
        self.persist(&server).await?;
        self.events.publish(ServerEvent::ConnectionChecked { server_id, status });
        Ok(status)
    }

    async fn run_as_server_user(&self, server: &ServerRecord, command: &str, privileged: bool) -> Result<()> {
        let shell = self.open_operational(server).await?;
        let timeout = self.config.command_timeout;
        let outcome = if privileged {
            shell.sudo(command, timeout).await
        } else {
            shell.exec(command, timeout).await
        };
        shell.disconnect().await;
        outcome?;

        self.stamp_ssh_connection(server.id).await;
        Ok(())
    }

    /// Session as the operational user
    async fn open_operational(&self, server: &ServerRecord) -> Result<Box<dyn RemoteShell>> {
        let target = self.ssh_target(server).await?;
        Ok(self.connector.connect(&target, &server.server_user).await?)
    }

    async fn stamp_ssh_connection(&self, server_id: Uuid) {
        let mut server = match self.store.get_server(server_id).await {
            Ok(Some(server)) => server,
            _ => return,
        };
        server.last_ssh_connection_at = Some(Utc::now());
        if let Err(e) = self.persist(&server).await {
            debug!(server_id = %server_id, error = %e, "Could not stamp last SSH connection");
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Apply a lifecycle event, persist, and publish its notifications
    async fn advance(
        &self,
        mut server: ServerRecord,
        event: LifecycleEvent,
    ) -> Result<(ServerRecord, Vec<Effect>)> {
        let next = transition(server.lifecycle_state(), event)?;
        if next.is_noop() {
            return Ok((server, next.effects));
        }

        server.set_lifecycle_state(next.state);
        if next.effects.contains(&Effect::StampProvisioned) {
            server.provisioned_at = Some(Utc::now());
        }
        let server = self.persist(&server).await?;

        for effect in &next.effects {
            match *effect {
                Effect::StatusChanged { previous, current } => {
                    info!(server_id = %server.id, from = %previous, to = %current, "Server status changed");
                    self.events.publish(ServerEvent::StatusChanged {
                        server_id: server.id,
                        previous,
                        current,
                    });
                }
                Effect::StepChanged(step) => self.events.publish(ServerEvent::StepChanged {
                    server_id: server.id,
                    step,
                }),
                Effect::EnqueueInstallStack | Effect::EnqueueDelete | Effect::StampProvisioned => {}
            }
        }

        Ok((server, next.effects))
    }

    /// Compare-and-swap write; a lost race means the job was superseded
    async fn persist(&self, server: &ServerRecord) -> Result<ServerRecord> {
        match self.store.update_server(server).await {
            Ok(stored) => Ok(stored),
            Err(StoreError::Conflict { .. } | StoreError::NotFound(_)) => {
                info!(server_id = %server.id, "Server record changed under a running job");
                Err(LifecycleError::Superseded(server.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fail with `Superseded` unless the stored record is still the one this job wrote last
    async fn ensure_current(&self, server: &ServerRecord) -> Result<()> {
        match self.store.get_server(server.id).await? {
            Some(current)
                if current.revision == server.revision
                    && current.status != ServerStatus::Deleting =>
            {
                Ok(())
            }
            _ => Err(LifecycleError::Superseded(server.id)),
        }
    }

    /// Load a server a lifecycle job is about to work on
    async fn load_for_job(&self, server_id: Uuid) -> Result<ServerRecord> {
        match self.store.get_server(server_id).await? {
            Some(server) if server.status != ServerStatus::Deleting => Ok(server),
            _ => Err(LifecycleError::Superseded(server_id)),
        }
    }

    async fn load_server(&self, server_id: Uuid) -> Result<ServerRecord> {
        self.store
            .get_server(server_id)
            .await?
            .ok_or(LifecycleError::ServerNotFound(server_id))
    }

    async fn load_active(&self, server_id: Uuid) -> Result<ServerRecord> {
        let server = self.load_server(server_id).await?;
        if server.status != ServerStatus::Active {
            return Err(LifecycleError::InvalidRequest(format!(
                "server {} is {}, not active",
                server.name, server.status
            )));
        }
        Ok(server)
    }

    async fn load_account(&self, account_id: Uuid) -> Result<ProviderAccount> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or(LifecycleError::AccountNotFound(account_id))
    }

    async fn credential(&self, server_id: Uuid, kind: CredentialKind) -> Result<String> {
        let credentials = self.store.credentials(server_id).await?;
        let sealed = credentials
            .iter()
            .filter(|c| c.kind == kind)
            .max_by_key(|c| c.created_at)
            .ok_or(LifecycleError::MissingCredential { server_id, kind })?;
        Ok(self.cipher.decrypt(&sealed.encrypted_value)?)
    }

    async fn ssh_target(&self, server: &ServerRecord) -> Result<SshTarget> {
        let host = server
            .ip_address
            .clone()
            .ok_or(LifecycleError::MissingAddress(server.id))?;
        let private_key = self.credential(server.id, CredentialKind::PrivateKey).await?;
        Ok(SshTarget::new(host, private_key).with_port(server.ssh_port))
    }

    /// Put a server whose creation or provisioning failed into Error
    async fn fail_server(&self, server_id: Uuid, cause: &LifecycleError) {
        let server = match self.store.get_server(server_id).await {
            Ok(Some(server)) if server.status.is_in_progress() => server,
            Ok(_) => return,
            Err(e) => {
                error!(server_id = %server_id, error = %e, "Could not load server to mark it failed");
                return;
            }
        };

        error!(server_id = %server_id, status = %server.status, step = ?server.provisioning_step, error = %cause, "Server failed");
        if let Err(e) = self.advance(server, LifecycleEvent::Failed).await {
            warn!(server_id = %server_id, error = %e, "Could not mark server as failed");
        }
    }
}

#[async_trait]
impl JobHandler for ServerLifecycleOrchestrator {
    async fn handle(&self, job: &Job) -> Result<Option<Job>> {
        let result = match job {
            Job::CreateAtProvider { server_id } => self.create_at_provider(*server_id).await,
            Job::InstallStack { server_id } => self.install_stack(*server_id).await,
            Job::DeleteServer { server_id } => self.delete_server(*server_id).await,
            Job::ValidateAccount { account_id } => self.validate_account(*account_id).await,
            Job::RestartService { server_id, service } => {
                self.restart_service(*server_id, *service).await
            }
            Job::SyncAuthorizedKey {
                server_id,
                public_key,
            } => self.sync_authorized_key(*server_id, public_key).await,
            Job::RevokeAuthorizedKey {
                server_id,
                public_key,
            } => self.revoke_authorized_key(*server_id, public_key).await,
            Job::CreateSite { server_id, site_id } => {
                self.create_site_job(*server_id, *site_id).await
            }
            Job::DeleteSite { server_id, site_id } => {
                self.delete_site_job(*server_id, *site_id).await
            }
            Job::SyncEnvironment { server_id, site_id } => {
                self.sync_environment_job(*server_id, *site_id).await
            }
            Job::DeploySite {
                server_id,
                site_id,
                deployment_id,
            } => {
                self.deploy_site_job(*server_id, *site_id, *deployment_id)
                    .await
            }
        };

        if let Err(e) = &result
            && !e.is_superseded()
        {
            match job {
                Job::CreateAtProvider { server_id } | Job::InstallStack { server_id } => {
                    self.fail_server(*server_id, e).await
                }
                Job::CreateSite { site_id, .. } => self.fail_site(*site_id, e).await,
                _ => {}
            }
        }
        result
    }

    async fn on_exhausted(&self, job: &Job, error: &LifecycleError) {
        match job {
            Job::CreateAtProvider { server_id } | Job::InstallStack { server_id } => {
                self.fail_server(*server_id, error).await
            }
            Job::CreateSite { site_id, .. } => self.fail_site(*site_id, error).await,
            Job::DeploySite {
                site_id,
                deployment_id,
                ..
            } => self.fail_deployment(*site_id, *deployment_id, error).await,
            _ => error!(job = job.name(), server_id = ?job.server_id(), error = %error, "Job needs operator attention"),
        }
    }

    fn policy(&self, job: &Job) -> JobPolicy {
        job.policy(self.config.script_timeout)
    }
}

/// Server names become hostnames and vendor labels
fn validate_server_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::InvalidRequest(format!(
            "invalid server name '{}': use lowercase letters, digits and '-'",
            name
        )))
    }
}

fn ensure_installed(server: &ServerRecord, service: ServiceKind) -> Result<()> {
    if server.extension.services.contains(&service) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidRequest(format!(
            "{} is not installed on {}",
            service.label(),
            server.name
        )))
    }
}
