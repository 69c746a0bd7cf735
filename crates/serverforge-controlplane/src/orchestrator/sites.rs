//! Sites hosted on active servers
//!
//! ```text
//! create_site ──▶ CreateSite ──▶ SyncEnvironment (when variables exist)
//! set_environment ──▶ SyncEnvironment
//! request_deploy ──▶ DeploySite
//! request_site_delete ──▶ DeleteSite
//! ```
//!
//! All remote work runs as the operational user; nginx changes go through
//! `sudo`.

use super::ServerLifecycleOrchestrator;
use crate::error::{LifecycleError, Result};
use crate::events::ServerEvent;
use crate::jobs::Job;
use crate::model::{
    Deployment, DeploymentStatus, EnvironmentVariable, ServerRecord, SiteRecord, SiteStatus,
};
use crate::store::StoreError;
use chrono::Utc;
use serverforge_provision::site::{
    PLACEHOLDER_HTML, PLACEHOLDER_PHP, validate_branch, validate_directory, validate_domain,
    validate_env_key, validate_env_value, validate_repository,
};
use serverforge_provision::{
    DeployParams, PhpVersion, ProjectType, RepositoryProvider, VirtualHost, env_file,
};
use serverforge_ssh::{RemoteShell, shell_quote};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Stays inside the CreateSite job budget
const CLONE_TIMEOUT: Duration = Duration::from_secs(270);
/// Stays inside the DeploySite job budget
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(840);

const NGINX_AVAILABLE: &str = "/etc/nginx/sites-available";
const NGINX_ENABLED: &str = "/etc/nginx/sites-enabled";

/// A request to host a site on a server
#[derive(Debug, Clone)]
pub struct NewSite {
    pub server_id: Uuid,
    pub domain: String,
    pub aliases: Vec<String>,
    /// Defaults to the project type's public directory
    pub directory: Option<String>,
    pub repository: Option<String>,
    pub repository_provider: RepositoryProvider,
    pub branch: String,
    pub project_type: ProjectType,
    /// Must match the server's PHP version when given
    pub php_version: Option<PhpVersion>,
    /// Defaults to the project type's deploy script
    pub deploy_script: Option<String>,
}

/// Exit status and commit of one deploy script run
struct DeployRun {
    exit_code: i32,
    commit_hash: Option<String>,
}

impl ServerLifecycleOrchestrator {
    // ------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------

    #[instrument(skip(self, request), fields(domain = %request.domain))]
    pub async fn create_site(&self, request: NewSite) -> Result<SiteRecord> {
        let domain = request.domain.trim().to_ascii_lowercase();
        validate_domain(&domain)?;
        let mut aliases = Vec::with_capacity(request.aliases.len());
        for alias in &request.aliases {
            let alias = alias.trim().to_ascii_lowercase();
            validate_domain(&alias)?;
            if alias != domain && !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }

        let directory = request
            .directory
            .unwrap_or_else(|| request.project_type.default_directory().to_string());
        validate_directory(&directory)?;
        validate_branch(&request.branch)?;
        let repository = request
            .repository
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        if let Some(repository) = &repository {
            validate_repository(request.repository_provider, repository)?;
        }

        let server = self.load_active(request.server_id).await?;
        let php_version = request.php_version.unwrap_or(server.stack.php_version);
        if php_version != server.stack.php_version {
            return Err(LifecycleError::InvalidRequest(format!(
                "{} runs PHP {}, not {}",
                server.name, server.stack.php_version, php_version
            )));
        }

        let existing = self.store.list_sites(server.id).await?;
        let taken = |name: &String| {
            existing
                .iter()
                .any(|site| &site.domain == name || site.aliases.contains(name))
        };
        if let Some(name) = std::iter::once(&domain).chain(aliases.iter()).find(|n| taken(*n)) {
            return Err(LifecycleError::InvalidRequest(format!(
                "{} is already hosted on {}",
                name, server.name
            )));
        }

        let now = Utc::now();
        let site = SiteRecord {
            id: Uuid::new_v4(),
            server_id: server.id,
            domain,
            aliases,
            directory,
            repository,
            repository_provider: request.repository_provider,
            branch: request.branch,
            project_type: request.project_type,
            php_version,
            status: SiteStatus::Pending,
            deploy_script: request
                .deploy_script
                .unwrap_or_else(|| request.project_type.default_deploy_script().to_string()),
            created_at: now,
            updated_at: now,
            deployment_started_at: None,
            deployment_finished_at: None,
        };
        self.store.insert_site(site.clone()).await?;
        self.queue
            .enqueue(
                Job::CreateSite {
                    server_id: server.id,
                    site_id: site.id,
                },
                Duration::ZERO,
            )
            .await?;

        info!(site_id = %site.id, server_id = %server.id, "Site accepted");
        Ok(site)
    }

    pub async fn request_site_delete(&self, site_id: Uuid) -> Result<()> {
        let site = self.load_site(site_id).await?;
        self.queue
            .enqueue(
                Job::DeleteSite {
                    server_id: site.server_id,
                    site_id,
                },
                Duration::ZERO,
            )
            .await
    }

    /// Replace a site's environment and write it to the server
    pub async fn set_environment(&self, site_id: Uuid, variables: Vec<(String, String)>) -> Result<()> {
        let mut seen = HashSet::new();
        let mut sealed = Vec::with_capacity(variables.len());
        for (key, value) in variables {
            validate_env_key(&key)?;
            validate_env_value(&key, &value)?;
            if !seen.insert(key.clone()) {
                return Err(LifecycleError::InvalidRequest(format!(
                    "environment key {} is set twice",
                    key
                )));
            }
            sealed.push(EnvironmentVariable {
                encrypted_value: self.cipher.encrypt(&value)?,
                key,
            });
        }

        self.load_site(site_id).await?;
        let count = sealed.len();
        self.store
            .set_environment(site_id, sealed)
            .await
            .map_err(|e| site_store_error(e, site_id))?;

        // Read the status after writing: a CreateSite job still running
        // picks the variables up when it finishes.
        let site = self.load_site(site_id).await?;
        if matches!(site.status, SiteStatus::Pending | SiteStatus::Installing) {
            debug!(site_id = %site_id, "Site not installed yet, environment follows creation");
        } else {
            self.queue
                .enqueue(
                    Job::SyncEnvironment {
                        server_id: site.server_id,
                        site_id,
                    },
                    Duration::ZERO,
                )
                .await?;
        }

        info!(site_id = %site_id, variables = count, "Environment updated");
        Ok(())
    }

    /// Record a deployment and queue its run
    pub async fn request_deploy(&self, site_id: Uuid, triggered_by: &str) -> Result<Deployment> {
        let site = self.load_site(site_id).await?;
        if site.repository.is_none() {
            return Err(LifecycleError::InvalidRequest(format!(
                "{} has no repository to deploy",
                site.domain
            )));
        }
        if site.status != SiteStatus::Deployed {
            return Err(LifecycleError::InvalidRequest(format!(
                "{} is {}, not deployed",
                site.domain, site.status
            )));
        }
        self.load_active(site.server_id).await?;

        let deployment = Deployment::new(site.id, triggered_by);
        self.store
            .insert_deployment(deployment.clone())
            .await
            .map_err(|e| site_store_error(e, site_id))?;
        // A second request now sees the site busy
        self.set_site_status(site.clone(), SiteStatus::Deploying)
            .await?;

        self.queue
            .enqueue(
                Job::DeploySite {
                    server_id: site.server_id,
                    site_id,
                    deployment_id: deployment.id,
                },
                Duration::ZERO,
            )
            .await?;

        info!(site_id = %site_id, deployment_id = %deployment.id, "Deployment queued");
        Ok(deployment)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub(super) async fn create_site_job(&self, server_id: Uuid, site_id: Uuid) -> Result<Option<Job>> {
        let site = self.load_site_for_job(site_id).await?;
        let server = self.load_active(server_id).await?;
        let site = self.set_site_status(site, SiteStatus::Installing).await?;

        let shell = self.open_operational(&server).await?;
        let outcome = self.install_site(&server, &site, shell.as_ref()).await;
        shell.disconnect().await;
        self.stamp_ssh_connection(server.id).await;
        outcome?;

        let site = self.set_site_status(site, SiteStatus::Deployed).await?;
        info!(site_id = %site.id, domain = %site.domain, "Site created");

        if self.store.environment(site.id).await?.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Job::SyncEnvironment { server_id, site_id }))
        }
    }

    async fn install_site(&self, server: &ServerRecord, site: &SiteRecord, shell: &dyn RemoteShell) -> Result<()> {
        let timeout = self.config.command_timeout;
        let root = site.root_path(&server.server_user);
        let web_root = site.web_root(&server.server_user);

        shell.exec(&format!("mkdir -p {}", shell_quote(&root)), timeout).await?;

        let config = self.site_templates.virtual_host(&VirtualHost {
            domain: site.domain.clone(),
            aliases: site.aliases.clone(),
            web_root: web_root.clone(),
            php_version: site.php_version,
            project_type: site.project_type,
        })?;
        let staged = format!("/tmp/serverforge-nginx-{}.conf", site.id);
        let available = shell_quote(&format!("{}/{}", NGINX_AVAILABLE, site.domain));
        let enabled = shell_quote(&format!("{}/{}", NGINX_ENABLED, site.domain));

        shell.upload(config.as_bytes(), &staged).await?;
        shell
            .sudo(&format!("mv {} {}", shell_quote(&staged), available), timeout)
            .await?;
        shell
            .sudo(&format!("chown root:root {}", available), timeout)
            .await?;
        shell
            .sudo(&format!("ln -sf {} {}", available, enabled), timeout)
            .await?;

        if let Err(e) = shell.sudo("nginx -t", timeout).await {
            // a broken vhost left enabled would block every later reload
            if let Err(cleanup) = shell.sudo(&format!("rm -f {}", enabled), timeout).await {
                warn!(site_id = %site.id, error = %cleanup, "Failed to disable rejected nginx config");
            }
            return Err(e.into());
        }
        shell.sudo("systemctl reload nginx", timeout).await?;

        match site.clone_url() {
            Some(url) => {
                if shell.directory_exists(&format!("{}/.git", root)).await {
                    info!(site_id = %site.id, "Repository already cloned");
                } else {
                    let command = format!(
                        "cd {} && GIT_SSH_COMMAND='ssh -o StrictHostKeyChecking=accept-new' \
                         git clone --branch {} {} .",
                        shell_quote(&root),
                        shell_quote(&site.branch),
                        shell_quote(&url)
                    );
                    shell.exec(&command, CLONE_TIMEOUT).await?;
                    info!(site_id = %site.id, branch = %site.branch, "Repository cloned");
                }
            }
            None => {
                let (index, page) = if site.project_type.uses_php() {
                    ("index.php", PLACEHOLDER_PHP)
                } else {
                    ("index.html", PLACEHOLDER_HTML)
                };
                let path = format!("{}/{}", web_root, index);
                if !shell.file_exists(&path).await {
                    shell
                        .exec(&format!("mkdir -p {}", shell_quote(&web_root)), timeout)
                        .await?;
                    shell.upload(page.as_bytes(), &path).await?;
                }
            }
        }

        shell
            .exec(&format!("chmod 755 {}", shell_quote(&root)), timeout)
            .await?;
        Ok(())
    }

    /// Removes the record first; the server-side teardown is best effort
    #[instrument(skip(self))]
    pub(super) async fn delete_site_job(&self, server_id: Uuid, site_id: Uuid) -> Result<Option<Job>> {
        let Some(site) = self.store.get_site(site_id).await? else {
            info!(site_id = %site_id, "Site already removed");
            return Ok(None);
        };
        self.store.delete_site(site.id).await?;
        info!(site_id = %site.id, domain = %site.domain, "Site record removed");

        let server = match self.store.get_server(server_id).await {
            Ok(Some(server)) => server,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(site_id = %site.id, error = %e, "Skipping site teardown");
                return Ok(None);
            }
        };
        match self.open_operational(&server).await {
            Ok(shell) => {
                self.teardown_site(&server, &site, shell.as_ref()).await;
                shell.disconnect().await;
                self.stamp_ssh_connection(server.id).await;
            }
            Err(e) => {
                warn!(site_id = %site.id, error = %e, "Could not reach server for site teardown");
            }
        }
        Ok(None)
    }

    async fn teardown_site(&self, server: &ServerRecord, site: &SiteRecord, shell: &dyn RemoteShell) {
        let timeout = self.config.command_timeout;
        let commands = [
            format!("rm -f {}", shell_quote(&format!("{}/{}", NGINX_ENABLED, site.domain))),
            format!("rm -f {}", shell_quote(&format!("{}/{}", NGINX_AVAILABLE, site.domain))),
            "systemctl reload nginx".to_string(),
        ];
        for command in &commands {
            if let Err(e) = shell.sudo(command, timeout).await {
                warn!(site_id = %site.id, command = %command, error = %e, "Site teardown step failed");
            }
        }

        // Only ever remove directories inside the operational user's home
        let home = format!("/home/{}/", server.server_user);
        let root = site.root_path(&server.server_user);
        let inside_home = root.len() > home.len() && root.starts_with(&home) && !root.contains("..");
        if !inside_home {
            error!(site_id = %site.id, root = %root, "Refusing to remove site directory outside the user's home");
            return;
        }
        if shell.directory_exists(&root).await
            && let Err(e) = shell.exec(&format!("rm -rf {}", shell_quote(&root)), timeout).await
        {
            warn!(site_id = %site.id, error = %e, "Failed to remove site directory");
        }
    }

    #[instrument(skip(self))]
    pub(super) async fn sync_environment_job(&self, server_id: Uuid, site_id: Uuid) -> Result<Option<Job>> {
        let site = self.load_site_for_job(site_id).await?;
        let variables = self.store.environment(site.id).await?;
        if variables.is_empty() {
            debug!(site_id = %site.id, "No environment variables to write");
            return Ok(None);
        }
        let server = self.load_active(server_id).await?;

        let mut plain = Vec::with_capacity(variables.len());
        for variable in &variables {
            plain.push((variable.key.as_str(), self.cipher.decrypt(&variable.encrypted_value)?));
        }
        let content = env_file(plain.iter().map(|(key, value)| (*key, value.as_str())));
        let path = format!("{}/.env", site.root_path(&server.server_user));

        let shell = self.open_operational(&server).await?;
        let outcome = write_private_file(shell.as_ref(), content.as_bytes(), &path, self.config.command_timeout).await;
        shell.disconnect().await;
        self.stamp_ssh_connection(server.id).await;
        outcome?;

        info!(site_id = %site.id, variables = variables.len(), "Environment written");
        Ok(None)
    }

    #[instrument(skip(self))]
    pub(super) async fn deploy_site_job(
        &self,
        server_id: Uuid,
        site_id: Uuid,
        deployment_id: Uuid,
    ) -> Result<Option<Job>> {
        let mut deployment = self
            .store
            .get_deployment(deployment_id)
            .await?
            .ok_or(LifecycleError::Superseded(deployment_id))?;
        if deployment.status.is_finished() {
            debug!(deployment_id = %deployment_id, status = ?deployment.status, "Deployment already finished");
            return Ok(None);
        }
        let mut site = self.load_site_for_job(site_id).await?;
        let server = self.load_active(server_id).await?;

        let started = Utc::now();
        deployment.start(started);
        self.store
            .update_deployment(&deployment)
            .await
            .map_err(|e| site_store_error(e, deployment_id))?;
        site.deployment_started_at = Some(started);
        let site = self.set_site_status(site, SiteStatus::Deploying).await?;

        let root = site.root_path(&server.server_user);
        let script = self.site_templates.deploy_script(&DeployParams {
            site_root: root.clone(),
            branch: site.branch.clone(),
            php_version: site.php_version,
            body: site.deploy_script.clone(),
        })?;
        let path = format!("/tmp/serverforge-deploy-{}.sh", deployment.id);

        let outcome = match self.open_operational(&server).await {
            Ok(shell) => {
                let outcome = self
                    .run_deploy(shell.as_ref(), &script, &path, &root, &mut deployment.output)
                    .await;
                shell.disconnect().await;
                self.stamp_ssh_connection(server.id).await;
                outcome
            }
            Err(e) => Err(e),
        };

        let (status, result) = match outcome {
            Ok(run) => {
                deployment.commit_hash = run.commit_hash;
                if run.exit_code == 0 {
                    (DeploymentStatus::Finished, Ok(None))
                } else {
                    (DeploymentStatus::Failed, Err(LifecycleError::DeployFailed(run.exit_code)))
                }
            }
            Err(e) => {
                deployment.output.push(e.to_string());
                (DeploymentStatus::Failed, Err(e))
            }
        };

        deployment.finish(status, Utc::now());
        self.store
            .update_deployment(&deployment)
            .await
            .map_err(|e| site_store_error(e, deployment_id))?;
        self.settle_site(site, deployment.finished_at).await?;

        match status {
            DeploymentStatus::Finished => {
                info!(site_id = %site_id, commit = ?deployment.commit_hash, seconds = ?deployment.duration_seconds, "Deployment finished")
            }
            _ => error!(site_id = %site_id, deployment_id = %deployment.id, "Deployment failed"),
        }
        result
    }

    async fn run_deploy(
        &self,
        shell: &dyn RemoteShell,
        script: &str,
        path: &str,
        root: &str,
        output: &mut Vec<String>,
    ) -> Result<DeployRun> {
        shell.upload(script.as_bytes(), path).await?;

        let mut on_line = |line: &str| {
            debug!("{}", line);
            output.push(line.to_string());
        };
        let exit_code = shell
            .exec_streaming(&format!("bash {}", shell_quote(path)), DEPLOY_TIMEOUT, &mut on_line)
            .await?;

        let timeout = self.config.command_timeout;
        if let Err(e) = shell.exec(&format!("rm -f {}", shell_quote(path)), timeout).await {
            warn!(error = %e, "Failed to remove deploy script");
        }

        let commit_hash = match shell
            .exec(&format!("git -C {} rev-parse HEAD", shell_quote(root)), timeout)
            .await
        {
            Ok(stdout) => Some(stdout.trim().to_string()).filter(|hash| !hash.is_empty()),
            Err(e) => {
                debug!(error = %e, "Could not read deployed commit");
                None
            }
        };

        Ok(DeployRun {
            exit_code,
            commit_hash,
        })
    }

    // ------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------

    /// Mark a site whose creation failed
    pub(super) async fn fail_site(&self, site_id: Uuid, cause: &LifecycleError) {
        let site = match self.store.get_site(site_id).await {
            Ok(Some(site)) if matches!(site.status, SiteStatus::Pending | SiteStatus::Installing) => site,
            Ok(_) => return,
            Err(e) => {
                error!(site_id = %site_id, error = %e, "Could not load site to mark it failed");
                return;
            }
        };

        error!(site_id = %site_id, domain = %site.domain, error = %cause, "Site creation failed");
        if let Err(e) = self.set_site_status(site, SiteStatus::Failed).await {
            warn!(site_id = %site_id, error = %e, "Could not mark site as failed");
        }
    }

    /// Close out a deployment whose job gave up before recording a result
    pub(super) async fn fail_deployment(&self, site_id: Uuid, deployment_id: Uuid, cause: &LifecycleError) {
        match self.store.get_deployment(deployment_id).await {
            Ok(Some(mut deployment)) if !deployment.status.is_finished() => {
                deployment.output.push(cause.to_string());
                deployment.finish(DeploymentStatus::Failed, Utc::now());
                if let Err(e) = self.store.update_deployment(&deployment).await {
                    warn!(deployment_id = %deployment_id, error = %e, "Could not mark deployment as failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(deployment_id = %deployment_id, error = %e, "Could not load deployment to mark it failed");
            }
        }

        if let Ok(Some(site)) = self.store.get_site(site_id).await
            && site.status == SiteStatus::Deploying
            && let Err(e) = self.settle_site(site, Some(Utc::now())).await
        {
            warn!(site_id = %site_id, error = %e, "Could not release site after failed deployment");
        }
        error!(site_id = %site_id, deployment_id = %deployment_id, error = %cause, "Deployment gave up");
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// The previous release keeps serving whatever the deployment outcome
    async fn settle_site(
        &self,
        mut site: SiteRecord,
        finished_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<SiteRecord> {
        site.deployment_finished_at = finished_at;
        self.set_site_status(site, SiteStatus::Deployed).await
    }

    async fn set_site_status(&self, mut site: SiteRecord, status: SiteStatus) -> Result<SiteRecord> {
        let previous = site.status;
        site.status = status;
        self.store
            .update_site(&site)
            .await
            .map_err(|e| site_store_error(e, site.id))?;

        if previous != status {
            info!(site_id = %site.id, from = %previous, to = %status, "Site status changed");
            self.events.publish(ServerEvent::SiteStatusChanged {
                server_id: site.server_id,
                site_id: site.id,
                domain: site.domain.clone(),
                status,
            });
        }
        Ok(site)
    }

    async fn load_site(&self, site_id: Uuid) -> Result<SiteRecord> {
        self.store
            .get_site(site_id)
            .await?
            .ok_or(LifecycleError::SiteNotFound(site_id))
    }

    /// A site deleted under a queued job supersedes it
    async fn load_site_for_job(&self, site_id: Uuid) -> Result<SiteRecord> {
        self.store
            .get_site(site_id)
            .await?
            .ok_or(LifecycleError::Superseded(site_id))
    }
}

/// A site or deployment that vanished mid-operation supersedes the caller
fn site_store_error(error: StoreError, id: Uuid) -> LifecycleError {
    match error {
        StoreError::NotFound(_) => LifecycleError::Superseded(id),
        e => e.into(),
    }
}

/// Upload and restrict to the owner
async fn write_private_file(shell: &dyn RemoteShell, content: &[u8], path: &str, timeout: Duration) -> Result<()> {
    shell.upload(content, path).await?;
    shell
        .exec(&format!("chmod 600 {}", shell_quote(path)), timeout)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_site_record_supersedes() {
        let id = Uuid::new_v4();
        assert!(site_store_error(StoreError::NotFound(id), id).is_superseded());
        assert!(!site_store_error(StoreError::State("disk".into()), id).is_superseded());
    }
}
