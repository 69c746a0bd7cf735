//! Background jobs
//!
//! A server moves through its lifecycle as a chain of jobs. Each handler
//! either finishes the chain or returns exactly one successor, so no two jobs
//! for the same server ever run at once.

use crate::error::{LifecycleError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serverforge_provision::ServiceKind;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    CreateAtProvider {
        server_id: Uuid,
    },
    InstallStack {
        server_id: Uuid,
    },
    DeleteServer {
        server_id: Uuid,
    },
    ValidateAccount {
        account_id: Uuid,
    },
    RestartService {
        server_id: Uuid,
        service: ServiceKind,
    },
    SyncAuthorizedKey {
        server_id: Uuid,
        public_key: String,
    },
    RevokeAuthorizedKey {
        server_id: Uuid,
        public_key: String,
    },
    CreateSite {
        server_id: Uuid,
        site_id: Uuid,
    },
    DeleteSite {
        server_id: Uuid,
        site_id: Uuid,
    },
    SyncEnvironment {
        server_id: Uuid,
        site_id: Uuid,
    },
    DeploySite {
        server_id: Uuid,
        site_id: Uuid,
        deployment_id: Uuid,
    },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Job::CreateAtProvider { .. } => "create_at_provider",
            Job::InstallStack { .. } => "install_stack",
            Job::DeleteServer { .. } => "delete_server",
            Job::ValidateAccount { .. } => "validate_account",
            Job::RestartService { .. } => "restart_service",
            Job::SyncAuthorizedKey { .. } => "sync_authorized_key",
            Job::RevokeAuthorizedKey { .. } => "revoke_authorized_key",
            Job::CreateSite { .. } => "create_site",
            Job::DeleteSite { .. } => "delete_site",
            Job::SyncEnvironment { .. } => "sync_environment",
            Job::DeploySite { .. } => "deploy_site",
        }
    }

    pub fn server_id(&self) -> Option<Uuid> {
        match self {
            Job::CreateAtProvider { server_id }
            | Job::InstallStack { server_id }
            | Job::DeleteServer { server_id }
            | Job::RestartService { server_id, .. }
            | Job::SyncAuthorizedKey { server_id, .. }
            | Job::RevokeAuthorizedKey { server_id, .. }
            | Job::CreateSite { server_id, .. }
            | Job::DeleteSite { server_id, .. }
            | Job::SyncEnvironment { server_id, .. }
            | Job::DeploySite { server_id, .. } => Some(*server_id),
            Job::ValidateAccount { .. } => None,
        }
    }

    pub fn site_id(&self) -> Option<Uuid> {
        match self {
            Job::CreateSite { site_id, .. }
            | Job::DeleteSite { site_id, .. }
            | Job::SyncEnvironment { site_id, .. }
            | Job::DeploySite { site_id, .. } => Some(*site_id),
            _ => None,
        }
    }

    /// Creation and provisioning jobs; their failure puts the server in Error
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Job::CreateAtProvider { .. } | Job::InstallStack { .. })
    }

    /// Execution policy. `script_timeout` bounds the provisioning run.
    pub fn policy(&self, script_timeout: Duration) -> JobPolicy {
        match self {
            Job::CreateAtProvider { .. } => JobPolicy::once(Duration::from_secs(600)),
            Job::InstallStack { .. } => {
                JobPolicy::once(script_timeout + Duration::from_secs(5 * 60))
            }
            Job::DeleteServer { .. } => {
                JobPolicy::retrying(Duration::from_secs(120), 3, Duration::from_secs(10))
            }
            Job::ValidateAccount { .. } => {
                JobPolicy::retrying(Duration::from_secs(60), 3, Duration::from_secs(10))
            }
            Job::RestartService { .. } => {
                JobPolicy::retrying(Duration::from_secs(120), 3, Duration::from_secs(10))
            }
            Job::SyncAuthorizedKey { .. } | Job::RevokeAuthorizedKey { .. } => {
                JobPolicy::retrying(Duration::from_secs(60), 3, Duration::from_secs(30))
            }
            // A clone may be half done; the operator retries by recreating
            Job::CreateSite { .. } => JobPolicy::once(Duration::from_secs(300)),
            Job::DeleteSite { .. } => {
                JobPolicy::retrying(Duration::from_secs(120), 3, Duration::from_secs(10))
            }
            Job::SyncEnvironment { .. } => {
                JobPolicy::retrying(Duration::from_secs(60), 3, Duration::from_secs(10))
            }
            Job::DeploySite { .. } => JobPolicy::once(Duration::from_secs(900)),
        }
    }
}

/// Per-job timeout and retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl JobPolicy {
    pub fn once(timeout: Duration) -> Self {
        Self {
            timeout,
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn retrying(timeout: Duration, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            timeout,
            max_attempts,
            backoff,
        }
    }
}

/// Delayed job queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<()>;
}

/// Executes jobs taken off a queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one job; `Ok(Some(next))` continues the chain with `next`
    async fn handle(&self, job: &Job) -> Result<Option<Job>>;

    /// Called once a job has failed its last attempt or timed out
    async fn on_exhausted(&self, job: &Job, error: &LifecycleError);

    fn policy(&self, job: &Job) -> JobPolicy;
}
