//! Control-plane error types

use crate::lifecycle::InvalidTransition;
use crate::model::CredentialKind;
use crate::secrets::SecretError;
use crate::store::StoreError;
use serverforge_cloud::{CloudError, Vendor};
use serverforge_provision::ScriptError;
use serverforge_ssh::SshError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A polling or readiness budget ran out
    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Provisioning script exited with code {0}")]
    ScriptFailed(i32),

    #[error("Server not found: {0}")]
    ServerNotFound(Uuid),

    #[error("Site not found: {0}")]
    SiteNotFound(Uuid),

    #[error("Deployment not found: {0}")]
    DeploymentNotFound(Uuid),

    #[error("Deploy script exited with code {0}")]
    DeployFailed(i32),

    #[error("Provider account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Provider account {0} belongs to another owner")]
    Forbidden(Uuid),

    #[error("{0} rejected the API credentials")]
    InvalidCredentials(Vendor),

    /// The record was deleted, moved to Deleting, or changed under a running job
    #[error("Record {0} was changed by another operation")]
    Superseded(Uuid),

    #[error("Server {server_id} has no {kind} credential")]
    MissingCredential {
        server_id: Uuid,
        kind: CredentialKind,
    },

    #[error("Server {0} has no registered provider SSH key")]
    MissingProviderKey(Uuid),

    #[error("Server {0} has no public IP address yet")]
    MissingAddress(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job queue is closed")]
    QueueClosed,
}

impl LifecycleError {
    pub fn is_superseded(&self) -> bool {
        matches!(self, LifecycleError::Superseded(_))
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
