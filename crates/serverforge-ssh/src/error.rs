//! SSH error types

use std::time::Duration;
use thiserror::Error;

/// SSH transport errors
#[derive(Error, Debug)]
pub enum SshError {
    /// TCP connect or protocol handshake failed
    #[error("SSH connection to {host}:{port} failed: {message}")]
    Connection {
        host: String,
        port: u16,
        message: String,
    },

    #[error("SSH authentication as '{username}' on {host} failed: {message}")]
    Authentication {
        host: String,
        username: String,
        message: String,
    },

    /// Remote command exited non-zero
    #[error("Command exited with code {exit_code}: {command}")]
    Command {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("SSH operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Upload to {path} failed: {message}")]
    Upload { path: String, message: String },

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("Session already closed")]
    Closed,

    #[error("Key error: {0}")]
    Key(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl SshError {
    /// Failures before a session exists
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            SshError::Connection { .. } | SshError::Authentication { .. }
        )
    }
}

impl From<ssh2::Error> for SshError {
    fn from(err: ssh2::Error) -> Self {
        SshError::Channel(err.to_string())
    }
}

impl From<ssh_key::Error> for SshError {
    fn from(err: ssh_key::Error) -> Self {
        SshError::Key(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SshError {
    fn from(err: tokio::task::JoinError) -> Self {
        SshError::Join(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SshError>;
