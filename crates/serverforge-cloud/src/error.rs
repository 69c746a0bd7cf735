//! Cloud provider error types

use crate::types::Vendor;
use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug)]
pub enum CloudError {
    /// The vendor answered with a non-success HTTP status.
    #[error("{vendor} API error (HTTP {status}): {body}")]
    ProviderApi {
        vendor: Vendor,
        status: u16,
        body: String,
    },

    #[error("{vendor} request failed: {source}")]
    Http {
        vendor: Vendor,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected response from {vendor}: {message}")]
    UnexpectedResponse { vendor: Vendor, message: String },

    #[error("No credentials configured for {0}")]
    MissingCredentials(Vendor),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// HTTP status carried by a vendor API failure
    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::ProviderApi { status, .. } => Some(*status),
            CloudError::Http { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Transport failures, throttling and server-side errors are worth another read.
    pub fn is_transient(&self) -> bool {
        match self {
            CloudError::Http { .. } => true,
            CloudError::ProviderApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;
