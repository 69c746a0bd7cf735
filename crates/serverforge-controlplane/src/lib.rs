//! ServerForge control plane
//!
//! Drives servers from "requested" to "provisioned and reachable":
//!
//! - [`ServerLifecycleOrchestrator`]: request-path operations and job handlers,
//!   for servers and for the sites hosted on them
//! - [`transition`]: the pure server state machine
//! - [`WorkerPool`]: in-process job execution with retries and timeouts
//! - [`ServerStore`]: persistence, in memory or in a JSON state file
//! - [`ProviderRegistry`]: vendor drivers
//!
//! ```text
//!  request ──▶ Orchestrator ──enqueue──▶ WorkerPool ──handle──▶ Orchestrator
//!                  │                                               │
//!                  ▼                                               ▼
//!             ServerStore ◀──────── compare-and-swap ──────── CloudProvider / SSH
//! ```

pub mod error;
pub mod events;
pub mod jobs;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod secrets;
pub mod state;
pub mod store;
pub mod worker;

pub use error::{LifecycleError, Result};
pub use events::{BroadcastEvents, EventSink, ServerEvent};
pub use jobs::{Job, JobHandler, JobPolicy, JobQueue};
pub use lifecycle::{Effect, InvalidTransition, LifecycleEvent, LifecycleState, Transition, transition};
pub use model::{
    ConnectionStatus, Credential, CredentialKind, Deployment, DeploymentStatus,
    EnvironmentVariable, ProviderAccount, ServerExtension, ServerRecord, ServerStatus, SiteRecord,
    SiteStatus,
};
pub use orchestrator::{
    BOOTSTRAP_USER, LifecycleConfig, NewServer, NewSite, ServerLifecycleOrchestrator,
};
pub use registry::ProviderRegistry;
pub use secrets::{AesGcmCipher, SecretCipher, SecretError};
pub use state::JsonFileStore;
pub use store::{MemoryStore, ServerStore, StoreError};
pub use worker::{WorkerPool, WorkerQueue};
