//! ServerForge SSH layer
//!
//! Everything the control plane needs to drive a server over SSH:
//!
//! - [`KeyPairGenerator`]: Ed25519 (default) or RSA keypairs in OpenSSH encoding
//! - [`RemoteShell`]: one authenticated session (exec, streamed exec, upload, sudo)
//! - [`SshConnector`]: opens sessions; [`Ssh2Connector`] is the libssh2 implementation
//! - [`ConnectionRetryCoordinator`]: waits for a new server to accept SSH
//!
//! ```text
//! ConnectionRetryCoordinator ──probe()──▶ SshConnector ──connect()──▶ RemoteShell
//!                                              │
//!                                     Ssh2Connector (libssh2, spawn_blocking)
//! ```

pub mod connector;
pub mod error;
pub mod keygen;
pub mod retry;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use connector::{DEFAULT_SSH_PORT, Ssh2Connector, SshConnector, SshTarget, probe};
pub use error::{Result, SshError};
pub use keygen::{KeyPair, KeyPairGenerator, normalize_public_key, public_key_for};
pub use retry::{ConnectionRetryCoordinator, ReadinessPolicy};
pub use session::{RemoteShell, SshSession, shell_quote};
