//! ServerForge provisioning
//!
//! The in-guest half of server setup:
//!
//! - [`ProvisioningScriptBuilder`] renders the bootstrap shell script for a
//!   [`StackSelection`]
//! - the script announces progress with `###STEP:<n>###` and reports facts with
//!   `###DATA:<key>=<value>###` lines ([`markers`])
//! - [`ProvisioningStep`] gives those step numbers a meaning
//! - [`site`] renders what a hosted site needs: nginx vhost, deploy script, `.env`

pub mod error;
pub mod markers;
pub mod script;
pub mod site;
pub mod stack;
pub mod step;

pub use error::{Result, ScriptError};
pub use markers::{DataMarker, ScriptLine, parse_data_marker, parse_step_marker};
pub use script::{ProvisioningParams, ProvisioningScriptBuilder};
pub use site::{
    DeployParams, ProjectType, RepositoryProvider, SiteTemplates, VirtualHost, env_file,
};
pub use stack::{DatabaseKind, PhpVersion, ServiceKind, StackSelection};
pub use step::ProvisioningStep;
