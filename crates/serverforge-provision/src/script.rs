//! Bootstrap script rendering
//!
//! The script is a fixed Tera template. Every value is substituted when the
//! script is generated, so the text uploaded to the server is exactly what
//! runs there.

use crate::error::{Result, ScriptError};
use crate::markers::{DATA_LOCAL_PUBLIC_KEY, DATA_OS_VERSION};
use crate::stack::StackSelection;
use crate::step::ProvisioningStep;
use serde::Serialize;
use std::fmt;
use tera::{Context, Tera};
use tracing::debug;

const TEMPLATE_NAME: &str = "provision.sh";
const TEMPLATE: &str = include_str!("../templates/provision.sh");

/// Inputs for one provisioning script
#[derive(Clone)]
pub struct ProvisioningParams {
    pub stack: StackSelection,
    /// Operational (non-root) account created on the server
    pub server_user: String,
    pub ssh_port: u16,
    pub sudo_password: String,
    pub database_password: String,
}

impl fmt::Debug for ProvisioningParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningParams")
            .field("stack", &self.stack)
            .field("server_user", &self.server_user)
            .field("ssh_port", &self.ssh_port)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct StepCodes {
    preparing: u32,
    swap: u32,
    base_dependencies: u32,
    runtime: u32,
    web_server: u32,
    database: u32,
    cache: u32,
    final_touches: u32,
    finished: u32,
}

impl StepCodes {
    fn current() -> Self {
        Self {
            preparing: ProvisioningStep::PreparingServer.code(),
            swap: ProvisioningStep::ConfiguringSwap.code(),
            base_dependencies: ProvisioningStep::InstallingBaseDependencies.code(),
            runtime: ProvisioningStep::InstallingRuntime.code(),
            web_server: ProvisioningStep::InstallingWebServer.code(),
            database: ProvisioningStep::InstallingDatabase.code(),
            cache: ProvisioningStep::InstallingCache.code(),
            final_touches: ProvisioningStep::MakingFinalTouches.code(),
            finished: ProvisioningStep::Finished.code(),
        }
    }
}

/// Renders the provisioning script
pub struct ProvisioningScriptBuilder {
    tera: Tera,
}

impl ProvisioningScriptBuilder {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, TEMPLATE)?;
        Ok(Self { tera })
    }

    pub fn build(&self, params: &ProvisioningParams) -> Result<String> {
        check_identifier("server_user", &params.server_user)?;
        check_secret("sudo_password", &params.sudo_password)?;
        check_secret("database_password", &params.database_password)?;

        let mut context = Context::new();
        context.insert("php_version", params.stack.php_version.as_str());
        context.insert("database", params.stack.database.as_str());
        context.insert("db_password", &params.database_password);
        context.insert("sudo_password", &params.sudo_password);
        context.insert("server_user", &params.server_user);
        context.insert("ssh_port", &params.ssh_port);
        context.insert("steps", &StepCodes::current());
        context.insert("data_os_version", DATA_OS_VERSION);
        context.insert("data_local_public_key", DATA_LOCAL_PUBLIC_KEY);

        let script = self.tera.render(TEMPLATE_NAME, &context)?;
        debug!(
            php_version = %params.stack.php_version,
            database = %params.stack.database,
            bytes = script.len(),
            "Rendered provisioning script"
        );
        Ok(script)
    }
}

/// POSIX user name
fn check_identifier(name: &'static str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid_start && valid_rest && value.len() <= 32 {
        Ok(())
    } else {
        Err(ScriptError::UnsafeValue { name })
    }
}

/// Secrets are interpolated inside single quotes, in SQL literals and in chpasswd input
fn check_secret(name: &'static str, value: &str) -> Result<()> {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'));
    if safe {
        Ok(())
    } else {
        Err(ScriptError::UnsafeValue { name })
    }
}
