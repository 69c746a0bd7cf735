//! ServerForge settings
//!
//! Settings live in one YAML document. Every field has a default, so a
//! missing file or a partial file is fine.
//!
//! ```yaml
//! server:
//!   user: artisan
//!   ssh_port: 22
//! provisioning:
//!   poll_interval_secs: 5
//!   poll_attempts: 60
//! workers:
//!   concurrency: 4
//! ```

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Overrides the file lookup with a direct path
pub const CONFIG_PATH_ENV: &str = "SERVERFORGE_CONFIG";
/// Overrides `server.user`
pub const SERVER_USER_ENV: &str = "SERVER_USER";

const APP_DIR: &str = "serverforge";
const LOCAL_CANDIDATES: [&str; 2] = ["serverforge.yaml", ".serverforge/config.yaml"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub provisioning: ProvisioningSettings,
    pub workers: WorkerSettings,
    pub storage: StorageSettings,
    pub secrets: SecretSettings,
}

/// Defaults for newly created servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Operational (non-root) account created by provisioning
    pub user: String,
    pub ssh_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            user: "artisan".to_string(),
            ssh_port: 22,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningSettings {
    pub poll_interval_secs: u64,
    pub poll_attempts: u32,
    pub ssh_max_attempts: u32,
    pub ssh_initial_delay_secs: u64,
    pub ssh_max_delay_secs: u64,
    pub script_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            poll_attempts: 60,
            ssh_max_attempts: 20,
            ssh_initial_delay_secs: 5,
            ssh_max_delay_secs: 30,
            script_timeout_secs: 1800,
            command_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Defaults to the platform data directory
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretSettings {
    /// Env var holding the base64 AES-256 key
    pub key_env: String,
}

impl Default for SecretSettings {
    fn default() -> Self {
        Self {
            key_env: "SERVERFORGE_SECRET_KEY".to_string(),
        }
    }
}

impl Settings {
    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.user.is_empty() || self.server.user == "root" {
            return Err(ConfigError::Invalid {
                key: "server.user",
                message: "must be a non-root account name".to_string(),
            });
        }
        if self.server.ssh_port == 0 {
            return Err(ConfigError::Invalid {
                key: "server.ssh_port",
                message: "must not be 0".to_string(),
            });
        }
        if self.workers.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "workers.concurrency",
                message: "must be at least 1".to_string(),
            });
        }
        if self.provisioning.poll_attempts == 0 || self.provisioning.ssh_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "provisioning",
                message: "attempt budgets must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Directory holding the state file and generated key material
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(dirs::data_dir()
                .ok_or(ConfigError::DataDirNotFound)?
                .join(APP_DIR)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var(SERVER_USER_ENV)
            && !user.trim().is_empty()
        {
            self.server.user = user.trim().to_string();
        }
    }
}

/// ServerForge's configuration directory, created if missing
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join(APP_DIR);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Locate the settings file.
///
/// Lookup order:
/// 1. `SERVERFORGE_CONFIG`
/// 2. `./serverforge.yaml`, then `./.serverforge/config.yaml`
/// 3. `<config dir>/serverforge/config.yaml`
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    let current_dir = std::env::current_dir()?;
    for candidate in LOCAL_CANDIDATES {
        let path = current_dir.join(candidate);
        if path.is_file() {
            return Ok(Some(path));
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join(APP_DIR).join("config.yaml");
        if global.is_file() {
            return Ok(Some(global));
        }
    }

    Ok(None)
}

/// Load settings from the discovered file, or defaults when there is none
pub fn load_settings() -> Result<Settings> {
    let mut settings = match find_config_file()? {
        Some(path) => load_settings_from(&path)?,
        None => {
            debug!("No settings file found, using defaults");
            Settings::default()
        }
    };
    settings.apply_env_overrides();
    settings.validate()?;
    Ok(settings)
}

/// Parse one settings file without env overrides
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings = Settings::from_yaml(&content, path)?;
    debug!(path = %path.display(), "Loaded settings");
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    struct CwdGuard(PathBuf);

    impl CwdGuard {
        fn enter(dir: &Path) -> Self {
            let original = std::env::current_dir().unwrap();
            std::env::set_current_dir(dir).unwrap();
            Self(original)
        }
    }

    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.0);
        }
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.user, "artisan");
        assert_eq!(settings.server.ssh_port, 22);
        assert_eq!(settings.provisioning.poll_interval_secs, 5);
        assert_eq!(settings.provisioning.poll_attempts, 60);
        assert_eq!(settings.provisioning.ssh_max_attempts, 20);
        assert_eq!(settings.provisioning.script_timeout_secs, 1800);
        assert_eq!(settings.workers.concurrency, 4);
        assert_eq!(settings.secrets.key_env, "SERVERFORGE_SECRET_KEY");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "server:\n  ssh_port: 2222\nworkers:\n  concurrency: 8\n";
        let settings = Settings::from_yaml(yaml, Path::new("test.yaml")).unwrap();
        assert_eq!(settings.server.ssh_port, 2222);
        assert_eq!(settings.server.user, "artisan");
        assert_eq!(settings.workers.concurrency, 8);
        assert_eq!(settings.provisioning.poll_attempts, 60);
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = Settings::from_yaml("server: [", Path::new("broken.yaml")).unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_validate_rejects_root_user() {
        let mut settings = Settings::default();
        settings.server.user = "root".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { key: "server.user", .. })
        ));
    }

    #[test]
    fn test_explicit_data_dir() {
        let mut settings = Settings::default();
        settings.storage.data_dir = Some(PathBuf::from("/var/lib/serverforge"));
        assert_eq!(settings.data_dir().unwrap(), PathBuf::from("/var/lib/serverforge"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("serverforge.yaml"), "{}").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        let found = find_config_file().unwrap().unwrap();
        assert!(found.ends_with("serverforge.yaml"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_dot_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let dot_dir = temp_dir.path().join(".serverforge");
        fs::create_dir(&dot_dir).unwrap();
        fs::write(dot_dir.join("config.yaml"), "{}").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        let found = find_config_file().unwrap().unwrap();
        assert!(found.ends_with(".serverforge/config.yaml"));
    }

    #[test]
    #[serial]
    fn test_env_var_takes_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("serverforge.yaml"), "{}").unwrap();
        let custom = temp_dir.path().join("custom.yaml");
        fs::write(&custom, "server:\n  user: deployer\n").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, custom.to_str().unwrap());
        }
        let found = find_config_file().unwrap();
        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }

        assert_eq!(found, Some(custom));
    }

    #[test]
    #[serial]
    fn test_load_settings_applies_user_override() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(
            temp_dir.path().join("serverforge.yaml"),
            "server:\n  user: deployer\n",
        )
        .unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        unsafe {
            std::env::set_var(SERVER_USER_ENV, "forge");
        }
        let settings = load_settings();
        unsafe {
            std::env::remove_var(SERVER_USER_ENV);
        }

        assert_eq!(settings.unwrap().server.user, "forge");
    }
}
