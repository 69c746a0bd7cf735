//! Software stack selections

use crate::error::ScriptError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// PHP runtime version installed from the ondrej/php PPA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum PhpVersion {
    #[serde(rename = "8.1")]
    Php81,
    #[serde(rename = "8.2")]
    Php82,
    #[default]
    #[serde(rename = "8.3")]
    Php83,
    #[serde(rename = "8.4")]
    Php84,
}

impl PhpVersion {
    pub const ALL: [PhpVersion; 4] = [
        PhpVersion::Php81,
        PhpVersion::Php82,
        PhpVersion::Php83,
        PhpVersion::Php84,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhpVersion::Php81 => "8.1",
            PhpVersion::Php82 => "8.2",
            PhpVersion::Php83 => "8.3",
            PhpVersion::Php84 => "8.4",
        }
    }

    /// systemd unit of the FPM service
    pub fn fpm_service(&self) -> String {
        format!("php{}-fpm", self.as_str())
    }
}

impl fmt::Display for PhpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhpVersion {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhpVersion::ALL
            .into_iter()
            .find(|v| v.as_str() == s.trim())
            .ok_or_else(|| ScriptError::Unknown {
                kind: "PHP version",
                value: s.to_string(),
            })
    }
}

/// Database engine installed during provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Mysql,
    Postgresql,
    Mariadb,
    None,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::Postgresql => "postgresql",
            DatabaseKind::Mariadb => "mariadb",
            DatabaseKind::None => "none",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DatabaseKind::Mysql => "MySQL 8",
            DatabaseKind::Postgresql => "PostgreSQL",
            DatabaseKind::Mariadb => "MariaDB",
            DatabaseKind::None => "None",
        }
    }

    /// Service to restart for this engine, if any
    pub fn service(&self) -> Option<ServiceKind> {
        match self {
            DatabaseKind::Mysql => Some(ServiceKind::Mysql),
            DatabaseKind::Postgresql => Some(ServiceKind::Postgresql),
            DatabaseKind::Mariadb => Some(ServiceKind::Mariadb),
            DatabaseKind::None => None,
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(DatabaseKind::Mysql),
            "postgresql" | "postgres" | "pgsql" => Ok(DatabaseKind::Postgresql),
            "mariadb" => Ok(DatabaseKind::Mariadb),
            "none" | "" => Ok(DatabaseKind::None),
            other => Err(ScriptError::Unknown {
                kind: "database",
                value: other.to_string(),
            }),
        }
    }
}

/// Runtime + database chosen for a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StackSelection {
    pub php_version: PhpVersion,
    pub database: DatabaseKind,
}

impl StackSelection {
    /// Services present once provisioning finishes
    pub fn services(&self) -> BTreeSet<ServiceKind> {
        let mut services = BTreeSet::from([
            ServiceKind::Nginx,
            ServiceKind::Php,
            ServiceKind::Redis,
            ServiceKind::Supervisor,
        ]);
        if let Some(db) = self.database.service() {
            services.insert(db);
        }
        services
    }
}

/// Restartable services on a provisioned server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Nginx,
    Php,
    Mysql,
    Postgresql,
    Mariadb,
    Redis,
    Supervisor,
}

impl ServiceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Nginx => "Nginx",
            ServiceKind::Php => "PHP-FPM",
            ServiceKind::Mysql => "MySQL",
            ServiceKind::Postgresql => "PostgreSQL",
            ServiceKind::Mariadb => "MariaDB",
            ServiceKind::Redis => "Redis",
            ServiceKind::Supervisor => "Supervisor",
        }
    }

    /// Restart command, to be run with privilege escalation
    pub fn restart_command(&self, php: PhpVersion) -> String {
        match self {
            ServiceKind::Nginx => "systemctl restart nginx".to_string(),
            ServiceKind::Php => format!("systemctl restart {}", php.fpm_service()),
            ServiceKind::Mysql => "systemctl restart mysql".to_string(),
            ServiceKind::Postgresql => "systemctl restart postgresql".to_string(),
            ServiceKind::Mariadb => "systemctl restart mariadb".to_string(),
            ServiceKind::Redis => "systemctl restart redis-server".to_string(),
            ServiceKind::Supervisor => "supervisorctl restart all".to_string(),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ServiceKind {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nginx" => Ok(ServiceKind::Nginx),
            "php" | "php-fpm" | "fpm" => Ok(ServiceKind::Php),
            "mysql" => Ok(ServiceKind::Mysql),
            "postgresql" | "postgres" => Ok(ServiceKind::Postgresql),
            "mariadb" => Ok(ServiceKind::Mariadb),
            "redis" => Ok(ServiceKind::Redis),
            "supervisor" => Ok(ServiceKind::Supervisor),
            other => Err(ScriptError::Unknown {
                kind: "service",
                value: other.to_string(),
            }),
        }
    }
}
