// src/config.rs

use std::env;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use secrecy::SecretString;
use thiserror::Error;

use crate::sys::secrets::MasterKey;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TWOINE_ENCRYPTION_KEY is not set; refusing to start without a persistent key")]
    MissingEncryptionKey,

    #[error("TWOINE_ENCRYPTION_KEY is invalid: {0}")]
    InvalidEncryptionKey(String),

    #[error("{key} is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Connection settings for the administrative account of one database engine.
#[derive(Clone)]
pub struct EngineAdminConfig {
    pub host: String,
    pub port: u16,
    pub admin_user: String,
    pub admin_password: Option<Arc<SecretString>>,
}

impl fmt::Debug for EngineAdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineAdminConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_user", &self.admin_user)
            .field("admin_password", &self.admin_password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DatabaseAdminConfig {
    pub mariadb: EngineAdminConfig,
    pub postgres: EngineAdminConfig,
    pub mongodb: EngineAdminConfig,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    // 📂 Platform Paths
    pub sites_root: PathBuf,
    pub systemd_dir: PathBuf,
    pub nginx_dir: PathBuf,
    pub ssl_storage_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub sftp_script: Option<PathBuf>,

    // 🛡️ Identity & Privilege
    pub use_sudo: bool,
    pub control_user: String,
    pub encryption_key: MasterKey,

    // 🌐 Networking
    pub port_base: u16,
    pub ports_per_site: u16,
    pub platform_port: u16,
    pub public_ips: Vec<IpAddr>,

    pub databases: DatabaseAdminConfig,
    pub json_logs: bool,
}

impl AgentConfig {
    /// Loads the configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // 🛡️ A generated fallback key would make every stored credential
        // undecryptable after the next restart.
        let raw_key = lookup("TWOINE_ENCRYPTION_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingEncryptionKey)?;
        let encryption_key = MasterKey::parse(raw_key.trim()).map_err(ConfigError::InvalidEncryptionKey)?;

        let port_base = parse_number(&lookup, "TWOINE_PORT_BASE", 10000)?;
        let ports_per_site = parse_number(&lookup, "TWOINE_PORTS_PER_SITE", 10)?;
        if ports_per_site == 0 {
            return Err(ConfigError::Invalid {
                key: "TWOINE_PORTS_PER_SITE",
                reason: "must be at least 1".into(),
            });
        }
        let platform_port = parse_number(&lookup, "TWOINE_PLATFORM_PORT", 3000)?;

        let public_ips = match lookup("TWOINE_PUBLIC_IPS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<IpAddr>().map_err(|e| ConfigError::Invalid {
                        key: "TWOINE_PUBLIC_IPS",
                        reason: format!("'{}': {}", s, e),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let control_user = lookup("TWOINE_CONTROL_USER").unwrap_or_else(current_account_name);

        Ok(Self {
            sites_root: PathBuf::from(var("TWOINE_SITES_ROOT", "/var/www/twoine")),
            systemd_dir: PathBuf::from(var("TWOINE_SYSTEMD_DIR", "/etc/systemd/system")),
            nginx_dir: PathBuf::from(var("TWOINE_NGINX_DIR", "/etc/nginx")),
            ssl_storage_dir: PathBuf::from(var("TWOINE_SSL_DIR", "/etc/twoine/ssl")),
            tmp_dir: PathBuf::from(var("TWOINE_TMP_DIR", "/var/lib/twoine/tmp")),
            state_file: lookup("TWOINE_STATE_FILE").map(PathBuf::from),
            sftp_script: lookup("TWOINE_SFTP_SCRIPT").map(PathBuf::from),
            use_sudo: parse_bool(lookup("TWOINE_USE_SUDO").as_deref()),
            control_user,
            encryption_key,
            port_base,
            ports_per_site,
            platform_port,
            public_ips,
            databases: DatabaseAdminConfig {
                mariadb: engine_admin(&lookup, "MARIADB", 3306, "root")?,
                postgres: engine_admin(&lookup, "POSTGRES", 5432, "postgres")?,
                mongodb: engine_admin(&lookup, "MONGODB", 27017, "admin")?,
            },
            json_logs: lookup("TWOINE_LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        })
    }
}

fn engine_admin<F>(lookup: &F, engine: &str, default_port: u16, default_user: &str) -> Result<EngineAdminConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let port_key: &'static str = match engine {
        "MARIADB" => "TWOINE_MARIADB_PORT",
        "POSTGRES" => "TWOINE_POSTGRES_PORT",
        _ => "TWOINE_MONGODB_PORT",
    };

    Ok(EngineAdminConfig {
        host: lookup(&format!("TWOINE_{}_HOST", engine)).unwrap_or_else(|| "127.0.0.1".to_string()),
        port: parse_number(lookup, port_key, default_port)?,
        admin_user: lookup(&format!("TWOINE_{}_ADMIN_USER", engine)).unwrap_or_else(|| default_user.to_string()),
        admin_password: lookup(&format!("TWOINE_{}_ADMIN_PASSWORD", engine))
            .filter(|p| !p.is_empty())
            .map(|p| Arc::new(SecretString::new(p))),
    })
}

fn parse_number<F>(lookup: &F, key: &'static str, default: u16) -> Result<u16, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<u16>().map_err(|e| ConfigError::Invalid {
            key,
            reason: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

fn parse_bool(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn current_account_name() -> String {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| "root".to_string())
}
