// src/sys/traits.rs
//
// 🛡️ Contracts for every external boundary. Orchestrators only ever see these
// traits, so the OS side can be swapped for fakes in tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::{CommandError, Result};
use crate::sys::secrets::Credential;

// ==============================================================================
// 1. Process Execution (argv only, no implicit shell)
// ==============================================================================

pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
    /// Needs root; prefixed with `sudo -n` when the agent runs unprivileged.
    pub privileged: bool,
    /// Drop to this account through `runuser`.
    pub run_as: Option<String>,
    /// Piped to the child, then closed. Keeps statements carrying passwords out of argv.
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            timeout: CONTROL_TIMEOUT,
            privileged: false,
            run_as: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    /// `program arg1 arg2`, for logs. Env values are never included.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion or until `spec.timeout`. A nonzero exit is not an error here.
    async fn run(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, CommandError>;

    /// Like `run`, but a nonzero exit becomes `CommandError::Failed`.
    async fn run_checked(&self, spec: &CommandSpec) -> std::result::Result<CommandOutput, CommandError> {
        let output = self.run(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                program: spec.program.clone(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

// ==============================================================================
// 2. Clock & Notifications
// ==============================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ServiceStarted { site: String, service: String },
    ServiceStopped { site: String, service: String },
    ServiceRestarted { site: String, service: String },
    ServiceFailed { site: String, service: String, error: String },
    SiteStatusChanged { site: String, status: String },
    DomainStatusChanged { domain: String, status: String },
    Alert { level: AlertLevel, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// Fire-and-forget status broadcaster. Must never block or fail the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

// ==============================================================================
// 3. SFTP Account Provisioner (opaque collaborator)
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpAccount {
    pub success: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub home_dir: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait SftpProvisioner: Send + Sync {
    async fn create_account(&self, site_name: &str, password: Option<&SecretString>) -> Result<SftpAccount>;
}

// ==============================================================================
// 4. Process Supervisor
// ==============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub active: bool,
    pub active_state: String,
    pub sub_state: String,
    pub enabled: bool,
    pub pid: Option<u32>,
    pub uptime_secs: Option<i64>,
    pub memory_bytes: Option<u64>,
    pub cpu_seconds: Option<f64>,
    pub restart_count: u32,
    pub last_result: String,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Atomically installs the unit text and reloads the manager.
    async fn install(&self, unit: &str, unit_text: &str) -> Result<()>;
    /// Removes the unit file; a missing file is not an error.
    async fn remove(&self, unit: &str) -> Result<()>;
    async fn enable(&self, unit: &str) -> Result<()>;
    async fn disable(&self, unit: &str) -> Result<()>;
    async fn start(&self, unit: &str) -> Result<()>;
    async fn stop(&self, unit: &str) -> Result<()>;
    async fn restart(&self, unit: &str) -> Result<()>;
    async fn reload_manager(&self) -> Result<()>;
    async fn status(&self, unit: &str) -> Result<UnitStatus>;
    async fn batch_status(&self, units: &[String]) -> Result<HashMap<String, UnitStatus>>;
    async fn exists(&self, unit: &str) -> Result<bool>;
}

// ==============================================================================
// 5. Reverse Proxy
// ==============================================================================

#[async_trait]
pub trait ProxyManager: Send + Sync {
    /// Writes `sites-available/<file_name>` and returns its path.
    async fn write_config(&self, file_name: &str, content: &str) -> Result<PathBuf>;
    /// Symlinks the config into `sites-enabled` and returns the link path.
    async fn enable(&self, file_name: &str) -> Result<PathBuf>;
    async fn disable(&self, file_name: &str) -> Result<()>;
    async fn remove_config(&self, file_name: &str) -> Result<()>;
    async fn test_config(&self) -> Result<()>;
    async fn reload(&self) -> Result<()>;
}

// ==============================================================================
// 6. SSL Engine
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

pub struct SslPayload {
    pub domain_name: String,
    pub fullchain_pem: String,
    /// Taken by value so the engine can scrub it right after the write.
    pub privkey_pem: Credential,
}

#[async_trait]
pub trait SslEngine: Send + Sync {
    /// RSA-2048, subject and SAN set to `domain`.
    async fn generate_self_signed(&self, domain: &str, days: u32) -> Result<CertificatePaths>;
    async fn install_certificate(&self, payload: SslPayload) -> Result<CertificatePaths>;
    async fn remove_certificate(&self, domain: &str) -> Result<()>;
}

// ==============================================================================
// 7. Tenant Jail (OS users & directories)
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsAccount {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// False when the account already existed.
    pub created: bool,
}

#[async_trait]
pub trait JailManager: Send + Sync {
    /// Creates a no-login account; an existing account is reused.
    async fn provision_site_user(&self, username: &str, home: &Path) -> Result<OsAccount>;
    async fn deprovision_site_user(&self, username: &str) -> Result<()>;
    /// Creates `path` if needed, sets `mode`, hands ownership to `username`.
    async fn secure_directory(&self, path: &Path, username: &str, mode: u32) -> Result<()>;
    /// Read-only ACL for the control process's own account.
    async fn grant_read_acl(&self, path: &Path, account: &str) -> Result<()>;
}
