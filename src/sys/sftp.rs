// src/sys/sftp.rs

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::error::Result;
use crate::sys::traits::{CommandRunner, CommandSpec, SftpAccount, SftpProvisioner};

/// Delegates to an external script: `<script> <site> [password]`, which
/// prints a single JSON object on stdout.
pub struct ScriptSftpProvisioner {
    runner: Arc<dyn CommandRunner>,
    script: PathBuf,
}

impl ScriptSftpProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, script: PathBuf) -> Self {
        Self { runner, script }
    }
}

#[async_trait]
impl SftpProvisioner for ScriptSftpProvisioner {
    async fn create_account(&self, site_name: &str, password: Option<&SecretString>) -> Result<SftpAccount> {
        let mut spec = CommandSpec::new(self.script.display().to_string())
            .arg(site_name)
            .privileged();
        if let Some(password) = password {
            spec = spec.arg(password.expose_secret().as_str());
        }

        let output = self.runner.run(&spec).await?;
        debug!(site = site_name, code = ?output.code, "SFTP script finished");

        match serde_json::from_str::<SftpAccount>(output.stdout.trim()) {
            Ok(account) => Ok(account),
            // The script died before printing its result.
            Err(_) if !output.success() => Ok(SftpAccount {
                success: false,
                error: Some(output.stderr.trim().to_string()),
                ..Default::default()
            }),
            Err(e) => Err(e.into()),
        }
    }
}
