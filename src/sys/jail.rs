// src/sys/jail.rs

use async_trait::async_trait;
use nix::unistd::User;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{CommandError, Error, Result};
use crate::model::site::SITE_USER_PREFIX;
use crate::sys::traits::{CommandRunner, CommandSpec, JailManager, OsAccount};
use crate::validate::validate_os_username;

/// `userdel` exit code for "user does not exist".
const USERDEL_NO_SUCH_USER: i32 = 6;

pub struct LinuxJailManager {
    runner: Arc<dyn CommandRunner>,
}

impl LinuxJailManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn user_exists(&self, username: &str) -> Result<bool> {
        let output = self.runner.run(&CommandSpec::new("id").args(["-u", username])).await?;
        Ok(output.success())
    }
}

/// Resolves uid/gid from the passwd database. `None` when the lookup fails.
fn lookup_ids(username: &str) -> (Option<u32>, Option<u32>) {
    match User::from_name(username) {
        Ok(Some(user)) => (Some(user.uid.as_raw()), Some(user.gid.as_raw())),
        _ => (None, None),
    }
}

#[async_trait]
impl JailManager for LinuxJailManager {
    async fn provision_site_user(&self, username: &str, home: &Path) -> Result<OsAccount> {
        // 🛡️ Zero-Trust Input Validation
        validate_os_username(username)?;

        // Idempotency: an existing account is reused as-is.
        if self.user_exists(username).await? {
            debug!(username, "OS user already exists");
            let (uid, gid) = lookup_ids(username);
            return Ok(OsAccount { uid, gid, created: false });
        }

        // 🛡️ Hardened user creation
        // --system: no password aging, lower UID range
        // --no-create-home: the site tree is provisioned separately
        // --shell nologin: no interactive access
        let home = home.display().to_string();
        let spec = CommandSpec::new("useradd")
            .args([
                "--system",
                "--no-create-home",
                "--user-group",
                "--home-dir",
                home.as_str(),
                "--shell",
                "/usr/sbin/nologin",
                username,
            ])
            .privileged();
        self.runner.run_checked(&spec).await?;

        let (uid, gid) = lookup_ids(username);
        info!(username, ?uid, "OS user provisioned");
        Ok(OsAccount { uid, gid, created: true })
    }

    async fn deprovision_site_user(&self, username: &str) -> Result<()> {
        // 🛡️ Never touch accounts this agent did not create
        if !username.starts_with(SITE_USER_PREFIX) {
            return Err(Error::validation(format!(
                "refusing to delete non-site account '{}'",
                username
            )));
        }
        validate_os_username(username)?;

        let spec = CommandSpec::new("userdel").arg(username).privileged();
        let output = self.runner.run(&spec).await?;
        match output.code {
            Some(0) => {
                info!(username, "OS user removed");
                Ok(())
            }
            // Already gone.
            Some(USERDEL_NO_SUCH_USER) => Ok(()),
            code => Err(CommandError::Failed {
                program: spec.program,
                code,
                stderr: output.stderr.trim().to_string(),
            }
            .into()),
        }
    }

    async fn secure_directory(&self, path: &Path, username: &str, mode: u32) -> Result<()> {
        validate_os_username(username)?;

        tokio::fs::create_dir_all(path).await?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;

        // 🛡️ Recursive chown with symlink protection
        // -h: never follow links, so a tenant cannot link to /etc/shadow and take ownership.
        let spec = CommandSpec::new("chown")
            .args([
                "-Rh".to_string(),
                format!("{}:{}", username, username),
                path.display().to_string(),
            ])
            .privileged();
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    async fn grant_read_acl(&self, path: &Path, account: &str) -> Result<()> {
        validate_os_username(account)?;
        let spec = CommandSpec::new("setfacl")
            .args([
                "-R".to_string(),
                "-m".to_string(),
                format!("u:{}:rX", account),
                path.display().to_string(),
            ])
            .privileged();
        self.runner.run_checked(&spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::traits::CommandOutput;
    use crate::testing::{FakeRunner, matching};

    #[tokio::test]
    async fn existing_user_is_not_recreated() {
        let runner = FakeRunner::new();
        let jail = LinuxJailManager::new(runner.clone());

        let account = jail.provision_site_user("twoine_demo1", Path::new("/srv/demo1")).await.unwrap();
        assert!(!account.created);
        assert!(!runner.ran("useradd"));
    }

    #[tokio::test]
    async fn missing_user_is_created_without_login() {
        let runner = FakeRunner::new();
        runner.respond(
            matching("id -u"),
            CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "no such user".into(),
            },
        );
        let jail = LinuxJailManager::new(runner.clone());

        let account = jail.provision_site_user("twoine_demo1", Path::new("/srv/demo1")).await.unwrap();
        assert!(account.created);
        let useradd = runner.command_lines().into_iter().find(|l| l.starts_with("useradd")).unwrap();
        assert!(useradd.contains("--shell /usr/sbin/nologin"));
        assert!(useradd.contains("--home-dir /srv/demo1"));
        assert!(useradd.ends_with("twoine_demo1"));
    }

    #[tokio::test]
    async fn injection_in_username_is_rejected() {
        let runner = FakeRunner::new();
        let jail = LinuxJailManager::new(runner.clone());
        assert!(jail.provision_site_user("x; reboot", Path::new("/tmp")).await.is_err());
        assert!(jail.provision_site_user("--help", Path::new("/tmp")).await.is_err());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn deprovision_only_touches_site_accounts() {
        let runner = FakeRunner::new();
        let jail = LinuxJailManager::new(runner.clone());

        assert!(jail.deprovision_site_user("root").await.unwrap_err().is_validation());
        assert!(jail.deprovision_site_user("postgres").await.is_err());
        assert!(runner.calls().is_empty());

        runner.respond(
            matching("userdel"),
            CommandOutput {
                code: Some(USERDEL_NO_SUCH_USER),
                stdout: String::new(),
                stderr: "user does not exist".into(),
            },
        );
        jail.deprovision_site_user("twoine_gone").await.unwrap();
    }

    #[tokio::test]
    async fn secure_directory_sets_mode_and_owner() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("site/tmp");
        let runner = FakeRunner::new();
        let jail = LinuxJailManager::new(runner.clone());

        jail.secure_directory(&target, "twoine_demo1", 0o700).await.unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
        assert_eq!(
            runner.command_lines(),
            vec![format!("chown -Rh twoine_demo1:twoine_demo1 {}", target.display())]
        );

        jail.grant_read_acl(&target, "twoine").await.unwrap();
        assert!(runner.ran(&format!("setfacl -R -m u:twoine:rX {}", target.display())));
    }
}
