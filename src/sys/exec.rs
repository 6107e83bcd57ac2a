// src/sys/exec.rs

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::sys::traits::{CommandOutput, CommandRunner, CommandSpec};

/// Runs argv vectors directly through `tokio::process`. No shell is involved
/// unless the program itself is one.
pub struct SystemCommandRunner {
    use_sudo: bool,
}

impl SystemCommandRunner {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    /// Final argv after privilege handling: `[sudo -n --preserve-env=..] [runuser -u U --] program args..`
    fn argv(&self, spec: &CommandSpec) -> Vec<String> {
        let mut argv = Vec::with_capacity(spec.args.len() + 8);

        if self.use_sudo && (spec.privileged || spec.run_as.is_some()) {
            argv.push("sudo".to_string());
            argv.push("-n".to_string());
            if !spec.env.is_empty() {
                let keys: Vec<&str> = spec.env.iter().map(|(k, _)| k.as_str()).collect();
                argv.push(format!("--preserve-env={}", keys.join(",")));
            }
        }
        if let Some(user) = &spec.run_as {
            argv.extend(["runuser".to_string(), "-u".to_string(), user.clone(), "--".to_string()]);
        }

        argv.push(spec.program.clone());
        argv.extend(spec.args.iter().cloned());
        argv
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let argv = self.argv(spec);
        debug!(command = %spec.display(), timeout = ?spec.timeout, run_as = ?spec.run_as, "Executing");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out child is killed when its future is dropped.
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let input = spec.stdin.clone();
        let mut pipe = child.stdin.take();
        let completion = async move {
            if let (Some(text), Some(stdin)) = (input, pipe.as_mut()) {
                stdin.write_all(text.as_bytes()).await?;
                stdin.shutdown().await?;
            }
            // EOF for the child.
            drop(pipe);
            child.wait_with_output().await
        };

        match tokio::time::timeout(spec.timeout, completion).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(CommandError::Spawn {
                program: spec.program.clone(),
                source,
            }),
            Err(_) => {
                warn!(command = %spec.display(), timeout = ?spec.timeout, "Command timed out and was killed");
                Err(CommandError::TimedOut {
                    program: spec.program.clone(),
                    timeout: spec.timeout,
                })
            }
        }
    }
}
