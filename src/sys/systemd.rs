// src/sys/systemd.rs

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sys::traits::{Clock, CommandRunner, CommandSpec, ProcessSupervisor, UnitStatus};

const MAX_UNIT_NAME_LEN: usize = 100;
const STATUS_WINDOW: usize = 10;

static UNIT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^twoine-[a-z0-9][a-z0-9_-]*$").expect("valid regex"));

/// 🛡️ Single choke point against unit-name injection. Every supervisor call
/// goes through here before anything is executed.
pub fn validate_unit_name(unit: &str) -> Result<()> {
    if unit.len() > MAX_UNIT_NAME_LEN || !UNIT_NAME.is_match(unit) {
        return Err(Error::validation(format!("invalid unit name '{}'", unit)));
    }
    Ok(())
}

// ==============================================================================
// 1. Unit Rendering
// ==============================================================================

pub struct UnitSpec<'a> {
    pub description: String,
    pub user: &'a str,
    pub working_dir: &'a Path,
    pub exec_start: &'a str,
    pub exec_stop: Option<&'a str>,
    pub env_file: &'a Path,
    pub stdout_log: &'a Path,
    pub stderr_log: &'a Path,
    pub memory_mb: u32,
    pub cpu_percent: u32,
    pub wants: &'a [String],
}

/// Wraps a validated command for `bash -c`, escaped for systemd's own parser.
fn exec_line(command: &str) -> String {
    let escaped = command.replace('%', "%%").replace('"', "\\\"");
    format!("/bin/bash -c \"exec {}\"", escaped)
}

pub fn render_unit(spec: &UnitSpec<'_>) -> String {
    let mut wants = String::from("network-online.target");
    for unit in spec.wants {
        wants.push(' ');
        wants.push_str(unit);
    }

    let exec_stop = spec
        .exec_stop
        .map(|cmd| format!("ExecStop={}\n", exec_line(cmd)))
        .unwrap_or_default();

    format!(
        r#"[Unit]
Description={description}
After=network-online.target
Wants={wants}
StartLimitIntervalSec=300
StartLimitBurst=5

[Service]
Type=simple
User={user}
Group={user}
WorkingDirectory={workdir}
EnvironmentFile=-{env_file}
ExecStart={exec_start}
{exec_stop}Restart=on-failure
RestartSec=5
TimeoutStartSec=30
TimeoutStopSec=30

# --- ⚖️ CGroup Resource Limits ---
CPUAccounting=true
CPUQuota={cpu}%
MemoryAccounting=true
MemoryMax={memory}M

StandardOutput=append:{stdout}
StandardError=append:{stderr}

# --- 🛡️ Hardening ---
NoNewPrivileges=true
ProtectSystem=full
PrivateTmp=true
ProtectKernelTunables=true
ProtectKernelModules=true
ProtectControlGroups=true

[Install]
WantedBy=multi-user.target
"#,
        description = spec.description,
        wants = wants,
        user = spec.user,
        workdir = spec.working_dir.display(),
        env_file = spec.env_file.display(),
        exec_start = exec_line(spec.exec_start),
        exec_stop = exec_stop,
        cpu = spec.cpu_percent,
        memory = spec.memory_mb,
        stdout = spec.stdout_log.display(),
        stderr = spec.stderr_log.display(),
    )
}

// ==============================================================================
// 2. Status Introspection
// ==============================================================================

const SHOW_PROPERTIES: &str =
    "ActiveState,SubState,UnitFileState,MainPID,MemoryCurrent,CPUUsageNSec,NRestarts,Result,ActiveEnterTimestamp";

fn parse_show_output(output: &str, now: DateTime<Utc>) -> UnitStatus {
    let props: HashMap<&str, &str> = output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let number = |key: &str| props.get(key).and_then(|v| v.parse::<u64>().ok());
    let active_state = props.get("ActiveState").copied().unwrap_or("unknown").to_string();
    let active = active_state == "active";

    let uptime_secs = if active {
        props
            .get("ActiveEnterTimestamp")
            .and_then(|v| v.strip_prefix('@'))
            .and_then(|secs| secs.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .map(|since| (now - since).num_seconds().max(0))
    } else {
        None
    };

    UnitStatus {
        active,
        sub_state: props.get("SubState").copied().unwrap_or("unknown").to_string(),
        enabled: matches!(props.get("UnitFileState").copied(), Some("enabled" | "enabled-runtime")),
        pid: number("MainPID").filter(|pid| *pid > 0).and_then(|pid| u32::try_from(pid).ok()),
        uptime_secs,
        memory_bytes: number("MemoryCurrent"),
        cpu_seconds: number("CPUUsageNSec").map(|ns| ns as f64 / 1_000_000_000.0),
        restart_count: number("NRestarts").and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
        last_result: props.get("Result").copied().unwrap_or("unknown").to_string(),
        active_state,
    }
}

async fn query_status(runner: &dyn CommandRunner, unit: &str, now: DateTime<Utc>) -> Result<UnitStatus> {
    let spec = CommandSpec::new("systemctl").args([
        "show".to_string(),
        format!("{}.service", unit),
        "--no-pager".to_string(),
        "--timestamp=unix".to_string(),
        format!("--property={}", SHOW_PROPERTIES),
    ]);
    let output = runner.run_checked(&spec).await?;
    Ok(parse_show_output(&output.stdout, now))
}

// ==============================================================================
// 3. Concrete Implementation (systemd)
// ==============================================================================

pub struct SystemdSupervisor {
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn Clock>,
    systemd_dir: PathBuf,
    staging_dir: PathBuf,
}

impl SystemdSupervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, clock: Arc<dyn Clock>, systemd_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            runner,
            clock,
            systemd_dir,
            staging_dir,
        }
    }

    fn unit_path(&self, unit: &str) -> PathBuf {
        self.systemd_dir.join(format!("{}.service", unit))
    }

    async fn systemctl(&self, action: &str, unit: &str) -> Result<()> {
        validate_unit_name(unit)?;
        let spec = CommandSpec::new("systemctl")
            .args([action.to_string(), format!("{}.service", unit)])
            .privileged();
        self.runner.run_checked(&spec).await?;
        debug!(unit, action, "systemctl succeeded");
        Ok(())
    }

    /// Writes the unit text into a private temp file that the supervisor
    /// cannot see until it is moved into place.
    fn stage(&self, unit: &str, unit_text: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!("{}.", unit))
            .suffix(".service")
            .tempfile_in(&self.staging_dir)?;
        tmp.write_all(unit_text.as_bytes())?;
        tmp.as_file().sync_all()?;
        let (_file, path) = tmp.keep().map_err(|e| Error::Io(e.error))?;
        Ok(path)
    }
}

#[async_trait]
impl ProcessSupervisor for SystemdSupervisor {
    async fn install(&self, unit: &str, unit_text: &str) -> Result<()> {
        validate_unit_name(unit)?;
        let staged = self.stage(unit, unit_text)?;
        let target = self.unit_path(unit);
        let target_str = target.display().to_string();

        let steps = [
            CommandSpec::new("mv").args(["-f".to_string(), staged.display().to_string(), target_str.clone()]),
            CommandSpec::new("chmod").args(["644", target_str.as_str()]),
            CommandSpec::new("chown").args(["root:root", target_str.as_str()]),
        ];
        for step in steps {
            if let Err(e) = self.runner.run_checked(&step.privileged()).await {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e.into());
            }
        }

        self.reload_manager().await?;
        info!(unit, path = %target.display(), "Unit installed");
        Ok(())
    }

    async fn remove(&self, unit: &str) -> Result<()> {
        validate_unit_name(unit)?;
        let target = self.unit_path(unit);
        let spec = CommandSpec::new("rm").args(["-f".to_string(), target.display().to_string()]).privileged();
        self.runner.run_checked(&spec).await?;
        self.reload_manager().await?;
        info!(unit, "Unit removed");
        Ok(())
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl("enable", unit).await
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        self.systemctl("disable", unit).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.systemctl("start", unit).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl("stop", unit).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.systemctl("restart", unit).await
    }

    async fn reload_manager(&self) -> Result<()> {
        let spec = CommandSpec::new("systemctl").arg("daemon-reload").privileged();
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    async fn status(&self, unit: &str) -> Result<UnitStatus> {
        validate_unit_name(unit)?;
        query_status(self.runner.as_ref(), unit, self.clock.now()).await
    }

    async fn batch_status(&self, units: &[String]) -> Result<HashMap<String, UnitStatus>> {
        for unit in units {
            validate_unit_name(unit)?;
        }

        // Read-only queries; at most STATUS_WINDOW in flight.
        let window = Arc::new(Semaphore::new(STATUS_WINDOW));
        let now = self.clock.now();
        let mut tasks = JoinSet::new();
        for unit in units {
            let runner = Arc::clone(&self.runner);
            let window = Arc::clone(&window);
            let unit = unit.clone();
            tasks.spawn(async move {
                let _permit = window.acquire_owned().await;
                let status = query_status(runner.as_ref(), &unit, now).await;
                (unit, status)
            });
        }

        let mut statuses = HashMap::with_capacity(units.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((unit, Ok(status))) => {
                    statuses.insert(unit, status);
                }
                Ok((unit, Err(e))) => warn!(unit, error = %e, "Status query failed"),
                Err(e) => warn!(error = %e, "Status task aborted"),
            }
        }
        Ok(statuses)
    }

    async fn exists(&self, unit: &str) -> Result<bool> {
        validate_unit_name(unit)?;
        Ok(tokio::fs::try_exists(self.unit_path(unit)).await?)
    }
}
