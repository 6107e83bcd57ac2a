// src/model/service.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EnvVars, ResourceLimits, Site};
use crate::error::{Error, Result};

pub const UNIT_PREFIX: &str = "twoine";

/// Names owned by the lifecycle itself; never usable for custom commands.
pub const RESERVED_COMMAND_NAMES: [&str; 7] = ["start", "stop", "restart", "install", "build", "status", "logs"];

pub const DEFAULT_CUSTOM_TIMEOUT_SECS: u64 = 300;
pub const MAX_CUSTOM_TIMEOUT_SECS: u64 = 3600;

pub fn unit_name_for(site: &str, service: &str) -> String {
    format!("{}-{}-{}", UNIT_PREFIX, site, service)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    pub install: Option<String>,
    pub build: Option<String>,
    pub start: String,
    pub stop: Option<String>,
    /// HTTP path probed on 127.0.0.1:<port>.
    pub health_check: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomCommand {
    pub command: String,
    pub description: Option<String>,
    pub timeout_secs: u64,
    pub requires_stop: bool,
    pub dangerous: bool,
}

impl CustomCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: None,
            timeout_secs: DEFAULT_CUSTOM_TIMEOUT_SECS,
            requires_stop: false,
            dangerous: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    pub binary: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Unknown,
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    Restarting,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Unknown, _)
                | (Stopped, Starting)
                | (Stopped, Restarting)
                | (Stopped, Stopped)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Restarting)
                | (Stopping, Stopped)
                | (Failed, Starting)
                | (Failed, Restarting)
                | (Failed, Stopping)
                | (Failed, Stopped)
                | (Restarting, Running)
                | (Restarting, Stopping)
        )
    }

    pub fn is_up(self) -> bool {
        matches!(self, RunState::Running | RunState::Starting | RunState::Restarting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub current: RunState,
    pub desired: DesiredState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_stopped: Option<DateTime<Utc>>,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            current: RunState::Unknown,
            desired: DesiredState::Stopped,
            failure_count: 0,
            last_error: None,
            last_started: None,
            last_stopped: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub last_status: Option<bool>,
    pub status_code: Option<u16>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePaths {
    pub working_dir: PathBuf,
    pub env_file: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDraft {
    pub name: String,
    pub port: Option<u16>,
    pub commands: CommandSet,
    #[serde(default)]
    pub custom_commands: BTreeMap<String, CustomCommand>,
    pub runtime: Option<Runtime>,
    #[serde(default)]
    pub environment: EnvVars,
    #[serde(default)]
    pub start_priority: i32,
    pub limits: Option<ResourceLimits>,
    /// Extra units this one `Wants=`.
    #[serde(default)]
    pub wants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    site_id: Uuid,
    site_name: String,
    name: String,
    port: u16,
    unit_name: String,
    paths: ServicePaths,
    pub commands: CommandSet,
    pub custom_commands: BTreeMap<String, CustomCommand>,
    pub runtime: Option<Runtime>,
    pub environment: EnvVars,
    pub start_priority: i32,
    pub limits: ResourceLimits,
    pub wants: Vec<String>,
    pub(crate) status: ServiceStatus,
    pub health: HealthState,
    pub unit_file_created: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Service {
    /// Builds a service of `site` bound to `port`, deriving unit name and paths.
    pub fn new(draft: ServiceDraft, site: &Site, port: u16, now: DateTime<Utc>) -> Self {
        let site_paths = site.paths();
        let working_dir = site_paths.services.join(&draft.name);
        let paths = ServicePaths {
            env_file: working_dir.join("twoine.env"),
            stdout_log: site_paths.logs.join(format!("{}.log", draft.name)),
            stderr_log: site_paths.logs.join(format!("{}.error.log", draft.name)),
            working_dir,
        };

        Self {
            id: Uuid::new_v4(),
            site_id: site.id,
            site_name: site.name().to_string(),
            unit_name: unit_name_for(site.name(), &draft.name),
            name: draft.name,
            port,
            paths,
            commands: draft.commands,
            custom_commands: draft.custom_commands,
            runtime: draft.runtime,
            environment: draft.environment,
            start_priority: draft.start_priority,
            limits: draft.limits.unwrap_or(site.limits),
            wants: draft.wants,
            status: ServiceStatus::default(),
            health: HealthState::default(),
            unit_file_created: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn site_id(&self) -> Uuid {
        self.site_id
    }

    pub fn site_name(&self) -> &str {
        &self.site_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn paths(&self) -> &ServicePaths {
        &self.paths
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    pub(crate) fn transition(&mut self, next: RunState, now: DateTime<Utc>) -> Result<()> {
        if !self.status.current.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "service '{}' cannot move from {:?} to {:?}",
                self.name, self.status.current, next
            )));
        }
        self.status.current = next;
        match next {
            RunState::Running => self.status.last_started = Some(now),
            RunState::Stopped => self.status.last_stopped = Some(now),
            _ => {}
        }
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn desire(&mut self, desired: DesiredState, now: DateTime<Utc>) {
        self.status.desired = desired;
        self.updated_at = now;
    }

    pub(crate) fn record_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status.current = RunState::Failed;
        self.status.failure_count = self.status.failure_count.saturating_add(1);
        self.status.last_error = Some(message.into());
        self.updated_at = now;
    }

    /// Overwrites `current` with what the supervisor reports.
    pub(crate) fn observe(&mut self, state: RunState, now: DateTime<Utc>) {
        if self.status.current != state {
            self.status.current = state;
            self.updated_at = now;
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.current.is_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortRange, SiteDraft};
    use std::path::Path;

    fn service() -> Service {
        let site = Site::new(
            SiteDraft {
                name: "demo1".into(),
                owner: "u1".into(),
                ..Default::default()
            },
            Path::new("/srv/sites"),
            PortRange { start: 10000, end: 10009 },
            Utc::now(),
        );
        let draft = ServiceDraft {
            name: "api".into(),
            commands: CommandSet {
                start: "node server.js".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        Service::new(draft, &site, 10000, Utc::now())
    }

    #[test]
    fn derived_fields() {
        let svc = service();
        assert_eq!(svc.unit_name(), "twoine-demo1-api");
        assert_eq!(svc.paths().working_dir, PathBuf::from("/srv/sites/demo1/services/api"));
        assert_eq!(svc.paths().env_file, PathBuf::from("/srv/sites/demo1/services/api/twoine.env"));
        assert_eq!(svc.paths().stderr_log, PathBuf::from("/srv/sites/demo1/logs/api.error.log"));
        assert_eq!(svc.limits, ResourceLimits::default());
        assert_eq!(svc.status().current, RunState::Unknown);
    }

    #[test]
    fn start_stop_cycle() {
        let mut svc = service();
        let now = Utc::now();
        svc.transition(RunState::Starting, now).unwrap();
        svc.transition(RunState::Running, now).unwrap();
        assert_eq!(svc.status().last_started, Some(now));
        svc.transition(RunState::Stopping, now).unwrap();
        svc.transition(RunState::Stopped, now).unwrap();
        assert_eq!(svc.status().last_stopped, Some(now));
    }

    #[test]
    fn stopped_cannot_jump_to_running() {
        let mut svc = service();
        let now = Utc::now();
        svc.transition(RunState::Stopped, now).unwrap();
        assert!(svc.transition(RunState::Running, now).is_err());
    }

    #[test]
    fn failures_accumulate() {
        let mut svc = service();
        let now = Utc::now();
        svc.transition(RunState::Starting, now).unwrap();
        svc.record_failure("exit 1", now);
        svc.record_failure("exit 1 again", now);
        assert_eq!(svc.status().current, RunState::Failed);
        assert_eq!(svc.status().failure_count, 2);
        assert_eq!(svc.status().last_error.as_deref(), Some("exit 1 again"));
        // failed services may be started again
        svc.transition(RunState::Starting, now).unwrap();
    }
}
