// src/testing.rs
//
// Test doubles for the OS boundary. Only compiled for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use crate::config::AgentConfig;
use crate::error::CommandError;
use crate::model::{Site, SiteDraft};
use crate::orchestrator::{ControlPlane, DatabaseOrchestrator, DomainOrchestrator, ServiceOrchestrator, SiteOrchestrator};
use crate::store::{MemoryStore, Repositories};
use crate::sys::traits::{Clock, CommandOutput, CommandRunner, CommandSpec, Event, Notifier};

type Matcher = Box<dyn Fn(&CommandSpec) -> bool + Send + Sync>;

enum Reply {
    Output(CommandOutput),
    Timeout,
}

/// Matches any command whose `display()` line contains `needle`.
pub fn matching(needle: &str) -> impl Fn(&CommandSpec) -> bool + Send + Sync + 'static {
    let needle = needle.to_string();
    move |spec: &CommandSpec| spec.display().contains(&needle)
}

/// Records every command and answers from scripted rules. Unmatched commands
/// succeed with empty output. The most recently added matching rule wins.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    rules: Mutex<Vec<(Matcher, Reply)>>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond<F>(&self, matcher: F, output: CommandOutput)
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push((Box::new(matcher), Reply::Output(output)));
    }

    pub fn fail_when<F>(&self, matcher: F, stderr: &str)
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.respond(
            matcher,
            CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: stderr.to_string(),
            },
        );
    }

    pub fn timeout_when<F>(&self, matcher: F)
    where
        F: Fn(&CommandSpec) -> bool + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push((Box::new(matcher), Reply::Timeout));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    /// True when any recorded command line contains `needle`.
    pub fn ran(&self, needle: &str) -> bool {
        self.command_lines().iter().any(|line| line.contains(needle))
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(spec.clone());
        let rules = self.rules.lock().unwrap();
        match rules.iter().rev().find(|(matcher, _)| matcher(spec)) {
            Some((_, Reply::Output(output))) => Ok(output.clone()),
            Some((_, Reply::Timeout)) => Err(CommandError::TimedOut {
                program: spec.program.clone(),
                timeout: Duration::from_secs(0),
            }),
            None => Ok(CommandOutput::ok("")),
        }
    }
}

/// Answers the engines' existence queries with "nothing there yet".
pub fn empty_database_servers(runner: &FakeRunner) {
    runner.respond(
        |spec: &CommandSpec| {
            spec.stdin
                .as_deref()
                .is_some_and(|sql| sql.contains("information_schema.schemata"))
        },
        CommandOutput::ok("0\t0\n"),
    );
    runner.respond(
        |spec: &CommandSpec| spec.stdin.as_deref().is_some_and(|sql| sql.contains("pg_roles")),
        CommandOutput::ok("0|0\n"),
    );
    runner.respond(
        matching("getDBNames"),
        CommandOutput::ok("{\"database\":false,\"user\":false}\n"),
    );
}

pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()))
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// The full control plane over real adapters, a scripted runner and a
/// throwaway directory tree. Nothing touches the host outside `root`.
pub struct Harness {
    pub root: TempDir,
    pub repos: Repositories,
    pub runner: Arc<FakeRunner>,
    pub notifier: Arc<RecordingNotifier>,
    pub plane: ControlPlane,
    pub services: Arc<ServiceOrchestrator>,
    pub sites: Arc<SiteOrchestrator>,
    pub domains: Arc<DomainOrchestrator>,
    pub databases: Arc<DatabaseOrchestrator>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_port_base(10000).await
    }

    pub async fn with_port_base(port_base: u16) -> Self {
        let root = tempfile::tempdir().unwrap();
        for dir in ["sites", "systemd", "tmp"] {
            std::fs::create_dir_all(root.path().join(dir)).unwrap();
        }

        let path = |name: &str| root.path().join(name).display().to_string();
        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert(
            "TWOINE_ENCRYPTION_KEY",
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f".into(),
        );
        vars.insert("TWOINE_SITES_ROOT", path("sites"));
        vars.insert("TWOINE_SYSTEMD_DIR", path("systemd"));
        vars.insert("TWOINE_NGINX_DIR", path("nginx"));
        vars.insert("TWOINE_SSL_DIR", path("ssl"));
        vars.insert("TWOINE_TMP_DIR", path("tmp"));
        vars.insert("TWOINE_SFTP_SCRIPT", path("bin/create-sftp"));
        vars.insert("TWOINE_CONTROL_USER", "twoine".into());
        vars.insert("TWOINE_PORT_BASE", port_base.to_string());
        let config = AgentConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let repos = Repositories::from_store(Arc::new(MemoryStore::new()));
        let runner = FakeRunner::new();
        empty_database_servers(&runner);
        let notifier = Arc::new(RecordingNotifier::default());
        let plane = ControlPlane::build(&config, repos.clone(), runner.clone(), notifier.clone(), FixedClock::arc())
            .unwrap();

        Self {
            root,
            repos,
            runner,
            notifier,
            services: plane.services.clone(),
            sites: plane.sites.clone(),
            domains: plane.domains.clone(),
            databases: plane.databases.clone(),
            plane,
        }
    }

    /// Creates a site and returns it once provisioned.
    pub async fn active_site(&self, name: &str) -> Site {
        self.sites
            .create_site(SiteDraft {
                name: name.into(),
                owner: "user-1".into(),
                ..Default::default()
            })
            .await
            .unwrap()
    }
}
