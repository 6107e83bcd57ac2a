// src/orchestrator/service.rs

use std::collections::HashMap;
use std::fmt::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::service::MAX_CUSTOM_TIMEOUT_SECS;
use crate::model::{
    CommandSet, CustomCommand, DesiredState, EnvVars, HealthState, PortRange, ResourceLimits, RunState, Runtime,
    Service, ServiceDraft, Site, SiteStatus,
};
use crate::store::Repositories;
use crate::sys::systemd::{UnitSpec, render_unit, validate_unit_name};
use crate::sys::traits::{
    Clock, CommandOutput, CommandRunner, CommandSpec, Event, HEALTH_TIMEOUT, JailManager, LONG_TIMEOUT, Notifier,
    ProcessSupervisor, UnitStatus,
};
use crate::validate::{
    validate_command, validate_custom_command_name, validate_env_var, validate_service_name,
};

/// Lowest port of `range` not in `used`.
pub fn allocate_port(range: PortRange, used: &[u16]) -> Result<u16> {
    range.lowest_free(used).ok_or(Error::PortsExhausted {
        start: range.start,
        end: range.end,
    })
}

/// Mutable fields of a service. The port is immutable; passing a different
/// one is rejected.
#[derive(Debug, Clone, Default)]
pub struct ServiceUpdate {
    pub port: Option<u16>,
    pub commands: Option<CommandSet>,
    pub environment: Option<EnvVars>,
    pub runtime: Option<Runtime>,
    pub start_priority: Option<i32>,
    pub limits: Option<ResourceLimits>,
    pub wants: Option<Vec<String>>,
}

fn validate_commands(commands: &CommandSet) -> Result<()> {
    validate_command(&commands.start)?;
    for command in [&commands.install, &commands.build, &commands.stop].into_iter().flatten() {
        validate_command(command)?;
    }
    if let Some(path) = &commands.health_check {
        if !path.starts_with('/') || path.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::validation(format!("invalid health check path '{}'", path)));
        }
    }
    Ok(())
}

fn validate_custom(name: &str, custom: &CustomCommand) -> Result<()> {
    validate_custom_command_name(name)?;
    validate_command(&custom.command)?;
    if custom.timeout_secs == 0 || custom.timeout_secs > MAX_CUSTOM_TIMEOUT_SECS {
        return Err(Error::validation(format!(
            "timeout of '{}' must be between 1 and {} seconds",
            name, MAX_CUSTOM_TIMEOUT_SECS
        )));
    }
    Ok(())
}

fn validate_environment(env: &EnvVars) -> Result<()> {
    env.iter().try_for_each(|(key, value)| validate_env_var(key, value))
}

fn validate_wants(wants: &[String]) -> Result<()> {
    for unit in wants {
        let valid = !unit.is_empty()
            && unit
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
        if !valid {
            return Err(Error::validation(format!("invalid dependency unit '{}'", unit)));
        }
    }
    Ok(())
}

/// Flat `KEY=value` text. Later sections override earlier ones.
pub fn render_env_file(site: &Site, service: &Service) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Generated by twoine for {}/{}. Manual edits are overwritten.",
        site.name(),
        service.name()
    );
    let _ = writeln!(out, "PORT={}", service.port());
    let _ = writeln!(out, "TWOINE_SITE={}", site.name());
    let _ = writeln!(out, "TWOINE_SERVICE={}", service.name());

    out.push_str("\n# Site\n");
    for (key, value) in &site.environment {
        let _ = writeln!(out, "{}={}", key, value);
    }
    out.push_str("\n# Service\n");
    for (key, value) in &service.environment {
        let _ = writeln!(out, "{}={}", key, value);
    }
    out
}

/// Maps systemd's ActiveState onto the service state machine.
fn run_state_of(status: &UnitStatus) -> RunState {
    match status.active_state.as_str() {
        "active" => RunState::Running,
        "activating" | "reloading" => RunState::Starting,
        "deactivating" => RunState::Stopping,
        "failed" => RunState::Failed,
        "inactive" => RunState::Stopped,
        _ => RunState::Unknown,
    }
}

pub struct ServiceOrchestrator {
    repos: Repositories,
    supervisor: Arc<dyn ProcessSupervisor>,
    jail: Arc<dyn JailManager>,
    runner: Arc<dyn CommandRunner>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
}

impl ServiceOrchestrator {
    pub fn new(
        repos: Repositories,
        supervisor: Arc<dyn ProcessSupervisor>,
        jail: Arc<dyn JailManager>,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        // Redirects are reported as-is so 3xx counts as healthy.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(HEALTH_TIMEOUT)
            .build()?;
        Ok(Self {
            repos,
            supervisor,
            jail,
            runner,
            notifier,
            clock,
            http,
        })
    }

    async fn load(&self, id: Uuid) -> Result<Service> {
        self.repos
            .services
            .get_service(id)
            .await?
            .ok_or_else(|| Error::not_found("service", id))
    }

    async fn load_site(&self, id: Uuid) -> Result<Site> {
        self.repos.sites.get_site(id).await?.ok_or_else(|| Error::not_found("site", id))
    }

    pub async fn get_service(&self, id: Uuid) -> Result<Service> {
        self.load(id).await
    }

    pub async fn list_site_services(&self, site_id: Uuid) -> Result<Vec<Service>> {
        self.repos.services.list_site_services(site_id).await
    }

    // ==============================================================================
    // 1. Creation & Teardown
    // ==============================================================================

    pub async fn create_service(&self, site_id: Uuid, draft: ServiceDraft) -> Result<Service> {
        validate_service_name(&draft.name)?;
        let site = self.load_site(site_id).await?;
        if site.status() != SiteStatus::Active {
            return Err(Error::invalid_state(format!(
                "site '{}' is {:?}, services can only be added to active sites",
                site.name(),
                site.status()
            )));
        }

        validate_commands(&draft.commands)?;
        for (name, custom) in &draft.custom_commands {
            validate_custom(name, custom)?;
        }
        validate_environment(&draft.environment)?;
        validate_wants(&draft.wants)?;

        if self.repos.services.find_service(site.id, &draft.name).await?.is_some() {
            return Err(Error::conflict(format!(
                "service '{}' already exists in site '{}'",
                draft.name,
                site.name()
            )));
        }

        let range = site.port_range();
        let used = self.repos.services.ports_in_use().await?;
        let port = match draft.port {
            Some(port) if !range.contains(port) => {
                return Err(Error::validation(format!(
                    "port {} is outside the site range {}-{}",
                    port, range.start, range.end
                )));
            }
            Some(port) if used.contains(&port) => {
                return Err(Error::conflict(format!("port {} is already in use", port)));
            }
            Some(port) => port,
            None => allocate_port(range, &used)?,
        };

        let mut service = Service::new(draft, &site, port, self.clock.now());
        validate_unit_name(service.unit_name())?;
        self.repos.services.insert_service(service.clone()).await?;

        if let Err(e) = self.provision(&site, &mut service).await {
            warn!(service = service.name(), site = site.name(), error = %e, "Service provisioning failed, rolling back");
            // A partial install can leave the unit file behind; removal is idempotent.
            if let Err(cleanup) = self.supervisor.remove(service.unit_name()).await {
                warn!(unit = service.unit_name(), error = %cleanup, "Rollback: unit removal failed");
            }
            if let Err(cleanup) = self.repos.services.delete_service(service.id).await {
                warn!(service = service.name(), error = %cleanup, "Rollback: record removal failed");
            }
            return Err(e);
        }

        info!(service = service.name(), site = site.name(), port, "Service created");
        Ok(service)
    }

    async fn provision(&self, site: &Site, service: &mut Service) -> Result<()> {
        self.jail
            .secure_directory(&service.paths().working_dir, site.username(), 0o750)
            .await?;
        self.install_unit(site, service).await?;
        service.unit_file_created = true;
        self.write_env_file(site, service).await?;
        service.transition(RunState::Stopped, self.clock.now())?;
        self.repos.services.update_service(service).await
    }

    fn unit_text(&self, site: &Site, service: &Service) -> String {
        let paths = service.paths();
        render_unit(&UnitSpec {
            description: format!("Twoine {}/{}", site.name(), service.name()),
            user: site.username(),
            working_dir: &paths.working_dir,
            exec_start: &service.commands.start,
            exec_stop: service.commands.stop.as_deref(),
            env_file: &paths.env_file,
            stdout_log: &paths.stdout_log,
            stderr_log: &paths.stderr_log,
            memory_mb: service.limits.memory_mb,
            cpu_percent: service.limits.cpu_percent,
            wants: &service.wants,
        })
    }

    async fn install_unit(&self, site: &Site, service: &Service) -> Result<()> {
        self.supervisor
            .install(service.unit_name(), &self.unit_text(site, service))
            .await
    }

    async fn write_env_file(&self, site: &Site, service: &Service) -> Result<()> {
        let path = &service.paths().env_file;
        fs::write(path, render_env_file(site, service)).await?;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o640)).await?;
        debug!(path = %path.display(), "Environment file written");
        Ok(())
    }

    /// Rewrites unit and environment file from the stored record.
    pub async fn regenerate_unit(&self, id: Uuid) -> Result<Service> {
        let mut service = self.load(id).await?;
        let site = self.load_site(service.site_id()).await?;
        self.install_unit(&site, &service).await?;
        service.unit_file_created = true;
        self.write_env_file(&site, &service).await?;
        service.updated_at = self.clock.now();
        self.repos.services.update_service(&service).await?;
        Ok(service)
    }

    pub async fn update_service(&self, id: Uuid, update: ServiceUpdate) -> Result<Service> {
        let mut service = self.load(id).await?;
        if let Some(port) = update.port {
            if port != service.port() {
                return Err(Error::validation(format!(
                    "port of service '{}' is immutable ({})",
                    service.name(),
                    service.port()
                )));
            }
        }
        if let Some(commands) = &update.commands {
            validate_commands(commands)?;
        }
        if let Some(env) = &update.environment {
            validate_environment(env)?;
        }
        if let Some(wants) = &update.wants {
            validate_wants(wants)?;
        }

        if let Some(commands) = update.commands {
            service.commands = commands;
        }
        if let Some(env) = update.environment {
            service.environment = env;
        }
        if let Some(runtime) = update.runtime {
            service.runtime = Some(runtime);
        }
        if let Some(priority) = update.start_priority {
            service.start_priority = priority;
        }
        if let Some(limits) = update.limits {
            service.limits = limits;
        }
        if let Some(wants) = update.wants {
            service.wants = wants;
        }
        service.updated_at = self.clock.now();
        self.repos.services.update_service(&service).await?;

        if service.unit_file_created {
            return self.regenerate_unit(id).await;
        }
        Ok(service)
    }

    /// Stops, disables and removes the unit. Each step only logs on failure,
    /// so tearing down an already removed unit never errors.
    pub(crate) async fn teardown(&self, service: &Service) {
        let unit = service.unit_name();
        if let Err(e) = self.supervisor.stop(unit).await {
            debug!(unit, error = %e, "Teardown: stop failed");
        }
        if let Err(e) = self.supervisor.disable(unit).await {
            debug!(unit, error = %e, "Teardown: disable failed");
        }
        if let Err(e) = self.supervisor.remove(unit).await {
            warn!(unit, error = %e, "Teardown: unit removal failed");
        }
    }

    pub async fn delete_service(&self, id: Uuid) -> Result<()> {
        let service = self.load(id).await?;
        self.teardown(&service).await;
        self.repos.services.delete_service(id).await?;
        info!(service = service.name(), site = service.site_name(), "Service deleted");
        Ok(())
    }

    // ==============================================================================
    // 2. Lifecycle
    // ==============================================================================

    async fn fail(&self, service: &mut Service, error: &Error) {
        service.record_failure(error.to_string(), self.clock.now());
        if let Err(e) = self.repos.services.update_service(service).await {
            warn!(service = service.name(), error = %e, "Failed to persist service failure");
        }
        self.notifier.notify(Event::ServiceFailed {
            site: service.site_name().to_string(),
            service: service.name().to_string(),
            error: error.to_string(),
        });
    }

    pub async fn start_service(&self, id: Uuid) -> Result<Service> {
        let mut service = self.load(id).await?;
        let now = self.clock.now();
        service.desire(DesiredState::Running, now);
        if !service.is_running() {
            service.transition(RunState::Starting, now)?;
        }

        if let Err(e) = self.supervisor.start(service.unit_name()).await {
            self.fail(&mut service, &e).await;
            return Err(e);
        }
        if let Err(e) = self.supervisor.enable(service.unit_name()).await {
            warn!(unit = service.unit_name(), error = %e, "Unit started but could not be enabled");
        }

        if service.status().current != RunState::Running {
            service.transition(RunState::Running, self.clock.now())?;
        }
        self.repos.services.update_service(&service).await?;
        info!(unit = service.unit_name(), "Service started");
        self.notifier.notify(Event::ServiceStarted {
            site: service.site_name().to_string(),
            service: service.name().to_string(),
        });
        Ok(service)
    }

    pub async fn stop_service(&self, id: Uuid) -> Result<Service> {
        let mut service = self.load(id).await?;
        let now = self.clock.now();
        service.desire(DesiredState::Stopped, now);
        if service.status().current != RunState::Stopped {
            service.transition(RunState::Stopping, now)?;
        }

        if let Err(e) = self.supervisor.stop(service.unit_name()).await {
            self.fail(&mut service, &e).await;
            return Err(e);
        }
        if let Err(e) = self.supervisor.disable(service.unit_name()).await {
            warn!(unit = service.unit_name(), error = %e, "Unit stopped but could not be disabled");
        }

        service.transition(RunState::Stopped, self.clock.now())?;
        self.repos.services.update_service(&service).await?;
        info!(unit = service.unit_name(), "Service stopped");
        self.notifier.notify(Event::ServiceStopped {
            site: service.site_name().to_string(),
            service: service.name().to_string(),
        });
        Ok(service)
    }

    pub async fn restart_service(&self, id: Uuid) -> Result<Service> {
        let mut service = self.load(id).await?;
        let now = self.clock.now();
        service.desire(DesiredState::Running, now);
        service.transition(RunState::Restarting, now)?;

        if let Err(e) = self.supervisor.restart(service.unit_name()).await {
            self.fail(&mut service, &e).await;
            return Err(e);
        }

        service.transition(RunState::Running, self.clock.now())?;
        self.repos.services.update_service(&service).await?;
        info!(unit = service.unit_name(), "Service restarted");
        self.notifier.notify(Event::ServiceRestarted {
            site: service.site_name().to_string(),
            service: service.name().to_string(),
        });
        Ok(service)
    }

    /// Refreshes `status.current` from the supervisor.
    pub async fn sync_status(&self, id: Uuid) -> Result<(Service, UnitStatus)> {
        let mut service = self.load(id).await?;
        let status = self.supervisor.status(service.unit_name()).await?;
        service.observe(run_state_of(&status), self.clock.now());
        self.repos.services.update_service(&service).await?;
        Ok((service, status))
    }

    /// Live unit status of every service of a site, keyed by service name.
    pub async fn site_status(&self, site_id: Uuid) -> Result<HashMap<String, UnitStatus>> {
        let services = self.repos.services.list_site_services(site_id).await?;
        let units: Vec<String> = services.iter().map(|s| s.unit_name().to_string()).collect();
        let mut by_unit = self.supervisor.batch_status(&units).await?;
        Ok(services
            .iter()
            .filter_map(|s| by_unit.remove(s.unit_name()).map(|status| (s.name().to_string(), status)))
            .collect())
    }

    // ==============================================================================
    // 3. Commands
    // ==============================================================================

    /// Runs a validated command line as the site user inside the working dir.
    async fn run_as_site(&self, site: &Site, service: &Service, command: &str, timeout: Duration) -> Result<CommandOutput> {
        validate_command(command)?;
        let mut spec = CommandSpec::new("bash")
            .args(["-c", command])
            .run_as(site.username())
            .current_dir(&service.paths().working_dir)
            .timeout(timeout)
            .env("PORT", service.port().to_string());
        for (key, value) in site.environment.iter().chain(service.environment.iter()) {
            spec = spec.env(key, value);
        }

        info!(service = service.name(), site = site.name(), command, "Running command");
        Ok(self.runner.run_checked(&spec).await?)
    }

    pub async fn run_install(&self, id: Uuid) -> Result<CommandOutput> {
        let service = self.load(id).await?;
        let site = self.load_site(service.site_id()).await?;
        let command = service
            .commands
            .install
            .as_deref()
            .ok_or_else(|| Error::validation(format!("service '{}' has no install command", service.name())))?;
        self.run_as_site(&site, &service, command, LONG_TIMEOUT).await
    }

    pub async fn run_build(&self, id: Uuid) -> Result<CommandOutput> {
        let service = self.load(id).await?;
        let site = self.load_site(service.site_id()).await?;
        let command = service
            .commands
            .build
            .as_deref()
            .ok_or_else(|| Error::validation(format!("service '{}' has no build command", service.name())))?;
        self.run_as_site(&site, &service, command, LONG_TIMEOUT).await
    }

    pub async fn add_custom_command(&self, id: Uuid, name: &str, custom: CustomCommand) -> Result<Service> {
        validate_custom(name, &custom)?;
        let mut service = self.load(id).await?;
        if service.custom_commands.contains_key(name) {
            return Err(Error::conflict(format!(
                "custom command '{}' already exists on '{}'",
                name,
                service.name()
            )));
        }
        service.custom_commands.insert(name.to_string(), custom);
        service.updated_at = self.clock.now();
        self.repos.services.update_service(&service).await?;
        Ok(service)
    }

    pub async fn remove_custom_command(&self, id: Uuid, name: &str) -> Result<Service> {
        let mut service = self.load(id).await?;
        if service.custom_commands.remove(name).is_none() {
            return Err(Error::not_found("custom command", name));
        }
        service.updated_at = self.clock.now();
        self.repos.services.update_service(&service).await?;
        Ok(service)
    }

    /// With `requires_stop`, a running service is stopped first and restarted
    /// afterwards even when the command fails; the command's error wins.
    pub async fn execute_custom_command(&self, id: Uuid, name: &str, confirm_dangerous: bool) -> Result<CommandOutput> {
        let service = self.load(id).await?;
        let custom = service
            .custom_commands
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("custom command", name))?;
        if custom.dangerous && !confirm_dangerous {
            return Err(Error::validation(format!(
                "custom command '{}' is marked dangerous and needs explicit confirmation",
                name
            )));
        }
        validate_command(&custom.command)?;
        let site = self.load_site(service.site_id()).await?;

        let stopped_here = custom.requires_stop && service.is_running();
        if stopped_here {
            self.stop_service(id).await?;
        }

        let timeout = Duration::from_secs(custom.timeout_secs.min(MAX_CUSTOM_TIMEOUT_SECS));
        let result = self.run_as_site(&site, &service, &custom.command, timeout).await;

        if stopped_here {
            if let Err(restart) = self.start_service(id).await {
                warn!(service = service.name(), command = name, error = %restart, "Restart after custom command failed");
                if result.is_ok() {
                    return Err(restart);
                }
            }
        }
        result
    }

    // ==============================================================================
    // 4. Observability
    // ==============================================================================

    /// Probes `http://127.0.0.1:<port><path>`; 2xx and 3xx are healthy.
    /// The outcome is persisted either way.
    pub async fn health_check(&self, id: Uuid) -> Result<HealthState> {
        let mut service = self.load(id).await?;
        let path = service.commands.health_check.as_deref().unwrap_or("/");
        let url = format!("http://127.0.0.1:{}{}", service.port(), path);

        let mut health = HealthState {
            last_check: Some(self.clock.now()),
            ..Default::default()
        };
        match self.http.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                let healthy = status.is_success() || status.is_redirection();
                health.last_status = Some(healthy);
                health.status_code = Some(status.as_u16());
                if !healthy {
                    health.last_error = Some(format!("unexpected status {}", status));
                }
            }
            Err(e) => {
                health.last_status = Some(false);
                health.last_error = Some(e.to_string());
            }
        }

        debug!(url, healthy = ?health.last_status, "Health probe finished");
        service.health = health.clone();
        self.repos.services.update_service(&service).await?;
        Ok(health)
    }

    /// Last `lines` lines of the stdout (or stderr) log. A missing file is empty.
    pub async fn read_logs(&self, id: Uuid, lines: usize, stderr: bool) -> Result<Vec<String>> {
        let service = self.load(id).await?;
        let path = if stderr {
            &service.paths().stderr_log
        } else {
            &service.paths().stdout_log
        };
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let all: Vec<&str> = text.lines().collect();
        let skip = all.len().saturating_sub(lines);
        Ok(all[skip..].iter().map(|l| l.to_string()).collect())
    }
}
