// src/orchestrator/site.rs

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{ServiceOrchestrator, label};
use crate::error::{Error, Result};
use crate::model::{EnvVars, PortRange, ResourceLimits, Service, Site, SiteDraft, SiteStatus};
use crate::store::Repositories;
use crate::sys::traits::{Clock, Event, JailManager, Notifier, SftpProvisioner};
use crate::validate::{validate_env_var, validate_site_name};

/// Static settings a site is provisioned with.
#[derive(Debug, Clone)]
pub struct SiteSettings {
    pub sites_root: PathBuf,
    pub port_base: u16,
    pub ports_per_site: u16,
    /// Account of the control process; granted read access to every site tree.
    pub control_user: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteSiteOptions {
    /// Tear down running services instead of refusing.
    pub force: bool,
    /// Remove the directory tree as well.
    pub remove_files: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SiteUpdate {
    pub display_name: Option<String>,
    pub limits: Option<ResourceLimits>,
    pub environment: Option<EnvVars>,
}

/// Per-service result of a site-wide operation. One failure never aborts the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Canonical `candidate`, provided it lies strictly below canonical `root`.
/// `Ok(None)` when the candidate does not exist.
async fn strict_subpath(root: &Path, candidate: &Path) -> Result<Option<PathBuf>> {
    let candidate = match tokio::fs::canonicalize(candidate).await {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let root = tokio::fs::canonicalize(root).await?;
    if candidate == root || !candidate.starts_with(&root) {
        return Err(Error::validation(format!(
            "refusing to remove '{}': not inside '{}'",
            candidate.display(),
            root.display()
        )));
    }
    Ok(Some(candidate))
}

pub struct SiteOrchestrator {
    repos: Repositories,
    services: Arc<ServiceOrchestrator>,
    jail: Arc<dyn JailManager>,
    sftp: Option<Arc<dyn SftpProvisioner>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: SiteSettings,
}

impl SiteOrchestrator {
    pub fn new(
        repos: Repositories,
        services: Arc<ServiceOrchestrator>,
        jail: Arc<dyn JailManager>,
        sftp: Option<Arc<dyn SftpProvisioner>>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: SiteSettings,
    ) -> Self {
        Self {
            repos,
            services,
            jail,
            sftp,
            notifier,
            clock,
            settings,
        }
    }

    async fn load(&self, id: Uuid) -> Result<Site> {
        self.repos.sites.get_site(id).await?.ok_or_else(|| Error::not_found("site", id))
    }

    async fn save(&self, site: &Site) -> Result<()> {
        self.repos.sites.update_site(site).await?;
        self.notifier.notify(Event::SiteStatusChanged {
            site: site.name().to_string(),
            status: label(&site.status()),
        });
        Ok(())
    }

    pub async fn get_site(&self, id: Uuid) -> Result<Site> {
        self.load(id).await
    }

    pub async fn find_site(&self, name: &str) -> Result<Site> {
        self.repos
            .sites
            .find_site_by_name(name)
            .await?
            .ok_or_else(|| Error::not_found("site", name))
    }

    pub async fn list_sites(&self) -> Result<Vec<Site>> {
        self.repos.sites.list_sites().await
    }

    // ==============================================================================
    // 1. Provisioning
    // ==============================================================================

    /// Provisions a new tenant. On failure the record stays in `error` with the
    /// cause attached and the error is returned.
    pub async fn create_site(&self, draft: SiteDraft) -> Result<Site> {
        validate_site_name(&draft.name)?;
        for (key, value) in &draft.environment {
            validate_env_var(key, value)?;
        }
        if self.repos.sites.find_site_by_name(&draft.name).await?.is_some() {
            return Err(Error::conflict(format!("site '{}' already exists", draft.name)));
        }

        let previous_end = self.repos.sites.last_port_range_end().await?;
        let range = PortRange::next_after(previous_end, self.settings.port_base, self.settings.ports_per_site)
            .ok_or(Error::PortsExhausted {
                start: self.settings.port_base,
                end: u16::MAX,
            })?;

        let now = self.clock.now();
        let mut site = Site::new(draft, &self.settings.sites_root, range, now);
        site.transition(SiteStatus::Creating, now)?;
        self.repos.sites.insert_site(site.clone()).await?;
        info!(site = site.name(), start = range.start, end = range.end, "Site record created");

        self.provision_and_activate(&mut site).await?;
        Ok(site)
    }

    /// Re-runs provisioning for a site left in `error`.
    pub async fn retry_provisioning(&self, id: Uuid) -> Result<Site> {
        let mut site = self.load(id).await?;
        if site.status() != SiteStatus::Error {
            return Err(Error::invalid_state(format!(
                "site '{}' is {:?}; only failed sites can be re-provisioned",
                site.name(),
                site.status()
            )));
        }
        site.transition(SiteStatus::Creating, self.clock.now())?;
        self.save(&site).await?;
        self.provision_and_activate(&mut site).await?;
        Ok(site)
    }

    async fn provision_and_activate(&self, site: &mut Site) -> Result<()> {
        match self.provision(site).await {
            Ok(()) => {
                site.transition(SiteStatus::Active, self.clock.now())?;
                self.save(site).await?;
                info!(site = site.name(), "Site active");
                Ok(())
            }
            Err(e) => {
                error!(site = site.name(), error = %e, "Site provisioning failed");
                site.mark_error(e.to_string(), self.clock.now());
                if let Err(persist) = self.save(site).await {
                    warn!(site = site.name(), error = %persist, "Failed to persist site error");
                }
                Err(e)
            }
        }
    }

    async fn provision(&self, site: &mut Site) -> Result<()> {
        let username = site.username().to_string();
        let paths = site.paths().clone();

        let account = self.jail.provision_site_user(&username, &paths.root).await?;
        site.bind_os_user(account.uid, account.gid, account.created);

        for (dir, mode) in paths.with_modes() {
            self.jail.secure_directory(dir, &username, mode).await?;
        }
        self.jail.grant_read_acl(&paths.root, &self.settings.control_user).await?;

        if let Some(sftp) = &self.sftp {
            match sftp.create_account(site.name(), None).await {
                Ok(account) if account.success => info!(site = site.name(), "SFTP account ready"),
                Ok(account) => warn!(site = site.name(), error = ?account.error, "SFTP account not created"),
                Err(e) => warn!(site = site.name(), error = %e, "SFTP provisioner failed"),
            }
        }
        Ok(())
    }

    pub async fn update_site(&self, id: Uuid, update: SiteUpdate) -> Result<Site> {
        let mut site = self.load(id).await?;
        if let Some(env) = &update.environment {
            for (key, value) in env {
                validate_env_var(key, value)?;
            }
        }

        let env_changed = update.environment.is_some();
        if let Some(name) = update.display_name {
            site.display_name = name;
        }
        if let Some(limits) = update.limits {
            site.limits = limits;
        }
        if let Some(env) = update.environment {
            site.environment = env;
        }
        site.updated_at = self.clock.now();
        self.repos.sites.update_site(&site).await?;

        // Site variables live in every service's environment file.
        if env_changed {
            for service in self.repos.services.list_site_services(site.id).await? {
                if service.unit_file_created {
                    if let Err(e) = self.services.regenerate_unit(service.id).await {
                        warn!(service = service.name(), error = %e, "Failed to refresh service environment");
                    }
                }
            }
        }
        Ok(site)
    }

    // ==============================================================================
    // 2. Deletion
    // ==============================================================================

    pub async fn delete_site(&self, id: Uuid, options: DeleteSiteOptions) -> Result<Site> {
        let mut site = self.load(id).await?;
        let services = self.repos.services.list_site_services(site.id).await?;

        let running: Vec<&str> = services.iter().filter(|s| s.is_running()).map(Service::name).collect();
        if !running.is_empty() && !options.force {
            return Err(Error::invalid_state(format!(
                "site '{}' has running services: {}",
                site.name(),
                running.join(", ")
            )));
        }

        // 🛡️ Checked before anything is torn down.
        let tree = if options.remove_files {
            strict_subpath(&self.settings.sites_root, &site.paths().root).await?
        } else {
            None
        };

        site.transition(SiteStatus::Deleting, self.clock.now())?;
        self.save(&site).await?;

        for service in &services {
            self.services.teardown(service).await;
            if let Err(e) = self.repos.services.delete_service(service.id).await {
                warn!(service = service.name(), error = %e, "Failed to delete service record");
            }
        }

        if let Err(e) = self.jail.deprovision_site_user(site.username()).await {
            warn!(site = site.name(), username = site.username(), error = %e, "Failed to remove OS user");
        }

        if let Some(tree) = tree {
            if let Err(e) = tokio::fs::remove_dir_all(&tree).await {
                warn!(site = site.name(), path = %tree.display(), error = %e, "Failed to remove site tree");
            }
        }

        site.transition(SiteStatus::Deleted, self.clock.now())?;
        self.save(&site).await?;
        info!(site = site.name(), services = services.len(), "Site deleted");
        Ok(site)
    }

    // ==============================================================================
    // 3. Aggregate Lifecycle
    // ==============================================================================

    pub async fn start_site(&self, id: Uuid) -> Result<BatchOutcome> {
        let mut site = self.load(id).await?;
        let services = self.repos.services.list_site_services(site.id).await?;

        let mut outcome = BatchOutcome::default();
        for service in &services {
            match self.services.start_service(service.id).await {
                Ok(_) => outcome.succeeded.push(service.name().to_string()),
                Err(e) => outcome.failed.push((service.name().to_string(), e.to_string())),
            }
        }

        if site.status() == SiteStatus::Stopped {
            site.transition(SiteStatus::Active, self.clock.now())?;
            self.save(&site).await?;
        }
        Ok(outcome)
    }

    /// Stops in reverse start order.
    pub async fn stop_site(&self, id: Uuid) -> Result<BatchOutcome> {
        let mut site = self.load(id).await?;
        let services = self.repos.services.list_site_services(site.id).await?;

        let mut outcome = BatchOutcome::default();
        for service in services.iter().rev() {
            match self.services.stop_service(service.id).await {
                Ok(_) => outcome.succeeded.push(service.name().to_string()),
                Err(e) => outcome.failed.push((service.name().to_string(), e.to_string())),
            }
        }

        if site.status() == SiteStatus::Active {
            site.transition(SiteStatus::Stopped, self.clock.now())?;
            self.save(&site).await?;
        }
        Ok(outcome)
    }

    pub async fn restart_site(&self, id: Uuid) -> Result<BatchOutcome> {
        let mut site = self.load(id).await?;
        let services = self.repos.services.list_site_services(site.id).await?;

        let mut outcome = BatchOutcome::default();
        for service in &services {
            match self.services.restart_service(service.id).await {
                Ok(_) => outcome.succeeded.push(service.name().to_string()),
                Err(e) => outcome.failed.push((service.name().to_string(), e.to_string())),
            }
        }

        if site.status() == SiteStatus::Stopped {
            site.transition(SiteStatus::Active, self.clock.now())?;
            self.save(&site).await?;
        }
        Ok(outcome)
    }

    // ==============================================================================
    // 4. Path Resolution (file-manager collaborator)
    // ==============================================================================

    /// Absolute path of `relative` inside the site root. A leading `/` means
    /// the site root; `..` is never accepted.
    pub async fn resolve_path(&self, id: Uuid, relative: &str) -> Result<PathBuf> {
        let site = self.load(id).await?;
        let mut resolved = site.paths().root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Error::validation(format!("path '{}' escapes the site root", relative)));
                }
            }
        }
        Ok(resolved)
    }
}
