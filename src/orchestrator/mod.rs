// src/orchestrator/mod.rs
//
// 🧠 The resource-lifecycle layer. Each orchestrator owns one entity kind and
// drives it through the OS adapters in `sys`; `ControlPlane` wires them
// together and owns the flows that span more than one kind.

pub mod database;
pub mod domain;
pub mod service;
pub mod site;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::model::{Site, SiteDatabasePolicy};
use crate::store::Repositories;
use crate::sys::secrets::CredentialCipher;
use crate::sys::traits::{Clock, CommandRunner, Notifier, SftpProvisioner, SystemClock};
use crate::sys::{
    LinuxJailManager, LinuxSslEngine, NginxManager, ScriptSftpProvisioner, SystemCommandRunner, SystemdSupervisor,
};

pub use database::{DatabaseEngine, DatabaseOrchestrator, ExistingObjects, ExternalDatabase, ProvisionedDatabase};
pub use domain::{AddDomain, DomainOrchestrator, DomainSettings, DomainTarget};
pub use service::{ServiceOrchestrator, ServiceUpdate};
pub use site::{BatchOutcome, DeleteSiteOptions, SiteOrchestrator, SiteSettings, SiteUpdate};

/// Lowercase wire name of a serde enum, as used in events.
pub(crate) fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// What a site deletion did beyond the site itself.
#[derive(Debug, Clone)]
pub struct SiteDeletion {
    pub site: Site,
    pub databases: BatchOutcome,
    pub domains_removed: usize,
}

pub struct ControlPlane {
    pub repos: Repositories,
    pub services: Arc<ServiceOrchestrator>,
    pub sites: Arc<SiteOrchestrator>,
    pub domains: Arc<DomainOrchestrator>,
    pub databases: Arc<DatabaseOrchestrator>,
}

impl ControlPlane {
    /// Production wiring: real process runner and wall clock.
    pub fn from_config(config: &AgentConfig, repos: Repositories, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new(config.use_sudo));
        Self::build(config, repos, runner, notifier, Arc::new(SystemClock))
    }

    /// Builds every adapter on top of `runner`, then the orchestrators.
    pub fn build(
        config: &AgentConfig,
        repos: Repositories,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let supervisor = Arc::new(SystemdSupervisor::new(
            runner.clone(),
            clock.clone(),
            config.systemd_dir.clone(),
            config.tmp_dir.clone(),
        ));
        let jail = Arc::new(LinuxJailManager::new(runner.clone()));
        let proxy = Arc::new(NginxManager::new(runner.clone(), config.nginx_dir.clone()));
        let ssl = Arc::new(LinuxSslEngine::new(runner.clone(), config.ssl_storage_dir.clone()));
        let sftp: Option<Arc<dyn SftpProvisioner>> = config
            .sftp_script
            .clone()
            .map(|script| Arc::new(ScriptSftpProvisioner::new(runner.clone(), script)) as Arc<dyn SftpProvisioner>);

        let services = Arc::new(ServiceOrchestrator::new(
            repos.clone(),
            supervisor,
            jail.clone(),
            runner.clone(),
            notifier.clone(),
            clock.clone(),
        )?);

        let sites = Arc::new(SiteOrchestrator::new(
            repos.clone(),
            services.clone(),
            jail,
            sftp,
            notifier.clone(),
            clock.clone(),
            SiteSettings {
                sites_root: config.sites_root.clone(),
                port_base: config.port_base,
                ports_per_site: config.ports_per_site,
                control_user: config.control_user.clone(),
            },
        ));

        let domains = Arc::new(DomainOrchestrator::new(
            repos.clone(),
            proxy,
            ssl,
            notifier,
            clock.clone(),
            DomainSettings {
                platform_port: config.platform_port,
                public_ips: config.public_ips.clone(),
                ..Default::default()
            },
        ));

        let engines: Vec<Arc<dyn DatabaseEngine>> = vec![
            Arc::new(database::MariaDbEngine::new(runner.clone(), config.databases.mariadb.clone())),
            Arc::new(database::PostgresEngine::new(runner.clone(), config.databases.postgres.clone())),
            Arc::new(database::MongoEngine::new(runner, config.databases.mongodb.clone())),
        ];
        let databases = Arc::new(DatabaseOrchestrator::new(
            repos.clone(),
            engines,
            CredentialCipher::new(&config.encryption_key)?,
            clock,
        ));

        Ok(Self {
            repos,
            services,
            sites,
            domains,
            databases,
        })
    }

    /// Deletes the site, applies `policy` to its databases, then removes the
    /// domains left pointing at it. Cascade failures are reported, not raised.
    pub async fn delete_site(
        &self,
        id: Uuid,
        options: DeleteSiteOptions,
        policy: SiteDatabasePolicy,
    ) -> Result<SiteDeletion> {
        let site = self.sites.delete_site(id, options).await?;

        let databases = match self.databases.apply_site_deletion(site.id, policy).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(site = %site.name(), error = %e, "Database cascade failed");
                BatchOutcome {
                    succeeded: Vec::new(),
                    failed: vec![("*".to_string(), e.to_string())],
                }
            }
        };

        let domains_removed = match self.domains.cleanup_orphan_domains().await {
            Ok(count) => count,
            Err(e) => {
                warn!(site = %site.name(), error = %e, "Domain cleanup failed");
                0
            }
        };

        info!(site = %site.name(), ?policy, domains_removed, "Site deletion cascade finished");
        Ok(SiteDeletion {
            site,
            databases,
            domains_removed,
        })
    }

    /// Housekeeping run once at boot: drop domains of vanished sites and
    /// flag those whose service is gone.
    pub async fn run_startup_jobs(&self) -> Result<()> {
        let orphans = self.domains.cleanup_orphan_domains().await?;
        let dangling = self.domains.cleanup_invalid_service_domains().await?;
        info!(orphans, dangling, "Startup cleanup finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatabaseStatus, DomainStatus, SiteStatus};
    use crate::testing::Harness;

    #[test]
    fn labels_use_the_wire_names() {
        assert_eq!(label(&SiteStatus::Active), "active");
        assert_eq!(label(&DomainStatus::Configuring), "configuring");
        assert_eq!(label(&DatabaseStatus::External), "external");
    }

    #[tokio::test]
    async fn site_deletion_cascades_to_databases_and_domains() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        let kept = h.databases.create_database(site.id, "mariadb", "shop").await.unwrap();
        h.domains
            .add_domain(AddDomain {
                domain: "shop.example.com".into(),
                target: DomainTarget {
                    site_id: Some(site.id),
                    port: Some(site.port_range().start),
                    ..Default::default()
                },
                ssl: false,
            })
            .await
            .unwrap();

        let deletion = h
            .plane
            .delete_site(site.id, DeleteSiteOptions::default(), SiteDatabasePolicy::Keep)
            .await
            .unwrap();
        assert_eq!(deletion.site.status(), SiteStatus::Deleted);
        assert_eq!(deletion.databases.succeeded, vec!["shop"]);
        assert_eq!(deletion.domains_removed, 1);

        let record = h.databases.get_database(kept.database.id).await.unwrap();
        assert!(record.orphaned);
        assert!(h.domains.list_domains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn startup_jobs_run_on_an_empty_store() {
        let h = Harness::new().await;
        h.plane.run_startup_jobs().await.unwrap();
        assert!(h.runner.calls().is_empty());
    }
}
