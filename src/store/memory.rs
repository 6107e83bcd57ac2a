// src/store/memory.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{DatabaseRepository, DomainRepository, ServiceRepository, SiteRepository};
use crate::error::{Error, Result};
use crate::model::{Database, DatabaseKind, DatabaseStatus, Domain, DomainKind, DomainStatus, Service, Site, SiteStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    sites: HashMap<Uuid, Site>,
    services: HashMap<Uuid, Service>,
    domains: HashMap<Uuid, Domain>,
    databases: HashMap<Uuid, Database>,
}

/// In-process store. With a snapshot path, every mutation is written through
/// to a JSON file (temp file + rename) so state survives restarts. A mutation
/// only becomes visible once its snapshot is on disk.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    snapshot_path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            snapshot_path: None,
        }
    }

    /// Opens (or creates) a store persisted at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreState>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            sites = state.sites.len(),
            services = state.services.len(),
            domains = state.domains.len(),
            databases = state.databases.len(),
            "Loaded state snapshot"
        );

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
        })
    }

    /// Applies `mutate` to a copy of the state, persists the copy and only then
    /// swaps it in. An error from either step leaves the state untouched.
    async fn commit<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut StoreState) -> Result<T> + Send,
        T: Send,
    {
        let mut state = self.state.write().await;
        if self.snapshot_path.is_none() {
            return mutate(&mut state);
        }
        let mut next = state.clone();
        let out = mutate(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(out)
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "State snapshot written");
        Ok(())
    }
}

fn live_site(site: &Site) -> bool {
    site.status() != SiteStatus::Deleted
}

fn live_domain(domain: &Domain) -> bool {
    domain.status() != DomainStatus::Deleted
}

fn live_database(database: &Database) -> bool {
    database.status() != DatabaseStatus::Deleted
}

#[async_trait]
impl SiteRepository for MemoryStore {
    async fn insert_site(&self, site: Site) -> Result<()> {
        self.commit(move |state| {
            if state.sites.values().any(|s| live_site(s) && s.name() == site.name()) {
                return Err(Error::conflict(format!("site '{}' already exists", site.name())));
            }
            state.sites.insert(site.id, site);
            Ok(())
        })
        .await
    }

    async fn update_site(&self, site: &Site) -> Result<()> {
        self.commit(|state| match state.sites.get_mut(&site.id) {
            Some(slot) => {
                *slot = site.clone();
                Ok(())
            }
            None => Err(Error::not_found("site", site.id)),
        })
        .await
    }

    async fn get_site(&self, id: Uuid) -> Result<Option<Site>> {
        let state = self.state.read().await;
        Ok(state.sites.get(&id).filter(|s| live_site(s)).cloned())
    }

    async fn find_site_by_name(&self, name: &str) -> Result<Option<Site>> {
        let state = self.state.read().await;
        Ok(state.sites.values().find(|s| live_site(s) && s.name() == name).cloned())
    }

    async fn list_sites(&self) -> Result<Vec<Site>> {
        let state = self.state.read().await;
        let mut sites: Vec<Site> = state.sites.values().filter(|s| live_site(s)).cloned().collect();
        sites.sort_by_key(|s| s.created_at);
        Ok(sites)
    }

    async fn last_port_range_end(&self) -> Result<Option<u16>> {
        let state = self.state.read().await;
        Ok(state.sites.values().map(|s| s.port_range().end).max())
    }
}

#[async_trait]
impl ServiceRepository for MemoryStore {
    async fn insert_service(&self, service: Service) -> Result<()> {
        self.commit(move |state| {
            for existing in state.services.values() {
                if existing.site_id() == service.site_id() && existing.name() == service.name() {
                    return Err(Error::conflict(format!(
                        "service '{}' already exists in site '{}'",
                        service.name(),
                        service.site_name()
                    )));
                }
                if existing.port() == service.port() {
                    return Err(Error::conflict(format!("port {} is already in use", service.port())));
                }
                if existing.unit_name() == service.unit_name() {
                    return Err(Error::conflict(format!("unit '{}' already exists", service.unit_name())));
                }
            }
            state.services.insert(service.id, service);
            Ok(())
        })
        .await
    }

    async fn update_service(&self, service: &Service) -> Result<()> {
        self.commit(|state| match state.services.get_mut(&service.id) {
            Some(slot) => {
                *slot = service.clone();
                Ok(())
            }
            None => Err(Error::not_found("service", service.id)),
        })
        .await
    }

    async fn delete_service(&self, id: Uuid) -> Result<()> {
        self.commit(|state| match state.services.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::not_found("service", id)),
        })
        .await
    }

    async fn get_service(&self, id: Uuid) -> Result<Option<Service>> {
        Ok(self.state.read().await.services.get(&id).cloned())
    }

    async fn find_service(&self, site_id: Uuid, name: &str) -> Result<Option<Service>> {
        let state = self.state.read().await;
        Ok(state
            .services
            .values()
            .find(|s| s.site_id() == site_id && s.name() == name)
            .cloned())
    }

    async fn list_site_services(&self, site_id: Uuid) -> Result<Vec<Service>> {
        let state = self.state.read().await;
        let mut services: Vec<Service> = state.services.values().filter(|s| s.site_id() == site_id).cloned().collect();
        services.sort_by_key(|s| (s.start_priority, s.port()));
        Ok(services)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let state = self.state.read().await;
        let mut services: Vec<Service> = state.services.values().cloned().collect();
        services.sort_by_key(|s| s.port());
        Ok(services)
    }

    async fn ports_in_use(&self) -> Result<Vec<u16>> {
        let state = self.state.read().await;
        Ok(state.services.values().map(Service::port).collect())
    }
}

#[async_trait]
impl DomainRepository for MemoryStore {
    async fn insert_domain(&self, domain: Domain) -> Result<()> {
        self.commit(move |state| {
            if state.domains.values().any(|d| live_domain(d) && d.domain == domain.domain) {
                return Err(Error::conflict(format!("domain '{}' already exists", domain.domain)));
            }
            if domain.kind == DomainKind::Platform
                && state.domains.values().any(|d| live_domain(d) && d.kind == DomainKind::Platform)
            {
                return Err(Error::conflict("a platform domain already exists"));
            }
            state.domains.insert(domain.id, domain);
            Ok(())
        })
        .await
    }

    async fn update_domain(&self, domain: &Domain) -> Result<()> {
        self.commit(|state| {
            if state
                .domains
                .values()
                .any(|d| d.id != domain.id && live_domain(d) && d.domain == domain.domain)
            {
                return Err(Error::conflict(format!("domain '{}' already exists", domain.domain)));
            }
            match state.domains.get_mut(&domain.id) {
                Some(slot) => {
                    *slot = domain.clone();
                    Ok(())
                }
                None => Err(Error::not_found("domain", domain.id)),
            }
        })
        .await
    }

    async fn get_domain(&self, id: Uuid) -> Result<Option<Domain>> {
        let state = self.state.read().await;
        Ok(state.domains.get(&id).filter(|d| live_domain(d)).cloned())
    }

    async fn find_domain(&self, hostname: &str) -> Result<Option<Domain>> {
        let state = self.state.read().await;
        Ok(state.domains.values().find(|d| live_domain(d) && d.domain == hostname).cloned())
    }

    async fn find_platform_domain(&self) -> Result<Option<Domain>> {
        let state = self.state.read().await;
        Ok(state
            .domains
            .values()
            .find(|d| live_domain(d) && d.kind == DomainKind::Platform)
            .cloned())
    }

    async fn list_domains(&self) -> Result<Vec<Domain>> {
        let state = self.state.read().await;
        let mut domains: Vec<Domain> = state.domains.values().filter(|d| live_domain(d)).cloned().collect();
        domains.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(domains)
    }

    async fn list_site_domains(&self, site_id: Uuid) -> Result<Vec<Domain>> {
        let state = self.state.read().await;
        let mut domains: Vec<Domain> = state
            .domains
            .values()
            .filter(|d| live_domain(d) && d.site_id == Some(site_id))
            .cloned()
            .collect();
        domains.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(domains)
    }
}

#[async_trait]
impl DatabaseRepository for MemoryStore {
    async fn insert_database(&self, database: Database) -> Result<()> {
        self.commit(move |state| {
            if state
                .databases
                .values()
                .any(|d| live_database(d) && d.kind == database.kind && d.name == database.name)
            {
                return Err(Error::conflict(format!(
                    "{} database '{}' already exists",
                    database.kind, database.name
                )));
            }
            state.databases.insert(database.id, database);
            Ok(())
        })
        .await
    }

    async fn update_database(&self, database: &Database) -> Result<()> {
        self.commit(|state| match state.databases.get_mut(&database.id) {
            Some(slot) => {
                *slot = database.clone();
                Ok(())
            }
            None => Err(Error::not_found("database", database.id)),
        })
        .await
    }

    async fn remove_database(&self, id: Uuid) -> Result<()> {
        self.commit(|state| match state.databases.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::not_found("database", id)),
        })
        .await
    }

    async fn get_database(&self, id: Uuid) -> Result<Option<Database>> {
        let state = self.state.read().await;
        Ok(state.databases.get(&id).filter(|d| live_database(d)).cloned())
    }

    async fn find_database(&self, kind: DatabaseKind, name: &str) -> Result<Option<Database>> {
        let state = self.state.read().await;
        Ok(state
            .databases
            .values()
            .find(|d| live_database(d) && d.kind == kind && d.name == name)
            .cloned())
    }

    async fn list_site_databases(&self, site_id: Uuid) -> Result<Vec<Database>> {
        let state = self.state.read().await;
        let mut databases: Vec<Database> = state
            .databases
            .values()
            .filter(|d| live_database(d) && d.site_id == site_id)
            .cloned()
            .collect();
        databases.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(databases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortRange, SiteDraft, Target};
    use chrono::Utc;

    fn site(name: &str, start: u16) -> Site {
        Site::new(
            SiteDraft {
                name: name.into(),
                owner: "u1".into(),
                ..Default::default()
            },
            Path::new("/srv/sites"),
            PortRange { start, end: start + 9 },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn deleted_sites_are_invisible() {
        let store = MemoryStore::new();
        let mut s = site("demo1", 10000);
        store.insert_site(s.clone()).await.unwrap();
        assert!(store.get_site(s.id).await.unwrap().is_some());

        let now = Utc::now();
        s.transition(SiteStatus::Creating, now).unwrap();
        s.transition(SiteStatus::Deleting, now).unwrap();
        s.transition(SiteStatus::Deleted, now).unwrap();
        store.update_site(&s).await.unwrap();

        assert!(store.get_site(s.id).await.unwrap().is_none());
        assert!(store.find_site_by_name("demo1").await.unwrap().is_none());
        assert!(store.list_sites().await.unwrap().is_empty());
        // the range stays allocated
        assert_eq!(store.last_port_range_end().await.unwrap(), Some(10009));
        // and the name is free again
        store.insert_site(site("demo1", 10010)).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_site_name_conflicts() {
        let store = MemoryStore::new();
        store.insert_site(site("demo1", 10000)).await.unwrap();
        let err = store.insert_site(site("demo1", 10010)).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn single_platform_domain() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_domain(Domain::new("panel.example.com".into(), DomainKind::Platform, Target::local(3000), now))
            .await
            .unwrap();
        let err = store
            .insert_domain(Domain::new("admin.example.com".into(), DomainKind::Platform, Target::local(3000), now))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.find_platform_domain().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let s = site("demo1", 10000);
        {
            let store = MemoryStore::open(&path).await.unwrap();
            store.insert_site(s.clone()).await.unwrap();
        }

        let reopened = MemoryStore::open(&path).await.unwrap();
        let loaded = reopened.get_site(s.id).await.unwrap().unwrap();
        assert_eq!(loaded.name(), "demo1");
        assert_eq!(loaded.port_range(), PortRange { start: 10000, end: 10009 });
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = MemoryStore::open(&path).await.unwrap();
        let mut kept = site("demo1", 10000);
        store.insert_site(kept.clone()).await.unwrap();

        // A directory where the temp file goes makes every write fail.
        std::fs::create_dir(dir.path().join("state.json.tmp")).unwrap();

        let rejected = site("demo2", 10010);
        assert!(store.insert_site(rejected.clone()).await.is_err());
        assert!(store.get_site(rejected.id).await.unwrap().is_none());
        assert!(store.find_site_by_name("demo2").await.unwrap().is_none());
        assert_eq!(store.last_port_range_end().await.unwrap(), Some(10009));

        kept.display_name = "Renamed".into();
        assert!(store.update_site(&kept).await.is_err());
        assert_ne!(store.get_site(kept.id).await.unwrap().unwrap().display_name, "Renamed");

        // Once writes succeed again the name is still free.
        std::fs::remove_dir(dir.path().join("state.json.tmp")).unwrap();
        store.insert_site(rejected).await.unwrap();
        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_sites().await.unwrap().len(), 2);
    }
}
