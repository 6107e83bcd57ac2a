// src/store/mod.rs
//
// Repository contracts. Every `get_*`, `find_*` and `list_*` method excludes
// records whose status is `deleted`; callers never filter for it themselves.
// Uniqueness constraints are likewise evaluated against non-deleted records only.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{Database, DatabaseKind, Domain, Service, Site};

pub use memory::MemoryStore;

#[async_trait]
pub trait SiteRepository: Send + Sync {
    /// Fails with `Conflict` when a non-deleted site already uses the name.
    async fn insert_site(&self, site: Site) -> Result<()>;
    async fn update_site(&self, site: &Site) -> Result<()>;
    async fn get_site(&self, id: Uuid) -> Result<Option<Site>>;
    async fn find_site_by_name(&self, name: &str) -> Result<Option<Site>>;
    async fn list_sites(&self) -> Result<Vec<Site>>;
    /// Highest port range end ever allocated, deleted sites included.
    async fn last_port_range_end(&self) -> Result<Option<u16>>;
}

#[async_trait]
pub trait ServiceRepository: Send + Sync {
    /// Fails with `Conflict` on a duplicate `(site, name)`, port or unit name.
    async fn insert_service(&self, service: Service) -> Result<()>;
    async fn update_service(&self, service: &Service) -> Result<()>;
    /// Removes the record permanently.
    async fn delete_service(&self, id: Uuid) -> Result<()>;
    async fn get_service(&self, id: Uuid) -> Result<Option<Service>>;
    async fn find_service(&self, site_id: Uuid, name: &str) -> Result<Option<Service>>;
    async fn list_site_services(&self, site_id: Uuid) -> Result<Vec<Service>>;
    async fn list_services(&self) -> Result<Vec<Service>>;
    async fn ports_in_use(&self) -> Result<Vec<u16>>;
}

#[async_trait]
pub trait DomainRepository: Send + Sync {
    /// Fails with `Conflict` when a non-deleted domain has the same hostname.
    async fn insert_domain(&self, domain: Domain) -> Result<()>;
    async fn update_domain(&self, domain: &Domain) -> Result<()>;
    async fn get_domain(&self, id: Uuid) -> Result<Option<Domain>>;
    async fn find_domain(&self, hostname: &str) -> Result<Option<Domain>>;
    async fn find_platform_domain(&self) -> Result<Option<Domain>>;
    async fn list_domains(&self) -> Result<Vec<Domain>>;
    async fn list_site_domains(&self, site_id: Uuid) -> Result<Vec<Domain>>;
}

#[async_trait]
pub trait DatabaseRepository: Send + Sync {
    /// Fails with `Conflict` on a duplicate `(kind, name)`.
    async fn insert_database(&self, database: Database) -> Result<()>;
    async fn update_database(&self, database: &Database) -> Result<()>;
    /// Removes the record permanently.
    async fn remove_database(&self, id: Uuid) -> Result<()>;
    async fn get_database(&self, id: Uuid) -> Result<Option<Database>>;
    async fn find_database(&self, kind: DatabaseKind, name: &str) -> Result<Option<Database>>;
    async fn list_site_databases(&self, site_id: Uuid) -> Result<Vec<Database>>;
}

/// The repository handles handed to every orchestrator.
#[derive(Clone)]
pub struct Repositories {
    pub sites: Arc<dyn SiteRepository>,
    pub services: Arc<dyn ServiceRepository>,
    pub domains: Arc<dyn DomainRepository>,
    pub databases: Arc<dyn DatabaseRepository>,
}

impl Repositories {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: SiteRepository + ServiceRepository + DomainRepository + DatabaseRepository + 'static,
    {
        Self {
            sites: store.clone(),
            services: store.clone(),
            domains: store.clone(),
            databases: store,
        }
    }
}
