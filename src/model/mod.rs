// src/model/mod.rs
//
// Entity Model: pure records, status state machines and the factories that
// compute derived fields. Nothing in here touches the OS.

pub mod database;
pub mod domain;
pub mod service;
pub mod site;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use database::{
    Database, DatabaseConnection, DatabaseKind, DatabaseStats, DatabaseStatus, DatabaseUser, SiteDatabasePolicy,
};
pub use domain::{Domain, DomainKind, DomainStatus, DnsVerification, ProxyState, SslKind, SslState, Target};
pub use service::{
    CommandSet, CustomCommand, DesiredState, HealthState, RunState, Runtime, Service, ServiceDraft, ServicePaths,
    ServiceStatus,
};
pub use site::{OsUser, Site, SiteDraft, SitePaths, SiteStatus};

/// Flat environment variables. Sorted so generated files are stable.
pub type EnvVars = BTreeMap<String, String>;

/// Inclusive range of ports reserved for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// Range of `size` ports following `previous_end`, or starting at `base`
    /// when no site has been allocated yet.
    pub fn next_after(previous_end: Option<u16>, base: u16, size: u16) -> Option<Self> {
        let start = match previous_end {
            Some(end) => end.checked_add(1)?.max(base),
            None => base,
        };
        let end = start.checked_add(size.checked_sub(1)?)?;
        Some(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Lowest port of the range not present in `used`.
    pub fn lowest_free<'a, I>(&self, used: I) -> Option<u16>
    where
        I: IntoIterator<Item = &'a u16>,
    {
        let taken: std::collections::HashSet<u16> = used.into_iter().copied().collect();
        (self.start..=self.end).find(|p| !taken.contains(p))
    }
}

/// cgroup caps written into every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub cpu_percent: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_percent: 100,
        }
    }
}
