// src/model/domain.rs

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    /// The control panel's own hostname. At most one exists.
    Platform,
    Site,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Pending,
    Configuring,
    Active,
    Error,
    Deleting,
    Deleted,
}

impl DomainStatus {
    pub fn can_transition_to(self, next: DomainStatus) -> bool {
        use DomainStatus::*;
        if next == Error {
            return self != Deleted;
        }
        matches!(
            (self, next),
            (Pending, Configuring)
                | (Pending, Deleting)
                | (Configuring, Active)
                | (Configuring, Pending)
                | (Active, Configuring)
                | (Active, Pending)
                | (Active, Deleting)
                | (Error, Configuring)
                | (Error, Pending)
                | (Error, Deleting)
                | (Deleting, Deleted)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub address: String,
    pub port: u16,
}

impl Target {
    pub fn local(port: u16) -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SslKind {
    SelfSigned,
    Custom,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslState {
    pub enabled: bool,
    pub kind: Option<SslKind>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub generated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyState {
    pub config_path: Option<PathBuf>,
    pub enabled_path: Option<PathBuf>,
    pub configured: bool,
    pub last_reload: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsVerification {
    pub verified: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub resolved: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub domain: String,
    pub kind: DomainKind,
    pub site_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    pub target: Target,
    pub ssl: SslState,
    pub proxy: ProxyState,
    pub dns: DnsVerification,
    pub(crate) status: DomainStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Domain {
    /// `domain` must already be validated and lowercased.
    pub fn new(domain: String, kind: DomainKind, target: Target, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain,
            kind,
            site_id: None,
            service_id: None,
            target,
            ssl: SslState::default(),
            proxy: ProxyState::default(),
            dns: DnsVerification::default(),
            status: DomainStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> DomainStatus {
        self.status
    }

    pub fn is_platform(&self) -> bool {
        self.kind == DomainKind::Platform
    }

    /// File name of the vhost under sites-available/sites-enabled.
    pub fn config_file_name(&self) -> String {
        format!("twoine-{}.conf", self.domain)
    }

    pub(crate) fn transition(&mut self, next: DomainStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status == next {
            self.updated_at = now;
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "domain '{}' cannot move from {:?} to {:?}",
                self.domain, self.status, next
            )));
        }
        self.status = next;
        if next != DomainStatus::Error {
            self.error_message = None;
        }
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn mark_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = DomainStatus::Error;
        self.error_message = Some(message.into());
        self.updated_at = now;
    }

    pub(crate) fn clear_ssl(&mut self) {
        self.ssl = SslState::default();
    }
}
