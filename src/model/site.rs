// src/model/site.rs

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EnvVars, PortRange, ResourceLimits};
use crate::error::{Error, Result};

/// Prefix of every site's OS account. Deprovisioning refuses anything else.
pub const SITE_USER_PREFIX: &str = "twoine_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Pending,
    Creating,
    Active,
    Stopped,
    Error,
    Deleting,
    Deleted,
}

impl SiteStatus {
    pub fn can_transition_to(self, next: SiteStatus) -> bool {
        use SiteStatus::*;
        if self == next {
            return self != Deleted;
        }
        matches!(
            (self, next),
            (Pending, Creating)
                | (Pending, Deleting)
                | (Creating, Active)
                | (Creating, Deleting)
                | (Creating, Error)
                | (Active, Stopped)
                | (Active, Error)
                | (Active, Deleting)
                | (Stopped, Active)
                | (Stopped, Error)
                | (Stopped, Deleting)
                | (Error, Creating)
                | (Error, Deleting)
                | (Deleting, Deleted)
                | (Deleting, Error)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsUser {
    pub username: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub home: PathBuf,
    pub created: bool,
}

/// Directory tree of a site. Derived once from the root at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitePaths {
    pub root: PathBuf,
    pub services: PathBuf,
    pub logs: PathBuf,
    pub data: PathBuf,
    pub tmp: PathBuf,
}

impl SitePaths {
    pub fn under(sites_root: &Path, name: &str) -> Self {
        let root = sites_root.join(name);
        Self {
            services: root.join("services"),
            logs: root.join("logs"),
            data: root.join("data"),
            tmp: root.join("tmp"),
            root,
        }
    }

    /// Every directory with the mode it is secured with.
    pub fn with_modes(&self) -> [(&Path, u32); 5] {
        [
            (self.root.as_path(), 0o750),
            (self.services.as_path(), 0o750),
            (self.logs.as_path(), 0o750),
            (self.data.as_path(), 0o750),
            (self.tmp.as_path(), 0o700),
        ]
    }
}

/// Caller-supplied fields for a new site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteDraft {
    pub name: String,
    pub display_name: Option<String>,
    pub owner: String,
    pub limits: Option<ResourceLimits>,
    #[serde(default)]
    pub environment: EnvVars,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    name: String,
    pub display_name: String,
    pub owner: String,
    pub os_user: OsUser,
    paths: SitePaths,
    port_range: PortRange,
    pub limits: ResourceLimits,
    pub environment: EnvVars,
    pub(crate) status: SiteStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    /// Builds a pending site with every derived field computed.
    pub fn new(draft: SiteDraft, sites_root: &Path, port_range: PortRange, now: DateTime<Utc>) -> Self {
        let paths = SitePaths::under(sites_root, &draft.name);
        Self {
            id: Uuid::new_v4(),
            display_name: draft.display_name.unwrap_or_else(|| draft.name.clone()),
            owner: draft.owner,
            os_user: OsUser {
                username: format!("{}{}", SITE_USER_PREFIX, draft.name),
                uid: None,
                gid: None,
                home: paths.root.clone(),
                created: false,
            },
            paths,
            port_range,
            limits: draft.limits.unwrap_or_default(),
            environment: draft.environment,
            name: draft.name,
            status: SiteStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &SitePaths {
        &self.paths
    }

    pub fn port_range(&self) -> PortRange {
        self.port_range
    }

    pub fn status(&self) -> SiteStatus {
        self.status
    }

    pub fn username(&self) -> &str {
        &self.os_user.username
    }

    pub(crate) fn transition(&mut self, next: SiteStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "site '{}' cannot move from {:?} to {:?}",
                self.name, self.status, next
            )));
        }
        self.status = next;
        if next != SiteStatus::Error {
            self.error_message = None;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Records a provisioning/teardown failure. The record is kept for inspection.
    pub(crate) fn mark_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        if self.status != SiteStatus::Deleted {
            self.status = SiteStatus::Error;
        }
        self.error_message = Some(message.into());
        self.updated_at = now;
    }

    /// `created` is false when the account already existed before provisioning.
    pub(crate) fn bind_os_user(&mut self, uid: Option<u32>, gid: Option<u32>, created: bool) {
        self.os_user.uid = uid;
        self.os_user.gid = gid;
        self.os_user.created = created;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> Site {
        let draft = SiteDraft {
            name: "demo1".into(),
            owner: "u1".into(),
            ..Default::default()
        };
        Site::new(draft, Path::new("/var/www/twoine"), PortRange { start: 10000, end: 10009 }, Utc::now())
    }

    #[test]
    fn derived_fields_are_computed_once() {
        let s = site();
        assert_eq!(s.username(), "twoine_demo1");
        assert_eq!(s.display_name, "demo1");
        assert_eq!(s.paths().root, PathBuf::from("/var/www/twoine/demo1"));
        assert_eq!(s.paths().tmp, PathBuf::from("/var/www/twoine/demo1/tmp"));
        assert_eq!(s.os_user.home, s.paths().root);
        assert_eq!(s.status(), SiteStatus::Pending);
    }

    #[test]
    fn tmp_is_private() {
        let s = site();
        let modes = s.paths().with_modes();
        assert!(modes.iter().any(|(p, m)| *p == s.paths().tmp.as_path() && *m == 0o700));
        assert_eq!(modes.iter().filter(|(_, m)| *m == 0o750).count(), 4);
    }

    #[test]
    fn lifecycle_transitions() {
        let mut s = site();
        let now = Utc::now();
        s.transition(SiteStatus::Creating, now).unwrap();
        s.transition(SiteStatus::Active, now).unwrap();
        s.transition(SiteStatus::Deleting, now).unwrap();
        s.transition(SiteStatus::Deleted, now).unwrap();
        assert!(s.transition(SiteStatus::Active, now).is_err());
    }

    #[test]
    fn pending_cannot_jump_to_active() {
        let mut s = site();
        let err = s.transition(SiteStatus::Active, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn error_keeps_message_until_retry() {
        let mut s = site();
        let now = Utc::now();
        s.transition(SiteStatus::Creating, now).unwrap();
        s.mark_error("useradd failed", now);
        assert_eq!(s.status(), SiteStatus::Error);
        assert_eq!(s.error_message.as_deref(), Some("useradd failed"));
        s.transition(SiteStatus::Creating, now).unwrap();
        assert!(s.error_message.is_none());
    }
}
