// src/model/database.rs

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sys::secrets::EncryptedSecret;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Mariadb,
    Postgresql,
    Mongodb,
}

impl DatabaseKind {
    pub const ALL: [DatabaseKind; 3] = [DatabaseKind::Mariadb, DatabaseKind::Postgresql, DatabaseKind::Mongodb];

    pub fn default_port(self) -> u16 {
        match self {
            Self::Mariadb => 3306,
            Self::Postgresql => 5432,
            Self::Mongodb => 27017,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mariadb => "mariadb",
            Self::Postgresql => "postgresql",
            Self::Mongodb => "mongodb",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mariadb" | "mysql" => Ok(Self::Mariadb),
            "postgresql" | "postgres" => Ok(Self::Postgresql),
            "mongodb" | "mongo" => Ok(Self::Mongodb),
            other => Err(Error::validation(format!("unsupported database type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseStatus {
    Pending,
    Creating,
    Active,
    Error,
    Deleting,
    Deleted,
    External,
}

impl DatabaseStatus {
    pub fn can_transition_to(self, next: DatabaseStatus) -> bool {
        use DatabaseStatus::*;
        if next == Error {
            return self != Deleted;
        }
        matches!(
            (self, next),
            (Pending, Creating)
                | (Pending, External)
                | (Creating, Active)
                | (Active, Active)
                | (Active, Deleting)
                | (Error, Creating)
                | (Error, Deleting)
                | (External, External)
                | (External, Deleting)
                | (Deleting, Deleted)
        )
    }
}

/// What happens to a site's databases when the site is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiteDatabasePolicy {
    /// Drop the engine-side database and user.
    Delete,
    /// Keep record and schema, flag the record as orphaned.
    Keep,
    /// Remove the record only; the schema stays on the engine.
    #[default]
    Unlink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConnection {
    pub host: String,
    pub port: u16,
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseUser {
    pub username: String,
    pub password: Option<EncryptedSecret>,
    pub privileges: Vec<String>,
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub size_bytes: u64,
    pub tables: u64,
    pub collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub id: Uuid,
    pub site_id: Uuid,
    pub name: String,
    pub kind: DatabaseKind,
    pub is_external: bool,
    pub connection: DatabaseConnection,
    pub user: DatabaseUser,
    pub orphaned: bool,
    pub last_stats: Option<DatabaseStats>,
    pub(crate) status: DatabaseStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Database {
    pub fn new(
        site_id: Uuid,
        name: String,
        kind: DatabaseKind,
        connection: DatabaseConnection,
        user: DatabaseUser,
        is_external: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_id,
            name,
            kind,
            is_external,
            connection,
            user,
            orphaned: false,
            last_stats: None,
            status: DatabaseStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> DatabaseStatus {
        self.status
    }

    pub(crate) fn transition(&mut self, next: DatabaseStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "database '{}' cannot move from {:?} to {:?}",
                self.name, self.status, next
            )));
        }
        self.status = next;
        if next != DatabaseStatus::Error {
            self.error_message = None;
        }
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn mark_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = DatabaseStatus::Error;
        self.error_message = Some(message.into());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("MySQL".parse::<DatabaseKind>().unwrap(), DatabaseKind::Mariadb);
        assert_eq!("postgres".parse::<DatabaseKind>().unwrap(), DatabaseKind::Postgresql);
        assert_eq!("mongodb".parse::<DatabaseKind>().unwrap(), DatabaseKind::Mongodb);
        assert!("redis".parse::<DatabaseKind>().unwrap_err().is_validation());
    }

    #[test]
    fn default_policy_is_unlink() {
        assert_eq!(SiteDatabasePolicy::default(), SiteDatabasePolicy::Unlink);
    }

    #[test]
    fn external_records_skip_creation() {
        assert!(DatabaseStatus::Pending.can_transition_to(DatabaseStatus::External));
        assert!(!DatabaseStatus::External.can_transition_to(DatabaseStatus::Active));
        assert!(DatabaseStatus::External.can_transition_to(DatabaseStatus::Deleting));
    }
}
