// src/orchestrator/database/mod.rs
//
// Per-engine database and user provisioning. Passwords are encrypted before
// they are persisted and the plaintext is handed back exactly once.

pub mod mariadb;
pub mod mongodb;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{info, warn};
use uuid::Uuid;

use super::site::BatchOutcome;
use crate::error::{Error, Result};
use crate::model::{
    Database, DatabaseConnection, DatabaseKind, DatabaseStats, DatabaseStatus, DatabaseUser, SiteDatabasePolicy,
};
use crate::store::Repositories;
use crate::sys::secrets::{CredentialCipher, generate_password};
use crate::sys::traits::Clock;
use crate::validate::validate_database_name;

pub use mariadb::MariaDbEngine;
pub use mongodb::MongoEngine;
pub use postgres::PostgresEngine;

const USERNAME_PREFIX: &str = "tw_";
/// MariaDB's user name limit, the strictest of the three engines.
pub const MAX_USERNAME_LEN: usize = 32;
const PASSWORD_LENGTH: usize = 24;

// ==============================================================================
// 1. Engine Contract
// ==============================================================================

#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    fn kind(&self) -> DatabaseKind;
    /// Where a database managed by this engine is reached.
    fn connection(&self, database: &str) -> DatabaseConnection;
    /// Creates database and user, grants access. Returns the granted privileges.
    async fn create_database(&self, database: &str, username: &str, password: &SecretString) -> Result<Vec<String>>;
    /// Which of the two objects the server already holds.
    async fn existing(&self, database: &str, username: &str) -> Result<ExistingObjects>;
    /// Ends open sessions where the engine allows it, then drops database and user.
    async fn drop_database(&self, database: &str, username: &str) -> Result<()>;
    async fn set_password(&self, database: &str, username: &str, password: &SecretString) -> Result<()>;
    async fn stats(&self, database: &str) -> Result<DatabaseStats>;
    async fn test_connection(&self, connection: &DatabaseConnection, username: &str, password: &SecretString) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExistingObjects {
    pub database: bool,
    pub user: bool,
}

impl ExistingObjects {
    pub fn any(&self) -> bool {
        self.database || self.user
    }
}

// ==============================================================================
// 2. Naming
// ==============================================================================

fn fnv1a(input: &str) -> u32 {
    input
        .bytes()
        .fold(0x811c_9dc5_u32, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193))
}

/// `tw_<site>_<db>`. Site names never contain `_`, so the pair can be read
/// back from the name as long as nothing was rewritten. Any pair that had
/// characters folded to `_`, or that would exceed 32 characters, gets a
/// short hash of the original pair appended instead.
pub fn database_username(site: &str, database: &str) -> String {
    let raw = format!("{}_{}", site, database);
    let folded: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' { c } else { '_' }
        })
        .collect();

    if folded == raw && USERNAME_PREFIX.len() + raw.len() <= MAX_USERNAME_LEN {
        return format!("{}{}", USERNAME_PREFIX, raw);
    }

    let suffix = format!("_{:06x}", fnv1a(&raw) & 0x00ff_ffff);
    let keep = folded.len().min(MAX_USERNAME_LEN - USERNAME_PREFIX.len() - suffix.len());
    format!("{}{}{}", USERNAME_PREFIX, &folded[..keep], suffix)
}

// ==============================================================================
// 3. Orchestrator
// ==============================================================================

/// Result of a managed creation. The only time the plaintext leaves the agent.
#[derive(Debug)]
pub struct ProvisionedDatabase {
    pub database: Database,
    pub password: SecretString,
}

pub struct ExternalDatabase {
    pub site_id: Uuid,
    pub kind: String,
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    /// Remote database name; defaults to `name`.
    pub database: Option<String>,
    pub username: String,
    pub password: SecretString,
}

pub struct DatabaseOrchestrator {
    repos: Repositories,
    engines: HashMap<DatabaseKind, Arc<dyn DatabaseEngine>>,
    cipher: CredentialCipher,
    clock: Arc<dyn Clock>,
}

impl DatabaseOrchestrator {
    pub fn new(
        repos: Repositories,
        engines: Vec<Arc<dyn DatabaseEngine>>,
        cipher: CredentialCipher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let engines = engines.into_iter().map(|engine| (engine.kind(), engine)).collect();
        Self {
            repos,
            engines,
            cipher,
            clock,
        }
    }

    fn engine(&self, kind: DatabaseKind) -> Result<&Arc<dyn DatabaseEngine>> {
        self.engines
            .get(&kind)
            .ok_or_else(|| Error::validation(format!("no {} engine is configured", kind)))
    }

    async fn load(&self, id: Uuid) -> Result<Database> {
        self.repos
            .databases
            .get_database(id)
            .await?
            .ok_or_else(|| Error::not_found("database", id))
    }

    async fn ensure_unique(&self, kind: DatabaseKind, name: &str) -> Result<()> {
        if self.repos.databases.find_database(kind, name).await?.is_some() {
            return Err(Error::conflict(format!("{} database '{}' already exists", kind, name)));
        }
        Ok(())
    }

    pub async fn get_database(&self, id: Uuid) -> Result<Database> {
        self.load(id).await
    }

    pub async fn list_site_databases(&self, site_id: Uuid) -> Result<Vec<Database>> {
        self.repos.databases.list_site_databases(site_id).await
    }

    /// Provisions database and user on the engine and returns the generated
    /// password. Objects already present on the server are a conflict and are
    /// never touched. A failed engine call leaves the record in `error` after a
    /// best-effort drop of what this call created.
    pub async fn create_database(&self, site_id: Uuid, kind: &str, name: &str) -> Result<ProvisionedDatabase> {
        let kind: DatabaseKind = kind.parse()?;
        let engine = self.engine(kind)?.clone();
        validate_database_name(name)?;
        let site = self
            .repos
            .sites
            .get_site(site_id)
            .await?
            .ok_or_else(|| Error::not_found("site", site_id))?;
        self.ensure_unique(kind, name).await?;

        let username = database_username(site.name(), name);
        let existing = engine.existing(name, &username).await?;
        if existing.any() {
            warn!(database = name, username = %username, ?existing, "Refusing to provision over existing objects");
            return Err(Error::conflict(format!(
                "{} already holds {}",
                kind,
                match (existing.database, existing.user) {
                    (true, true) => format!("database '{}' and user '{}'", name, username),
                    (true, false) => format!("database '{}'", name),
                    _ => format!("user '{}'", username),
                }
            )));
        }

        let password = generate_password(PASSWORD_LENGTH);
        let encrypted = self.cipher.encrypt(&password)?;

        let user = DatabaseUser {
            username: username.clone(),
            password: None,
            privileges: Vec::new(),
            created: false,
        };
        let mut record = Database::new(
            site.id,
            name.to_string(),
            kind,
            engine.connection(name),
            user,
            false,
            self.clock.now(),
        );
        record.transition(DatabaseStatus::Creating, self.clock.now())?;
        self.repos.databases.insert_database(record.clone()).await?;

        match engine.create_database(name, &username, &password).await {
            Ok(privileges) => {
                record.user.password = Some(encrypted);
                record.user.privileges = privileges;
                record.user.created = true;
                record.transition(DatabaseStatus::Active, self.clock.now())?;
                self.repos.databases.update_database(&record).await?;
                info!(site = %site.name(), database = name, kind = %kind, username = %username, "Database provisioned");
                Ok(ProvisionedDatabase {
                    database: record,
                    password,
                })
            }
            Err(e) => {
                // Neither object existed before this call, so anything left
                // behind is ours to drop.
                if let Err(cleanup) = engine.drop_database(name, &username).await {
                    warn!(database = name, error = %cleanup, "Cleanup after failed creation also failed");
                }
                record.mark_error(e.to_string(), self.clock.now());
                if let Err(persist) = self.repos.databases.update_database(&record).await {
                    warn!(database = name, error = %persist, "Failed to persist database error");
                }
                Err(e)
            }
        }
    }

    /// Records an existing database. Nothing is created on any engine.
    pub async fn link_external(&self, request: ExternalDatabase) -> Result<Database> {
        let kind: DatabaseKind = request.kind.parse()?;
        validate_database_name(&request.name)?;
        let host = request.host.trim();
        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
            return Err(Error::validation(format!("invalid database host '{}'", request.host)));
        }
        if request.username.trim().is_empty() {
            return Err(Error::validation("an external database needs a username"));
        }
        if self.repos.sites.get_site(request.site_id).await?.is_none() {
            return Err(Error::not_found("site", request.site_id));
        }
        self.ensure_unique(kind, &request.name).await?;

        let connection = DatabaseConnection {
            host: host.to_string(),
            port: request.port.unwrap_or_else(|| kind.default_port()),
            database: request.database.unwrap_or_else(|| request.name.clone()),
        };
        let user = DatabaseUser {
            username: request.username,
            password: Some(self.cipher.encrypt(&request.password)?),
            privileges: Vec::new(),
            created: false,
        };
        let mut record = Database::new(request.site_id, request.name, kind, connection, user, true, self.clock.now());
        record.transition(DatabaseStatus::External, self.clock.now())?;
        self.repos.databases.insert_database(record.clone()).await?;
        info!(database = %record.name, kind = %kind, host = %record.connection.host, "External database linked");
        Ok(record)
    }

    /// Drops database and user for managed records, then marks the record
    /// deleted. Engine failures are logged and never returned.
    pub async fn delete_database(&self, id: Uuid) -> Result<()> {
        let mut record = self.load(id).await?;
        if !record.status().can_transition_to(DatabaseStatus::Deleting) {
            record.mark_error("deletion interrupted an unfinished operation", self.clock.now());
        }
        record.transition(DatabaseStatus::Deleting, self.clock.now())?;
        self.repos.databases.update_database(&record).await?;

        if !record.is_external && record.user.created {
            match self.engine(record.kind) {
                Ok(engine) => {
                    if let Err(e) = engine.drop_database(&record.name, &record.user.username).await {
                        warn!(database = %record.name, kind = %record.kind, error = %e, "Engine drop failed, continuing");
                    }
                }
                Err(e) => warn!(database = %record.name, error = %e, "Engine unavailable, schema left in place"),
            }
        }

        record.transition(DatabaseStatus::Deleted, self.clock.now())?;
        self.repos.databases.update_database(&record).await?;
        info!(database = %record.name, kind = %record.kind, "Database deleted");
        Ok(())
    }

    /// Rotates the password of a managed database; returns the new plaintext once.
    pub async fn reset_password(&self, id: Uuid) -> Result<SecretString> {
        let mut record = self.load(id).await?;
        if record.is_external {
            return Err(Error::validation(format!(
                "'{}' is external; its credentials are managed elsewhere",
                record.name
            )));
        }
        if record.status() != DatabaseStatus::Active {
            return Err(Error::invalid_state(format!(
                "database '{}' is {:?}, not active",
                record.name,
                record.status()
            )));
        }

        let engine = self.engine(record.kind)?;
        let password = generate_password(PASSWORD_LENGTH);
        let encrypted = self.cipher.encrypt(&password)?;
        engine.set_password(&record.name, &record.user.username, &password).await?;

        record.user.password = Some(encrypted);
        record.updated_at = self.clock.now();
        self.repos.databases.update_database(&record).await?;
        info!(database = %record.name, username = %record.user.username, "Database password rotated");
        Ok(password)
    }

    pub async fn get_stats(&self, id: Uuid) -> Result<DatabaseStats> {
        let mut record = self.load(id).await?;
        if record.is_external {
            return Err(Error::validation(format!("no statistics for external database '{}'", record.name)));
        }
        let engine = self.engine(record.kind)?;
        let mut stats = engine.stats(&record.name).await?;
        stats.collected_at = Some(self.clock.now());

        record.last_stats = Some(stats.clone());
        record.updated_at = self.clock.now();
        self.repos.databases.update_database(&record).await?;
        Ok(stats)
    }

    /// Connects with the stored credentials. Unreachable or rejected is
    /// `Ok(false)`; a record without usable credentials is an error.
    pub async fn test_connection(&self, id: Uuid) -> Result<bool> {
        let record = self.load(id).await?;
        let engine = self.engine(record.kind)?;
        let sealed = record
            .user
            .password
            .as_ref()
            .ok_or_else(|| Error::invalid_state(format!("database '{}' has no stored password", record.name)))?;
        let password = self.cipher.decrypt(sealed)?;

        match engine
            .test_connection(&record.connection, &record.user.username, &password)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(database = %record.name, host = %record.connection.host, error = %e, "Connection test failed");
                Ok(false)
            }
        }
    }

    /// Applies the caller's cascade policy to every database of a deleted site.
    pub async fn apply_site_deletion(&self, site_id: Uuid, policy: SiteDatabasePolicy) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for mut record in self.repos.databases.list_site_databases(site_id).await? {
            let name = record.name.clone();
            let result = match policy {
                SiteDatabasePolicy::Delete => self.delete_database(record.id).await,
                SiteDatabasePolicy::Keep => {
                    record.orphaned = true;
                    record.updated_at = self.clock.now();
                    self.repos.databases.update_database(&record).await
                }
                SiteDatabasePolicy::Unlink => self.repos.databases.remove_database(record.id).await,
            };
            match result {
                Ok(()) => outcome.succeeded.push(name),
                Err(e) => {
                    warn!(database = %name, ?policy, error = %e, "Site cascade failed for database");
                    outcome.failed.push((name, e.to_string()));
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::traits::{CommandOutput, CommandSpec};
    use crate::testing::{Harness, matching};
    use secrecy::ExposeSecret;

    #[test]
    fn short_names_are_kept_whole() {
        assert_eq!(database_username("demo1", "app"), "tw_demo1_app");
        let folded = database_username("my-site", "db");
        assert!(folded.starts_with("tw_my_site_db_"), "{}", folded);
        assert_eq!(folded.len(), "tw_my_site_db_".len() + 6);
    }

    #[test]
    fn folded_names_never_collide_with_other_pairs() {
        let hyphenated = database_username("ab-cd", "ef");
        let underscored = database_username("ab", "cd_ef");
        assert_eq!(underscored, "tw_ab_cd_ef");
        assert_ne!(hyphenated, underscored);
        assert_ne!(database_username("ab-cd", "ef"), database_username("ab-c", "d_ef"));
    }

    #[test]
    fn usernames_never_exceed_the_limit() {
        let longest_site = "a".repeat(24);
        let longest_db = "b".repeat(63);
        for site_len in [2, 10, 23, 24] {
            for db_len in [2, 5, 6, 7, 20, 63] {
                let name = database_username(&longest_site[..site_len], &longest_db[..db_len]);
                assert!(name.len() <= MAX_USERNAME_LEN, "{} is {} chars", name, name.len());
                assert!(name.starts_with("tw_"));
            }
        }
        // Exactly at the boundary: 3 + 24 + 1 + 4 = 32.
        let boundary = database_username(&longest_site, "bbbb");
        assert_eq!(boundary.len(), 32);
        assert!(!boundary.contains("bbbb_"));
    }

    #[test]
    fn truncated_names_stay_distinct() {
        let site = "a".repeat(24);
        let first = database_username(&site, "orders_archive_2023");
        let second = database_username(&site, "orders_archive_2024");
        assert_eq!(first.len(), 32);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn create_returns_the_password_once_and_stores_it_encrypted() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;

        let provisioned = h.databases.create_database(site.id, "postgres", "app_db").await.unwrap();
        let record = provisioned.database;
        assert_eq!(record.status(), DatabaseStatus::Active);
        assert_eq!(record.kind, DatabaseKind::Postgresql);
        assert_eq!(record.user.username, "tw_demo1_app_db");
        assert!(record.user.created);
        assert_eq!(provisioned.password.expose_secret().len(), 24);

        let sealed = record.user.password.clone().unwrap();
        assert!(!sealed.ciphertext.contains(provisioned.password.expose_secret().as_str()));
        let stored = h.databases.get_database(record.id).await.unwrap();
        let serialized = serde_json::to_string(&stored).unwrap();
        assert!(!serialized.contains(provisioned.password.expose_secret().as_str()));
        assert!(h.runner.ran("psql"));
    }

    #[tokio::test]
    async fn creation_checks_inputs_before_touching_the_engine() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;

        assert!(h.databases.create_database(site.id, "oracle", "app").await.unwrap_err().is_validation());
        assert!(h.databases.create_database(site.id, "mariadb", "App;DROP").await.unwrap_err().is_validation());
        assert!(
            h.databases
                .create_database(Uuid::new_v4(), "mariadb", "app")
                .await
                .unwrap_err()
                .is_not_found()
        );
        h.databases.create_database(site.id, "mariadb", "app").await.unwrap();
        h.runner.clear();
        assert!(h.databases.create_database(site.id, "mysql", "app").await.unwrap_err().is_conflict());
        assert!(h.runner.calls().is_empty());
        // Same name on another engine is fine.
        h.databases.create_database(site.id, "mongodb", "app").await.unwrap();
    }

    #[tokio::test]
    async fn engine_failure_marks_error_and_cleans_up() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        h.runner.fail_when(
            |spec| spec.program == "mariadb" && spec.stdin.as_deref().is_some_and(|s| s.contains("CREATE USER")),
            "ERROR 1396: Operation CREATE USER failed",
        );

        let err = h.databases.create_database(site.id, "mariadb", "app").await.unwrap_err();
        assert!(err.to_string().contains("1396"));
        let record = h.databases.list_site_databases(site.id).await.unwrap().remove(0);
        assert_eq!(record.status(), DatabaseStatus::Error);
        assert!(record.user.password.is_none());
        assert!(
            h.runner
                .calls()
                .iter()
                .any(|c| c.stdin.as_deref().is_some_and(|s| s.contains("DROP DATABASE IF EXISTS `app`")))
        );
    }

    #[tokio::test]
    async fn schema_left_on_the_server_is_never_dropped() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        h.databases.create_database(site.id, "mariadb", "shop").await.unwrap();
        h.databases.apply_site_deletion(site.id, SiteDatabasePolicy::Unlink).await.unwrap();

        // The unlinked schema and its user are still on the server.
        h.runner.respond(
            |spec: &CommandSpec| {
                spec.stdin
                    .as_deref()
                    .is_some_and(|sql| sql.contains("information_schema.schemata"))
            },
            CommandOutput::ok("1\t1\n"),
        );
        h.runner.fail_when(
            |spec: &CommandSpec| spec.stdin.as_deref().is_some_and(|sql| sql.contains("CREATE DATABASE")),
            "ERROR 1007: database exists",
        );
        h.runner.clear();

        let err = h.databases.create_database(site.id, "mariadb", "shop").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("'shop'"));
        assert!(!h.runner.calls().iter().any(|c| {
            c.stdin
                .as_deref()
                .is_some_and(|sql| sql.contains("DROP") || sql.contains("CREATE"))
        }));
        assert!(h.databases.list_site_databases(site.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_owned_by_another_site_blocks_creation() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        h.runner.respond(
            |spec: &CommandSpec| spec.stdin.as_deref().is_some_and(|sql| sql.contains("pg_roles")),
            CommandOutput::ok("0|1\n"),
        );
        h.runner.clear();

        let err = h.databases.create_database(site.id, "postgres", "shop").await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("user 'tw_demo1_shop'"));
        assert!(!h.runner.calls().iter().any(|c| {
            c.stdin
                .as_deref()
                .is_some_and(|sql| sql.contains("DROP ROLE"))
        }));
    }

    fn external(site_id: Uuid) -> ExternalDatabase {
        ExternalDatabase {
            site_id,
            kind: "postgresql".into(),
            name: "legacy".into(),
            host: "db.internal".into(),
            port: None,
            database: Some("legacy_prod".into()),
            username: "legacy_user".into(),
            password: SecretString::new("given-password".into()),
        }
    }

    #[tokio::test]
    async fn external_databases_are_only_linked() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        h.runner.clear();

        let linked = h.databases.link_external(external(site.id)).await.unwrap();
        assert_eq!(linked.status(), DatabaseStatus::External);
        assert_eq!(linked.connection.port, 5432);
        assert_eq!(linked.connection.database, "legacy_prod");
        assert!(h.runner.calls().is_empty());

        assert!(matches!(h.databases.reset_password(linked.id).await, Err(Error::Validation(_))));
        assert!(h.databases.get_stats(linked.id).await.is_err());

        assert!(h.databases.test_connection(linked.id).await.unwrap());
        let call = h.runner.calls().remove(0);
        assert!(call.display().contains("-h db.internal -p 5432 -U legacy_user -d legacy_prod"));
        assert!(call.env.contains(&("PGPASSWORD".to_string(), "given-password".to_string())));

        h.runner.clear();
        h.databases.delete_database(linked.id).await.unwrap();
        assert!(h.runner.calls().is_empty());
        assert!(h.databases.list_site_databases(site.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_connection_test_is_false() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        let linked = h.databases.link_external(external(site.id)).await.unwrap();
        h.runner.fail_when(matching("psql"), "connection refused");
        assert!(!h.databases.test_connection(linked.id).await.unwrap());
    }

    #[tokio::test]
    async fn password_reset_rotates_the_stored_ciphertext() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        let first = h.databases.create_database(site.id, "mariadb", "app").await.unwrap();

        let rotated = h.databases.reset_password(first.database.id).await.unwrap();
        assert_ne!(rotated.expose_secret(), first.password.expose_secret());
        let stored = h.databases.get_database(first.database.id).await.unwrap();
        assert_ne!(stored.user.password, first.database.user.password);
        assert!(h.runner.calls().iter().any(|c| {
            c.stdin
                .as_deref()
                .is_some_and(|s| s.contains("ALTER USER 'tw_demo1_app'@'%'"))
        }));
    }

    #[tokio::test]
    async fn deletion_is_best_effort() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        let created = h.databases.create_database(site.id, "mongodb", "app").await.unwrap();
        h.runner.fail_when(matching("dropDatabase"), "not primary");

        h.databases.delete_database(created.database.id).await.unwrap();
        assert!(h.databases.get_database(created.database.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn stats_are_cached_on_the_record() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;
        let created = h.databases.create_database(site.id, "postgres", "app").await.unwrap();
        h.runner.respond(matching("-d app"), CommandOutput::ok("4096|2\n"));

        let stats = h.databases.get_stats(created.database.id).await.unwrap();
        assert_eq!(stats.tables, 2);
        assert!(stats.collected_at.is_some());
        let stored = h.databases.get_database(created.database.id).await.unwrap();
        assert_eq!(stored.last_stats, Some(stats));
    }

    #[tokio::test]
    async fn site_cascade_policies() {
        let h = Harness::new().await;
        let site = h.active_site("demo1").await;

        // keep: record stays, flagged orphaned
        let kept = h.databases.create_database(site.id, "mariadb", "kept").await.unwrap();
        let outcome = h.databases.apply_site_deletion(site.id, SiteDatabasePolicy::Keep).await.unwrap();
        assert_eq!(outcome.succeeded, vec!["kept"]);
        assert!(h.databases.get_database(kept.database.id).await.unwrap().orphaned);

        // unlink: record gone, engine untouched
        h.runner.clear();
        h.databases.apply_site_deletion(site.id, SiteDatabasePolicy::Unlink).await.unwrap();
        assert!(h.databases.get_database(kept.database.id).await.is_err());
        assert!(h.runner.calls().is_empty());

        // delete: engine drop issued
        let dropped = h.databases.create_database(site.id, "mariadb", "dropped").await.unwrap();
        h.databases.apply_site_deletion(site.id, SiteDatabasePolicy::Delete).await.unwrap();
        assert!(h.databases.get_database(dropped.database.id).await.is_err());
        assert!(
            h.runner
                .calls()
                .iter()
                .any(|c| c.stdin.as_deref().is_some_and(|s| s.contains("DROP DATABASE IF EXISTS `dropped`")))
        );
    }
}
