// src/orchestrator/database/postgres.rs

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use super::{DatabaseEngine, ExistingObjects};
use crate::config::EngineAdminConfig;
use crate::error::{Error, Result};
use crate::model::{DatabaseConnection, DatabaseKind, DatabaseStats};
use crate::sys::traits::{CommandRunner, CommandSpec};

const PEER_ACCOUNT: &str = "postgres";

pub struct PostgresEngine {
    runner: Arc<dyn CommandRunner>,
    admin: EngineAdminConfig,
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

impl PostgresEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, admin: EngineAdminConfig) -> Self {
        Self { runner, admin }
    }

    /// `psql` as the admin role: TCP plus `PGPASSWORD`, or peer auth as the
    /// `postgres` account when no password is configured.
    fn admin_command(&self, database: &str) -> CommandSpec {
        let spec = CommandSpec::new("psql").args(["-X", "-q", "-t", "-A", "-v", "ON_ERROR_STOP=1"]);
        let spec = match &self.admin.admin_password {
            Some(password) => spec
                .args(["-h", self.admin.host.as_str(), "-p"])
                .arg(self.admin.port.to_string())
                .args(["-U", self.admin.admin_user.as_str()])
                .env("PGPASSWORD", password.expose_secret().as_str()),
            None => spec.run_as(PEER_ACCOUNT),
        };
        spec.args(["-d", database])
    }
}

#[async_trait]
impl DatabaseEngine for PostgresEngine {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgresql
    }

    fn connection(&self, database: &str) -> DatabaseConnection {
        DatabaseConnection {
            host: self.admin.host.clone(),
            port: self.admin.port,
            database: database.to_string(),
        }
    }

    async fn create_database(&self, database: &str, username: &str, password: &SecretString) -> Result<Vec<String>> {
        // psql runs each statement in autocommit, which CREATE DATABASE requires.
        let sql = format!(
            "CREATE USER {user} WITH PASSWORD {pw};\n\
             CREATE DATABASE {db} OWNER {user} ENCODING 'UTF8';\n\
             REVOKE ALL ON DATABASE {db} FROM PUBLIC;\n\
             GRANT ALL PRIVILEGES ON DATABASE {db} TO {user};\n",
            user = ident(username),
            db = ident(database),
            pw = literal(password.expose_secret()),
        );
        self.runner.run_checked(&self.admin_command("postgres").stdin(sql)).await?;
        info!(database, username, "PostgreSQL database created");
        Ok(vec!["ALL PRIVILEGES".to_string(), "OWNER".to_string()])
    }

    async fn existing(&self, database: &str, username: &str) -> Result<ExistingObjects> {
        let sql = format!(
            "SELECT (SELECT count(*) FROM pg_database WHERE datname = {}), \
             (SELECT count(*) FROM pg_roles WHERE rolname = {});\n",
            literal(database),
            literal(username)
        );
        let output = self.runner.run_checked(&self.admin_command("postgres").stdin(sql)).await?;
        parse_existing(&output.stdout)
    }

    async fn drop_database(&self, database: &str, username: &str) -> Result<()> {
        let sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = {name} AND pid <> pg_backend_pid();\n\
             DROP DATABASE IF EXISTS {db};\n\
             DROP ROLE IF EXISTS {user};\n",
            name = literal(database),
            db = ident(database),
            user = ident(username),
        );
        self.runner.run_checked(&self.admin_command("postgres").stdin(sql)).await?;
        Ok(())
    }

    async fn set_password(&self, _database: &str, username: &str, password: &SecretString) -> Result<()> {
        let sql = format!(
            "ALTER ROLE {} WITH PASSWORD {};\n",
            ident(username),
            literal(password.expose_secret())
        );
        self.runner.run_checked(&self.admin_command("postgres").stdin(sql)).await?;
        Ok(())
    }

    async fn stats(&self, database: &str) -> Result<DatabaseStats> {
        let sql = "SELECT pg_database_size(current_database()), \
                   (SELECT count(*) FROM information_schema.tables \
                    WHERE table_schema NOT IN ('pg_catalog', 'information_schema'));\n";
        let output = self.runner.run_checked(&self.admin_command(database).stdin(sql)).await?;
        parse_stats(&output.stdout)
    }

    async fn test_connection(&self, connection: &DatabaseConnection, username: &str, password: &SecretString) -> Result<()> {
        let spec = CommandSpec::new("psql")
            .args(["-X", "-q", "-t", "-A", "-h", connection.host.as_str(), "-p"])
            .arg(connection.port.to_string())
            .args(["-U", username, "-d", connection.database.as_str(), "-c", "SELECT 1"])
            .env("PGPASSWORD", password.expose_secret().as_str());
        self.runner.run_checked(&spec).await?;
        Ok(())
    }
}

/// `<databases>|<roles>` counts.
fn parse_existing(stdout: &str) -> Result<ExistingObjects> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let invalid = || Error::validation(format!("unexpected PostgreSQL existence output: '{}'", line));
    let (databases, roles) = line.split_once('|').ok_or_else(invalid)?;
    let databases: u64 = databases.parse().map_err(|_| invalid())?;
    let roles: u64 = roles.parse().map_err(|_| invalid())?;
    Ok(ExistingObjects {
        database: databases > 0,
        user: roles > 0,
    })
}

/// Unaligned tuples-only output: `<bytes>|<tables>`.
fn parse_stats(stdout: &str) -> Result<DatabaseStats> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let invalid = || Error::validation(format!("unexpected PostgreSQL stats output: '{}'", line));
    let (size, tables) = line.split_once('|').ok_or_else(invalid)?;
    Ok(DatabaseStats {
        size_bytes: size.parse().map_err(|_| invalid())?,
        tables: tables.parse().map_err(|_| invalid())?,
        collected_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::traits::CommandOutput;
    use crate::testing::{FakeRunner, matching};

    fn admin(password: Option<&str>) -> EngineAdminConfig {
        EngineAdminConfig {
            host: "127.0.0.1".into(),
            port: 5432,
            admin_user: "postgres".into(),
            admin_password: password.map(|p| Arc::new(SecretString::new(p.to_string()))),
        }
    }

    #[tokio::test]
    async fn peer_auth_runs_as_postgres() {
        let runner = FakeRunner::new();
        let engine = PostgresEngine::new(runner.clone(), admin(None));
        engine
            .create_database("demo1_app", "tw_demo1_app", &SecretString::new("S3cretPass".into()))
            .await
            .unwrap();

        let call = runner.calls().remove(0);
        assert_eq!(call.run_as.as_deref(), Some("postgres"));
        assert!(!call.display().contains("S3cretPass"));
        let sql = call.stdin.unwrap();
        assert!(sql.contains("CREATE USER \"tw_demo1_app\" WITH PASSWORD 'S3cretPass'"));
        assert!(sql.contains("CREATE DATABASE \"demo1_app\" OWNER \"tw_demo1_app\""));
    }

    #[tokio::test]
    async fn drop_terminates_sessions_first() {
        let runner = FakeRunner::new();
        let engine = PostgresEngine::new(runner.clone(), admin(Some("adminpw")));
        engine.drop_database("demo1_app", "tw_demo1_app").await.unwrap();

        let call = runner.calls().remove(0);
        assert!(call.env.contains(&("PGPASSWORD".to_string(), "adminpw".to_string())));
        let sql = call.stdin.unwrap();
        let terminate = sql.find("pg_terminate_backend").unwrap();
        let drop_db = sql.find("DROP DATABASE IF EXISTS \"demo1_app\"").unwrap();
        let drop_role = sql.find("DROP ROLE IF EXISTS \"tw_demo1_app\"").unwrap();
        assert!(terminate < drop_db && drop_db < drop_role);
    }

    #[tokio::test]
    async fn stats_query_the_target_database() {
        let runner = FakeRunner::new();
        runner.respond(matching("psql"), CommandOutput::ok("8167939|12\n"));
        let engine = PostgresEngine::new(runner.clone(), admin(Some("pw")));
        let stats = engine.stats("demo1_app").await.unwrap();
        assert_eq!(stats.size_bytes, 8_167_939);
        assert_eq!(stats.tables, 12);
        assert!(runner.ran("-d demo1_app"));
    }

    #[tokio::test]
    async fn existing_role_is_reported() {
        let runner = FakeRunner::new();
        runner.respond(matching("psql"), CommandOutput::ok("0|1\n"));
        let engine = PostgresEngine::new(runner.clone(), admin(None));
        let existing = engine.existing("shop", "tw_demo1_shop").await.unwrap();
        assert!(!existing.database);
        assert!(existing.user);

        let call = runner.calls().remove(0);
        assert!(call.display().contains("-d postgres"));
        assert!(call.stdin.unwrap().contains("rolname = 'tw_demo1_shop'"));
        assert!(parse_existing("").is_err());
    }

    #[test]
    fn garbage_stats_are_rejected() {
        assert!(parse_stats("ERROR").is_err());
        assert!(parse_stats("").is_err());
    }
}
