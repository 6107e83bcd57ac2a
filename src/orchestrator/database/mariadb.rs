// src/orchestrator/database/mariadb.rs

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use super::{DatabaseEngine, ExistingObjects};
use crate::config::EngineAdminConfig;
use crate::error::{Error, Result};
use crate::model::{DatabaseConnection, DatabaseKind, DatabaseStats};
use crate::sys::traits::{CommandRunner, CommandSpec};

/// MariaDB/MySQL through the `mariadb` client. Statements travel on stdin,
/// passwords on `MYSQL_PWD`.
pub struct MariaDbEngine {
    runner: Arc<dyn CommandRunner>,
    admin: EngineAdminConfig,
}

/// String literal for MariaDB's default `sql_mode` (backslash escapes on).
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

impl MariaDbEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, admin: EngineAdminConfig) -> Self {
        Self { runner, admin }
    }

    /// Admin session: TCP with `MYSQL_PWD` when a password is configured,
    /// otherwise root over the local socket.
    fn admin_command(&self) -> CommandSpec {
        let spec = CommandSpec::new("mariadb");
        let spec = match &self.admin.admin_password {
            Some(password) => spec
                .args(["--protocol=TCP", "-h", self.admin.host.as_str(), "-P"])
                .arg(self.admin.port.to_string())
                .args(["-u", self.admin.admin_user.as_str()])
                .env("MYSQL_PWD", password.expose_secret().as_str()),
            None => spec.privileged(),
        };
        spec.args(["--batch", "--skip-column-names"])
    }
}

#[async_trait]
impl DatabaseEngine for MariaDbEngine {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Mariadb
    }

    fn connection(&self, database: &str) -> DatabaseConnection {
        DatabaseConnection {
            host: self.admin.host.clone(),
            port: self.admin.port,
            database: database.to_string(),
        }
    }

    async fn create_database(&self, database: &str, username: &str, password: &SecretString) -> Result<Vec<String>> {
        let user = format!("{}@'%'", literal(username));
        let sql = format!(
            "CREATE DATABASE `{db}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;\n\
             CREATE USER {user} IDENTIFIED BY {pw};\n\
             GRANT ALL PRIVILEGES ON `{db}`.* TO {user};\n\
             FLUSH PRIVILEGES;\n",
            db = database,
            user = user,
            pw = literal(password.expose_secret()),
        );
        self.runner.run_checked(&self.admin_command().stdin(sql)).await?;
        info!(database, username, "MariaDB database created");
        Ok(vec!["ALL PRIVILEGES".to_string()])
    }

    async fn existing(&self, database: &str, username: &str) -> Result<ExistingObjects> {
        let sql = format!(
            "SELECT (SELECT COUNT(*) FROM information_schema.schemata WHERE schema_name = {}), \
             (SELECT COUNT(*) FROM mysql.user WHERE User = {});\n",
            literal(database),
            literal(username)
        );
        let output = self.runner.run_checked(&self.admin_command().stdin(sql)).await?;
        parse_existing(&output.stdout)
    }

    async fn drop_database(&self, database: &str, username: &str) -> Result<()> {
        let sql = format!(
            "DROP DATABASE IF EXISTS `{}`;\nDROP USER IF EXISTS {}@'%';\nFLUSH PRIVILEGES;\n",
            database,
            literal(username)
        );
        self.runner.run_checked(&self.admin_command().stdin(sql)).await?;
        Ok(())
    }

    async fn set_password(&self, _database: &str, username: &str, password: &SecretString) -> Result<()> {
        let sql = format!(
            "ALTER USER {}@'%' IDENTIFIED BY {};\nFLUSH PRIVILEGES;\n",
            literal(username),
            literal(password.expose_secret())
        );
        self.runner.run_checked(&self.admin_command().stdin(sql)).await?;
        Ok(())
    }

    async fn stats(&self, database: &str) -> Result<DatabaseStats> {
        let sql = format!(
            "SELECT COALESCE(SUM(data_length + index_length), 0), COUNT(*) \
             FROM information_schema.tables WHERE table_schema = {};\n",
            literal(database)
        );
        let output = self.runner.run_checked(&self.admin_command().stdin(sql)).await?;
        parse_stats(&output.stdout)
    }

    async fn test_connection(&self, connection: &DatabaseConnection, username: &str, password: &SecretString) -> Result<()> {
        let spec = CommandSpec::new("mariadb")
            .args(["--protocol=TCP", "-h", connection.host.as_str(), "-P"])
            .arg(connection.port.to_string())
            .args(["-u", username, "-D", connection.database.as_str()])
            .args(["--batch", "--skip-column-names", "-e", "SELECT 1"])
            .env("MYSQL_PWD", password.expose_secret().as_str());
        self.runner.run_checked(&spec).await?;
        Ok(())
    }
}

/// `<schemas>\t<users>` counts.
fn parse_existing(stdout: &str) -> Result<ExistingObjects> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or_default();
    let invalid = || Error::validation(format!("unexpected MariaDB existence output: '{}'", line));
    let counts = line
        .split_whitespace()
        .map(str::parse::<u64>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    match counts.as_slice() {
        [schemas, users] => Ok(ExistingObjects {
            database: *schemas > 0,
            user: *users > 0,
        }),
        _ => Err(invalid()),
    }
}

/// `<bytes>\t<tables>` from `--batch --skip-column-names`.
fn parse_stats(stdout: &str) -> Result<DatabaseStats> {
    let line = stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let mut fields = line.split_whitespace();
    let parse = |field: Option<&str>| -> Result<u64> {
        let raw = field.unwrap_or("0");
        // SUM() over DECIMAL columns may print a fraction.
        raw.split('.')
            .next()
            .unwrap_or("0")
            .parse()
            .map_err(|_| Error::validation(format!("unexpected MariaDB stats output: '{}'", line)))
    };
    Ok(DatabaseStats {
        size_bytes: parse(fields.next())?,
        tables: parse(fields.next())?,
        collected_at: None,
    })
}
