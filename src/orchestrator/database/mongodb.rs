// src/orchestrator/database/mongodb.rs

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::info;

use super::{DatabaseEngine, ExistingObjects};
use crate::config::EngineAdminConfig;
use crate::error::{Error, Result};
use crate::model::{DatabaseConnection, DatabaseKind, DatabaseStats};
use crate::sys::traits::{CommandRunner, CommandSpec};

// Scripts read secrets from the environment; nothing sensitive is in argv.
const ADMIN_PASSWORD_VAR: &str = "TWOINE_MONGO_ADMIN_PASSWORD";
const USER_PASSWORD_VAR: &str = "TWOINE_DB_PASSWORD";

pub struct MongoEngine {
    runner: Arc<dyn CommandRunner>,
    admin: EngineAdminConfig,
}

/// JavaScript string literal.
fn js(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

impl MongoEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, admin: EngineAdminConfig) -> Self {
        Self { runner, admin }
    }

    fn admin_command(&self, script: &str) -> CommandSpec {
        let uri = format!("mongodb://{}:{}/admin", self.admin.host, self.admin.port);
        let spec = CommandSpec::new("mongosh").args(["--quiet", uri.as_str()]);
        match &self.admin.admin_password {
            Some(password) => {
                let login = format!(
                    "db.getSiblingDB('admin').auth({}, process.env.{});\n",
                    js(&self.admin.admin_user),
                    ADMIN_PASSWORD_VAR
                );
                spec.args(["--eval", format!("{}{}", login, script).as_str()])
                    .env(ADMIN_PASSWORD_VAR, password.expose_secret().as_str())
            }
            None => spec.args(["--eval", script]),
        }
    }
}

#[async_trait]
impl DatabaseEngine for MongoEngine {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Mongodb
    }

    fn connection(&self, database: &str) -> DatabaseConnection {
        DatabaseConnection {
            host: self.admin.host.clone(),
            port: self.admin.port,
            database: database.to_string(),
        }
    }

    async fn create_database(&self, database: &str, username: &str, password: &SecretString) -> Result<Vec<String>> {
        // MongoDB materialises a database on first write.
        let script = format!(
            "const target = db.getSiblingDB({db});\n\
             target.createUser({{user: {user}, pwd: process.env.{var}, roles: [{{role: 'readWrite', db: {db}}}, {{role: 'dbAdmin', db: {db}}}]}});\n\
             target.getCollection('_twoine').insertOne({{createdAt: new Date()}});\n",
            db = js(database),
            user = js(username),
            var = USER_PASSWORD_VAR,
        );
        let spec = self
            .admin_command(&script)
            .env(USER_PASSWORD_VAR, password.expose_secret().as_str());
        self.runner.run_checked(&spec).await?;
        info!(database, username, "MongoDB database created");
        Ok(vec!["readWrite".to_string(), "dbAdmin".to_string()])
    }

    async fn existing(&self, database: &str, username: &str) -> Result<ExistingObjects> {
        let script = format!(
            "const names = db.getMongo().getDBNames();\n\
             print(JSON.stringify({{database: names.includes({db}), user: db.getSiblingDB({db}).getUser({user}) !== null}}));\n",
            db = js(database),
            user = js(username),
        );
        let output = self.runner.run_checked(&self.admin_command(&script)).await?;
        parse_existing(&output.stdout)
    }

    async fn drop_database(&self, database: &str, username: &str) -> Result<()> {
        let script = format!(
            "const target = db.getSiblingDB({db});\n\
             try {{ target.dropUser({user}); }} catch (e) {{ print('user already gone'); }}\n\
             target.dropDatabase();\n",
            db = js(database),
            user = js(username),
        );
        self.runner.run_checked(&self.admin_command(&script)).await?;
        Ok(())
    }

    async fn set_password(&self, database: &str, username: &str, password: &SecretString) -> Result<()> {
        let script = format!(
            "db.getSiblingDB({}).changeUserPassword({}, process.env.{});\n",
            js(database),
            js(username),
            USER_PASSWORD_VAR
        );
        let spec = self
            .admin_command(&script)
            .env(USER_PASSWORD_VAR, password.expose_secret().as_str());
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    async fn stats(&self, database: &str) -> Result<DatabaseStats> {
        let script = format!("print(JSON.stringify(db.getSiblingDB({}).stats()));\n", js(database));
        let output = self.runner.run_checked(&self.admin_command(&script)).await?;
        parse_stats(&output.stdout)
    }

    async fn test_connection(&self, connection: &DatabaseConnection, username: &str, password: &SecretString) -> Result<()> {
        let uri = format!("mongodb://{}:{}/{}", connection.host, connection.port, connection.database);
        let script = format!(
            "db.auth({}, process.env.{});\nprint(db.runCommand({{ping: 1}}).ok);\n",
            js(username),
            USER_PASSWORD_VAR
        );
        let spec = CommandSpec::new("mongosh")
            .args(["--quiet", uri.as_str(), "--eval", script.as_str()])
            .env(USER_PASSWORD_VAR, password.expose_secret().as_str());
        let output = self.runner.run_checked(&spec).await?;
        if output.stdout.trim().ends_with('1') {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "MongoDB ping on {}:{} failed",
                connection.host, connection.port
            )))
        }
    }
}

/// Last JSON line: `{"database": bool, "user": bool}`.
fn parse_existing(stdout: &str) -> Result<ExistingObjects> {
    let line = stdout.lines().rev().map(str::trim).find(|l| l.starts_with('{'));
    let invalid = || Error::validation(format!("unexpected MongoDB existence output: '{}'", stdout.trim()));
    let value: Value = serde_json::from_str(line.ok_or_else(invalid)?)?;
    let flag = |key: &str| value.get(key).and_then(Value::as_bool).ok_or_else(invalid);
    Ok(ExistingObjects {
        database: flag("database")?,
        user: flag("user")?,
    })
}

/// Last line of output carrying `db.stats()` as JSON.
fn parse_stats(stdout: &str) -> Result<DatabaseStats> {
    let line = stdout.lines().rev().map(str::trim).find(|l| l.starts_with('{')).unwrap_or("{}");
    let value: Value = serde_json::from_str(line)?;
    let number = |key: &str| value.get(key).and_then(Value::as_f64).unwrap_or(0.0).max(0.0) as u64;
    Ok(DatabaseStats {
        size_bytes: number("dataSize") + number("indexSize"),
        tables: number("collections"),
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
            port: 27017,
            admin_user: "admin".into(),
            admin_password: password.map(|p| Arc::new(SecretString::new(p.to_string()))),
        }
    }

    #[tokio::test]
    async fn passwords_travel_through_the_environment() {
        let runner = FakeRunner::new();
        let engine = MongoEngine::new(runner.clone(), admin(Some("adminpw")));
        let roles = engine
            .create_database("demo1_app", "tw_demo1_app", &SecretString::new("S3cretPass".into()))
            .await
            .unwrap();
        assert_eq!(roles, vec!["readWrite", "dbAdmin"]);

        let call = runner.calls().remove(0);
        let line = call.display();
        assert!(!line.contains("S3cretPass"));
        assert!(!line.contains("adminpw"));
        assert!(line.contains("mongodb://127.0.0.1:27017/admin"));
        assert!(line.contains("createUser({user: \"tw_demo1_app\""));
        assert!(call.env.contains(&(USER_PASSWORD_VAR.to_string(), "S3cretPass".to_string())));
        assert!(call.env.contains(&(ADMIN_PASSWORD_VAR.to_string(), "adminpw".to_string())));
    }

    #[test]
    fn js_strings_are_quoted() {
        assert_eq!(js("a'b\"c"), "\"a'b\\\"c\"");
    }

    #[tokio::test]
    async fn stats_parse_the_json_document() {
        let runner = FakeRunner::new();
        runner.respond(
            matching("mongosh"),
            CommandOutput::ok("{\"db\":\"demo1_app\",\"collections\":4,\"dataSize\":1024.0,\"indexSize\":2048}\n"),
        );
        let engine = MongoEngine::new(runner, admin(None));
        let stats = engine.stats("demo1_app").await.unwrap();
        assert_eq!(stats.size_bytes, 3072);
        assert_eq!(stats.tables, 4);
    }

    #[tokio::test]
    async fn existing_database_is_reported() {
        let runner = FakeRunner::new();
        runner.respond(matching("getDBNames"), CommandOutput::ok("{\"database\":true,\"user\":false}\n"));
        let engine = MongoEngine::new(runner, admin(None));
        let existing = engine.existing("shop", "tw_demo1_shop").await.unwrap();
        assert_eq!(existing, ExistingObjects { database: true, user: false });
        assert!(parse_existing("").is_err());
        assert!(parse_existing("{\"database\":false}").is_err());
    }

    #[tokio::test]
    async fn failed_ping_is_an_error() {
        let runner = FakeRunner::new();
        runner.respond(matching("mongosh"), CommandOutput::ok("0\n"));
        let engine = MongoEngine::new(runner, admin(None));
        let connection = DatabaseConnection {
            host: "127.0.0.1".into(),
            port: 27017,
            database: "demo1_app".into(),
        };
        assert!(
            engine
                .test_connection(&connection, "tw_demo1_app", &SecretString::new("pw".into()))
                .await
                .is_err()
        );
    }
}
