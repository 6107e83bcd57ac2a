// src/sys/proxy.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::sys::traits::{CommandRunner, CommandSpec, ProxyManager};

/// 🛡️ Zero-Trust: config file names end up in filesystem paths, so nothing
/// but `[a-z0-9._-]` ending in `.conf` is accepted.
fn validate_file_name(file_name: &str) -> Result<()> {
    let stem = file_name.strip_suffix(".conf").unwrap_or_default();
    if stem.is_empty() || stem.contains("..") || stem.starts_with('.') {
        return Err(Error::validation(format!("invalid proxy config name '{}'", file_name)));
    }
    if !stem
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' || c == '_')
    {
        return Err(Error::validation(format!("invalid characters in proxy config name '{}'", file_name)));
    }
    Ok(())
}

// ==============================================================================
// 1. Config Rendering
// ==============================================================================

pub struct TlsFiles<'a> {
    pub cert_path: &'a Path,
    pub key_path: &'a Path,
}

/// Renders one of the two vhost shapes. `domain` must already be validated.
pub fn render_config(domain: &str, address: &str, port: u16, tls: Option<TlsFiles<'_>>) -> String {
    let location = format!(
        r#"    location / {{
        proxy_pass http://{address}:{port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_read_timeout 86400;
    }}"#,
        address = address,
        port = port,
    );

    match tls {
        None => format!(
            r#"# Managed by twoine. Manual edits are overwritten.
server {{
    listen 80;
    listen [::]:80;
    server_name {domain};

    add_header X-Content-Type-Options "nosniff" always;

{location}
}}
"#,
            domain = domain,
            location = location,
        ),
        Some(files) => format!(
            r#"# Managed by twoine. Manual edits are overwritten.
server {{
    listen 80;
    listen [::]:80;
    server_name {domain};
    return 301 https://$host$request_uri;
}}

server {{
    listen 443 ssl http2;
    listen [::]:443 ssl http2;
    server_name {domain};

    ssl_certificate {cert};
    ssl_certificate_key {key};
    ssl_protocols TLSv1.2 TLSv1.3;
    ssl_prefer_server_ciphers on;
    ssl_session_cache shared:SSL:10m;

    add_header Strict-Transport-Security "max-age=31536000; includeSubDomains" always;
    add_header X-Content-Type-Options "nosniff" always;
    add_header X-Frame-Options "SAMEORIGIN" always;
    add_header X-XSS-Protection "1; mode=block" always;
    add_header Referrer-Policy "strict-origin-when-cross-origin" always;

{location}
}}
"#,
            domain = domain,
            cert = files.cert_path.display(),
            key = files.key_path.display(),
            location = location,
        ),
    }
}

// ==============================================================================
// 2. Nginx Implementation
// ==============================================================================

pub struct NginxManager {
    runner: Arc<dyn CommandRunner>,
    base_path: PathBuf,
}

impl NginxManager {
    pub fn new(runner: Arc<dyn CommandRunner>, base_path: PathBuf) -> Self {
        Self { runner, base_path }
    }

    fn available(&self, file_name: &str) -> PathBuf {
        self.base_path.join("sites-available").join(file_name)
    }

    fn enabled(&self, file_name: &str) -> PathBuf {
        self.base_path.join("sites-enabled").join(file_name)
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ProxyManager for NginxManager {
    async fn write_config(&self, file_name: &str, content: &str) -> Result<PathBuf> {
        validate_file_name(file_name)?;
        let path = self.available(file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        debug!(path = %path.display(), "Proxy config written");
        Ok(path)
    }

    async fn enable(&self, file_name: &str) -> Result<PathBuf> {
        validate_file_name(file_name)?;
        let config_path = self.available(file_name);
        let enabled_link = self.enabled(file_name);
        if let Some(parent) = enabled_link.parent() {
            fs::create_dir_all(parent).await?;
        }
        // A stale link may point at an older config path.
        if fs::symlink_metadata(&enabled_link).await.is_ok() {
            fs::remove_file(&enabled_link).await?;
        }
        fs::symlink(&config_path, &enabled_link).await?;
        Ok(enabled_link)
    }

    async fn disable(&self, file_name: &str) -> Result<()> {
        validate_file_name(file_name)?;
        remove_if_present(&self.enabled(file_name)).await
    }

    async fn remove_config(&self, file_name: &str) -> Result<()> {
        validate_file_name(file_name)?;
        remove_if_present(&self.available(file_name)).await
    }

    async fn test_config(&self) -> Result<()> {
        let spec = CommandSpec::new("nginx").arg("-t").privileged();
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let spec = CommandSpec::new("systemctl").args(["reload", "nginx"]).privileged();
        self.runner.run_checked(&spec).await?;
        info!("nginx reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;

    #[test]
    fn config_names() {
        assert!(validate_file_name("twoine-example.com.conf").is_ok());
        assert!(validate_file_name("twoine-my_site.example.com.conf").is_ok());
        assert!(validate_file_name("example.com").is_err());
        assert!(validate_file_name("../nginx.conf").is_err());
        assert!(validate_file_name("a/b.conf").is_err());
        assert!(validate_file_name("evil;.conf").is_err());
        assert!(validate_file_name(".conf").is_err());
    }

    #[test]
    fn http_only_shape() {
        let text = render_config("app.example.com", "127.0.0.1", 10000, None);
        assert_eq!(text.matches("server {").count(), 1);
        assert!(text.contains("listen 80;"));
        assert!(!text.contains("443"));
        assert!(text.contains("server_name app.example.com;"));
        assert!(text.contains("proxy_pass http://127.0.0.1:10000;"));
        assert!(text.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(text.contains("proxy_read_timeout 86400;"));
    }

    #[test]
    fn tls_shape_points_at_the_given_files() {
        let text = render_config(
            "app.example.com",
            "127.0.0.1",
            10001,
            Some(TlsFiles {
                cert_path: Path::new("/etc/twoine/ssl/app.example.com/fullchain.pem"),
                key_path: Path::new("/etc/twoine/ssl/app.example.com/privkey.pem"),
            }),
        );
        assert_eq!(text.matches("server {").count(), 2);
        assert!(text.contains("return 301 https://$host$request_uri;"));
        assert!(text.contains("listen 443 ssl http2;"));
        assert!(text.contains("ssl_certificate /etc/twoine/ssl/app.example.com/fullchain.pem;"));
        assert!(text.contains("ssl_certificate_key /etc/twoine/ssl/app.example.com/privkey.pem;"));
        assert!(text.contains("Strict-Transport-Security"));
        assert!(text.contains("X-Frame-Options"));
        assert!(text.contains("Referrer-Policy"));
        assert!(text.contains("proxy_pass http://127.0.0.1:10001;"));
    }

    #[tokio::test]
    async fn write_enable_disable_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let nginx = NginxManager::new(runner.clone(), dir.path().to_path_buf());

        let config = nginx.write_config("twoine-a.example.com.conf", "server {}").await.unwrap();
        assert_eq!(std::fs::read_to_string(&config).unwrap(), "server {}");

        let link = nginx.enable("twoine-a.example.com.conf").await.unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), config);
        // Enabling twice replaces the link.
        nginx.enable("twoine-a.example.com.conf").await.unwrap();

        nginx.disable("twoine-a.example.com.conf").await.unwrap();
        assert!(std::fs::symlink_metadata(&link).is_err());
        nginx.disable("twoine-a.example.com.conf").await.unwrap();

        nginx.remove_config("twoine-a.example.com.conf").await.unwrap();
        assert!(!config.exists());
        nginx.remove_config("twoine-a.example.com.conf").await.unwrap();
    }

    #[tokio::test]
    async fn test_and_reload_are_privileged() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();
        let nginx = NginxManager::new(runner.clone(), dir.path().to_path_buf());

        nginx.test_config().await.unwrap();
        nginx.reload().await.unwrap();
        assert_eq!(runner.command_lines(), vec!["nginx -t", "systemctl reload nginx"]);
        assert!(runner.calls().iter().all(|c| c.privileged));
    }
}
