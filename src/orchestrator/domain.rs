// src/orchestrator/domain.rs

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::label;
use crate::error::{Error, Result};
use crate::model::{Domain, DomainKind, DomainStatus, SslKind, SslState, Target};
use crate::store::Repositories;
use crate::sys::proxy::{TlsFiles, render_config};
use crate::sys::secrets::Credential;
use crate::sys::traits::{CertificatePaths, Clock, Event, Notifier, ProxyManager, SslEngine, SslPayload};

#[derive(Debug, Clone)]
pub struct DomainSettings {
    pub cert_days: u32,
    pub platform_port: u16,
    /// Addresses a verified domain must resolve to.
    pub public_ips: Vec<IpAddr>,
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            cert_days: 365,
            platform_port: 3000,
            public_ips: Vec::new(),
        }
    }
}

/// Where a domain points. A service wins over an explicit port.
#[derive(Debug, Clone, Default)]
pub struct DomainTarget {
    pub site_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct AddDomain {
    pub domain: String,
    pub target: DomainTarget,
    pub ssl: bool,
}

/// True when `resolved` is non-empty and, if public addresses are configured,
/// at least one of them is among it.
pub fn dns_matches(resolved: &[IpAddr], public_ips: &[IpAddr]) -> bool {
    !resolved.is_empty() && (public_ips.is_empty() || resolved.iter().any(|ip| public_ips.contains(ip)))
}

pub struct DomainOrchestrator {
    repos: Repositories,
    proxy: Arc<dyn ProxyManager>,
    ssl: Arc<dyn SslEngine>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    settings: DomainSettings,
}

impl DomainOrchestrator {
    pub fn new(
        repos: Repositories,
        proxy: Arc<dyn ProxyManager>,
        ssl: Arc<dyn SslEngine>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: DomainSettings,
    ) -> Self {
        Self {
            repos,
            proxy,
            ssl,
            notifier,
            clock,
            settings,
        }
    }

    async fn load(&self, id: Uuid) -> Result<Domain> {
        self.repos
            .domains
            .get_domain(id)
            .await?
            .ok_or_else(|| Error::not_found("domain", id))
    }

    async fn save(&self, domain: &Domain) -> Result<()> {
        self.repos.domains.update_domain(domain).await?;
        self.notifier.notify(Event::DomainStatusChanged {
            domain: domain.domain.clone(),
            status: label(&domain.status()),
        });
        Ok(())
    }

    pub async fn get_domain(&self, id: Uuid) -> Result<Domain> {
        self.load(id).await
    }

    pub async fn list_domains(&self) -> Result<Vec<Domain>> {
        self.repos.domains.list_domains().await
    }

    pub async fn list_site_domains(&self, site_id: Uuid) -> Result<Vec<Domain>> {
        self.repos.domains.list_site_domains(site_id).await
    }

    /// Rejects `;`, `|`, `..` and whitespace, then checks the format. Returns
    /// the lowercased name.
    pub fn validate_domain(&self, domain: &str) -> Result<String> {
        crate::validate::validate_domain(domain)
    }

    /// Vhost text for the domain's current target and certificate.
    pub fn generate_config(&self, domain: &Domain) -> Result<String> {
        let tls = if domain.ssl.enabled {
            match (&domain.ssl.cert_path, &domain.ssl.key_path) {
                (Some(cert_path), Some(key_path)) => Some(TlsFiles { cert_path, key_path }),
                _ => {
                    return Err(Error::invalid_state(format!(
                        "domain '{}' has SSL enabled but no certificate paths",
                        domain.domain
                    )));
                }
            }
        } else {
            None
        };
        Ok(render_config(&domain.domain, &domain.target.address, domain.target.port, tls))
    }

    async fn resolve_target(&self, target: &DomainTarget) -> Result<(Option<Uuid>, Option<Uuid>, Target)> {
        if let Some(service_id) = target.service_id {
            let service = self
                .repos
                .services
                .get_service(service_id)
                .await?
                .ok_or_else(|| Error::not_found("service", service_id))?;
            if target.site_id.is_some_and(|site| site != service.site_id()) {
                return Err(Error::validation(format!(
                    "service '{}' does not belong to the given site",
                    service.name()
                )));
            }
            return Ok((Some(service.site_id()), Some(service.id), Target::local(service.port())));
        }

        if let Some(site_id) = target.site_id {
            if self.repos.sites.get_site(site_id).await?.is_none() {
                return Err(Error::not_found("site", site_id));
            }
        }
        match target.port {
            Some(0) | None => Err(Error::validation("a domain needs a service or a target port")),
            Some(port) => Ok((target.site_id, None, Target::local(port))),
        }
    }

    async fn ensure_unique(&self, hostname: &str) -> Result<()> {
        if self.repos.domains.find_domain(hostname).await?.is_some() {
            return Err(Error::conflict(format!("domain '{}' already exists", hostname)));
        }
        Ok(())
    }

    // ==============================================================================
    // 1. Certificates
    // ==============================================================================

    fn apply_certificate(&self, domain: &mut Domain, kind: SslKind, paths: CertificatePaths) {
        let now = self.clock.now();
        domain.ssl = SslState {
            enabled: true,
            kind: Some(kind),
            cert_path: Some(paths.cert_path),
            key_path: Some(paths.key_path),
            generated_at: Some(now),
            expires_at: match kind {
                SslKind::SelfSigned => Some(now + ChronoDuration::days(i64::from(self.settings.cert_days))),
                SslKind::Custom => None,
            },
        };
    }

    /// Issues a self-signed certificate. A failure leaves the domain in `error`.
    async fn issue_self_signed(&self, domain: &mut Domain) -> Result<()> {
        match self.ssl.generate_self_signed(&domain.domain, self.settings.cert_days).await {
            Ok(paths) => {
                self.apply_certificate(domain, SslKind::SelfSigned, paths);
                Ok(())
            }
            Err(e) => {
                domain.mark_error(format!("certificate generation failed: {}", e), self.clock.now());
                if let Err(persist) = self.save(domain).await {
                    warn!(domain = %domain.domain, error = %persist, "Failed to persist domain error");
                }
                Err(e)
            }
        }
    }

    // ==============================================================================
    // 2. Activation & Rollback
    // ==============================================================================

    async fn activate(&self, domain: &mut Domain) -> Result<()> {
        let file_name = domain.config_file_name();
        let content = self.generate_config(domain)?;
        domain.proxy.config_path = Some(self.proxy.write_config(&file_name, &content).await?);
        domain.proxy.enabled_path = Some(self.proxy.enable(&file_name).await?);
        self.proxy.test_config().await?;
        self.proxy.reload().await?;
        domain.proxy.configured = true;
        domain.proxy.last_reload = Some(self.clock.now());
        Ok(())
    }

    /// Best-effort undo of `activate`. Every step swallows its own error.
    async fn rollback(&self, domain: &mut Domain, drop_certificate: bool) {
        let file_name = domain.config_file_name();
        if let Err(e) = self.proxy.disable(&file_name).await {
            warn!(domain = %domain.domain, error = %e, "Rollback: disable failed");
        }
        if let Err(e) = self.proxy.remove_config(&file_name).await {
            warn!(domain = %domain.domain, error = %e, "Rollback: config removal failed");
        }
        if drop_certificate && domain.ssl.enabled {
            if let Err(e) = self.ssl.remove_certificate(&domain.domain).await {
                warn!(domain = %domain.domain, error = %e, "Rollback: certificate removal failed");
            }
            domain.clear_ssl();
        }
        if let Err(e) = self.proxy.reload().await {
            warn!(domain = %domain.domain, error = %e, "Rollback: reload failed");
        }
        domain.proxy.config_path = None;
        domain.proxy.enabled_path = None;
        domain.proxy.configured = false;
    }

    /// Writes, enables, tests and reloads; marks `active` or rolls back and
    /// marks `error`. The activation error is what the caller sees.
    async fn configure(&self, domain: &mut Domain, drop_certificate_on_failure: bool) -> Result<()> {
        domain.transition(DomainStatus::Configuring, self.clock.now())?;
        match self.activate(domain).await {
            Ok(()) => {
                domain.transition(DomainStatus::Active, self.clock.now())?;
                self.save(domain).await?;
                info!(domain = %domain.domain, port = domain.target.port, ssl = domain.ssl.enabled, "Domain active");
                Ok(())
            }
            Err(e) => {
                warn!(domain = %domain.domain, error = %e, "Domain activation failed, rolling back");
                self.rollback(domain, drop_certificate_on_failure).await;
                domain.mark_error(e.to_string(), self.clock.now());
                if let Err(persist) = self.save(domain).await {
                    warn!(domain = %domain.domain, error = %persist, "Failed to persist domain error");
                }
                Err(e)
            }
        }
    }

    /// Removes config, link and certificate; each step only logs on failure.
    async fn teardown(&self, domain: &Domain) {
        let file_name = domain.config_file_name();
        if let Err(e) = self.proxy.disable(&file_name).await {
            warn!(domain = %domain.domain, error = %e, "Teardown: disable failed");
        }
        if let Err(e) = self.proxy.remove_config(&file_name).await {
            warn!(domain = %domain.domain, error = %e, "Teardown: config removal failed");
        }
        if domain.ssl.enabled {
            if let Err(e) = self.ssl.remove_certificate(&domain.domain).await {
                warn!(domain = %domain.domain, error = %e, "Teardown: certificate removal failed");
            }
        }
        if let Err(e) = self.proxy.reload().await {
            warn!(domain = %domain.domain, error = %e, "Teardown: reload failed");
        }
    }

    async fn delete_record(&self, mut domain: Domain) -> Result<Domain> {
        domain.transition(DomainStatus::Deleting, self.clock.now())?;
        self.save(&domain).await?;
        self.teardown(&domain).await;
        domain.transition(DomainStatus::Deleted, self.clock.now())?;
        self.save(&domain).await?;
        info!(domain = %domain.domain, "Domain removed");
        Ok(domain)
    }

    // ==============================================================================
    // 3. Site Domains
    // ==============================================================================

    pub async fn add_domain(&self, request: AddDomain) -> Result<Domain> {
        let hostname = self.validate_domain(&request.domain)?;
        self.ensure_unique(&hostname).await?;
        let (site_id, service_id, target) = self.resolve_target(&request.target).await?;

        let mut domain = Domain::new(hostname, DomainKind::Site, target, self.clock.now());
        domain.site_id = site_id;
        domain.service_id = service_id;
        self.repos.domains.insert_domain(domain.clone()).await?;

        if request.ssl {
            self.issue_self_signed(&mut domain).await?;
        }
        self.configure(&mut domain, true).await?;
        Ok(domain)
    }

    pub async fn remove_domain(&self, id: Uuid) -> Result<Domain> {
        let domain = self.load(id).await?;
        if domain.is_platform() {
            return Err(Error::invalid_state("the platform domain is removed with delete_platform_domain"));
        }
        self.delete_record(domain).await
    }

    /// Re-points the domain and reloads the proxy.
    pub async fn assign_domain(&self, id: Uuid, target: DomainTarget) -> Result<Domain> {
        let mut domain = self.load(id).await?;
        if domain.is_platform() {
            return Err(Error::invalid_state("the platform domain cannot be reassigned"));
        }
        let (site_id, service_id, resolved) = self.resolve_target(&target).await?;
        domain.site_id = site_id;
        domain.service_id = service_id;
        domain.target = resolved;
        domain.error_message = None;
        self.configure(&mut domain, false).await?;
        Ok(domain)
    }

    /// Drops the proxy entry but keeps the record, back in `pending`. A
    /// pending domain has no proxy entry, so only its target is cleared.
    pub async fn unassign_domain(&self, id: Uuid) -> Result<Domain> {
        let mut domain = self.load(id).await?;
        if domain.is_platform() {
            return Err(Error::invalid_state("the platform domain cannot be unassigned"));
        }
        let status = domain.status();
        if status != DomainStatus::Pending && !status.can_transition_to(DomainStatus::Pending) {
            return Err(Error::invalid_state(format!(
                "domain '{}' is {:?} and cannot be unassigned",
                domain.domain, status
            )));
        }

        if status != DomainStatus::Pending {
            let file_name = domain.config_file_name();
            self.proxy.disable(&file_name).await?;
            self.proxy.remove_config(&file_name).await?;
            self.proxy.reload().await?;
            domain.proxy.last_reload = Some(self.clock.now());
        }

        domain.site_id = None;
        domain.service_id = None;
        domain.proxy.config_path = None;
        domain.proxy.enabled_path = None;
        domain.proxy.configured = false;
        domain.transition(DomainStatus::Pending, self.clock.now())?;
        self.save(&domain).await?;
        Ok(domain)
    }

    // ==============================================================================
    // 4. Platform Domain (singleton)
    // ==============================================================================

    /// Creates the platform domain, or replaces the existing one after tearing
    /// down its config and certificate.
    pub async fn set_platform_domain(&self, domain: &str, port: Option<u16>, ssl: bool) -> Result<Domain> {
        let hostname = self.validate_domain(domain)?;
        let target = Target::local(port.unwrap_or(self.settings.platform_port));

        let mut record = match self.repos.domains.find_platform_domain().await? {
            Some(mut existing) => {
                if existing.domain != hostname {
                    self.ensure_unique(&hostname).await?;
                }
                self.teardown(&existing).await;
                existing.clear_ssl();
                existing.proxy.configured = false;
                existing.domain = hostname;
                existing.target = target;
                existing.error_message = None;
                self.repos.domains.update_domain(&existing).await?;
                existing
            }
            None => {
                self.ensure_unique(&hostname).await?;
                let record = Domain::new(hostname, DomainKind::Platform, target, self.clock.now());
                self.repos.domains.insert_domain(record.clone()).await?;
                record
            }
        };

        if ssl {
            self.issue_self_signed(&mut record).await?;
        }
        self.configure(&mut record, true).await?;
        Ok(record)
    }

    pub async fn delete_platform_domain(&self, force: bool) -> Result<Domain> {
        let domain = self
            .repos
            .domains
            .find_platform_domain()
            .await?
            .ok_or_else(|| Error::not_found("domain", "platform"))?;
        if !force {
            return Err(Error::invalid_state("deleting the platform domain requires force"));
        }
        self.delete_record(domain).await
    }

    // ==============================================================================
    // 5. SSL Management
    // ==============================================================================

    pub async fn enable_ssl(&self, id: Uuid) -> Result<Domain> {
        let mut domain = self.load(id).await?;
        if domain.ssl.enabled {
            return Ok(domain);
        }
        self.issue_self_signed(&mut domain).await?;
        self.configure(&mut domain, true).await?;
        Ok(domain)
    }

    pub async fn disable_ssl(&self, id: Uuid) -> Result<Domain> {
        let mut domain = self.load(id).await?;
        if !domain.ssl.enabled {
            return Ok(domain);
        }
        if let Err(e) = self.ssl.remove_certificate(&domain.domain).await {
            warn!(domain = %domain.domain, error = %e, "Certificate removal failed");
        }
        domain.clear_ssl();
        self.configure(&mut domain, false).await?;
        Ok(domain)
    }

    /// Re-issues a self-signed certificate in place and reloads the proxy.
    pub async fn renew_certificate(&self, id: Uuid) -> Result<Domain> {
        let mut domain = self.load(id).await?;
        match domain.ssl.kind {
            Some(SslKind::SelfSigned) if domain.ssl.enabled => {}
            Some(SslKind::Custom) => {
                return Err(Error::validation(format!(
                    "domain '{}' uses a custom certificate; upload a new one instead",
                    domain.domain
                )));
            }
            _ => {
                return Err(Error::invalid_state(format!("domain '{}' has no certificate", domain.domain)));
            }
        }

        self.issue_self_signed(&mut domain).await?;
        self.proxy.reload().await?;
        domain.proxy.last_reload = Some(self.clock.now());
        self.repos.domains.update_domain(&domain).await?;
        info!(domain = %domain.domain, expires = ?domain.ssl.expires_at, "Certificate renewed");
        Ok(domain)
    }

    /// Installs an uploaded PEM pair. The key is scrubbed once written.
    pub async fn install_custom_certificate(&self, id: Uuid, fullchain_pem: String, privkey_pem: Credential) -> Result<Domain> {
        let mut domain = self.load(id).await?;
        let key_looks_valid = privkey_pem.use_secret(|key| {
            std::str::from_utf8(key).is_ok_and(|text| text.contains("-----BEGIN") && text.contains("PRIVATE KEY-----"))
        });
        if !fullchain_pem.contains("-----BEGIN CERTIFICATE-----") || !key_looks_valid {
            privkey_pem.destroy();
            return Err(Error::validation("certificate and key must be PEM encoded"));
        }

        let paths = self
            .ssl
            .install_certificate(SslPayload {
                domain_name: domain.domain.clone(),
                fullchain_pem,
                privkey_pem,
            })
            .await?;
        self.apply_certificate(&mut domain, SslKind::Custom, paths);
        self.configure(&mut domain, false).await?;
        Ok(domain)
    }

    // ==============================================================================
    // 6. DNS & Cleanup
    // ==============================================================================

    pub async fn verify_dns(&self, id: Uuid) -> Result<Domain> {
        let mut domain = self.load(id).await?;
        let resolved: Vec<IpAddr> = match tokio::net::lookup_host((domain.domain.as_str(), 80)).await {
            Ok(addrs) => {
                let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                ips.sort();
                ips.dedup();
                ips
            }
            Err(e) => {
                debug!(domain = %domain.domain, error = %e, "DNS lookup failed");
                Vec::new()
            }
        };

        domain.dns.verified = dns_matches(&resolved, &self.settings.public_ips);
        domain.dns.resolved = resolved;
        domain.dns.last_check = Some(self.clock.now());
        domain.updated_at = self.clock.now();
        self.repos.domains.update_domain(&domain).await?;
        Ok(domain)
    }

    /// Removes domains whose site is gone. Returns how many were removed.
    pub async fn cleanup_orphan_domains(&self) -> Result<usize> {
        let mut removed = 0;
        for domain in self.repos.domains.list_domains().await? {
            let Some(site_id) = domain.site_id else { continue };
            if self.repos.sites.get_site(site_id).await?.is_some() {
                continue;
            }
            let name = domain.domain.clone();
            match self.delete_record(domain).await {
                Ok(_) => removed += 1,
                Err(e) => warn!(domain = %name, error = %e, "Failed to remove orphan domain"),
            }
        }
        if removed > 0 {
            info!(removed, "Orphan domains removed");
        }
        Ok(removed)
    }

    /// Clears dangling service references and flags those domains as `error`.
    pub async fn cleanup_invalid_service_domains(&self) -> Result<usize> {
        let mut flagged = 0;
        for mut domain in self.repos.domains.list_domains().await? {
            let Some(service_id) = domain.service_id else { continue };
            if self.repos.services.get_service(service_id).await?.is_some() {
                continue;
            }
            domain.service_id = None;
            domain.mark_error("referenced service no longer exists", self.clock.now());
            self.save(&domain).await?;
            flagged += 1;
        }
        Ok(flagged)
    }
}
