// 🛡️ Zero-Trust Architecture: orchestrators depend on the traits, never on these adapters.

pub mod traits;     // Global contracts
pub mod exec;       // argv process execution
pub mod secrets;    // Credential encryption & memory hygiene
pub mod systemd;    // Process supervision
pub mod proxy;      // Ingress (nginx)
pub mod ssl;        // Certificate management
pub mod jail;       // OS users & directory ownership
pub mod sftp;       // SFTP account collaborator
pub mod notify;     // Status event sink

// 🏗️ Re-exports so the wiring in main.rs stays flat.
pub use exec::SystemCommandRunner;
pub use jail::LinuxJailManager;
pub use notify::{BroadcastNotifier, TracingNotifier};
pub use proxy::NginxManager;
pub use sftp::ScriptSftpProvisioner;
pub use ssl::LinuxSslEngine;
pub use systemd::SystemdSupervisor;
