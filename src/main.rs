// src/main.rs

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use twoine_agent::ControlPlane;
use twoine_agent::config::AgentConfig;
use twoine_agent::store::{MemoryStore, Repositories};
use twoine_agent::sys::BroadcastNotifier;

const EVENT_BUFFER: usize = 256;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Logging
    // ==============================================================================

    let loaded = AgentConfig::load();
    init_tracing(loaded.as_ref().is_ok_and(|c| c.json_logs));

    // 🛡️ A missing or malformed encryption key is fatal; stored credentials
    // would be unreadable otherwise.
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Fatal configuration error");
            return Err(e.into());
        }
    };

    // ==============================================================================
    // 2. State & Wiring
    // ==============================================================================

    let store = match &config.state_file {
        Some(path) => MemoryStore::open(path).await?,
        None => {
            warn!("TWOINE_STATE_FILE is not set; records live in memory only");
            MemoryStore::new()
        }
    };
    let repos = Repositories::from_store(Arc::new(store));
    let notifier = Arc::new(BroadcastNotifier::new(EVENT_BUFFER));

    let plane = ControlPlane::from_config(&config, repos, notifier)?;

    // ==============================================================================
    // 3. Startup Housekeeping & Run
    // ==============================================================================

    if let Err(e) = plane.run_startup_jobs().await {
        warn!(error = %e, "Startup cleanup did not complete");
    }

    let sites = plane.sites.list_sites().await?.len();
    info!(
        sites,
        sites_root = %config.sites_root.display(),
        sudo = config.use_sudo,
        "⚙️ Twoine agent ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
