//! Runs the background coordinators of the control-plane core.
//!
//! Reads the YAML config named by `TSURU_CONFIG`, starts the webhook
//! dispatcher and the bind syncer, and drains both on Ctrl-C.

use std::sync::Arc;

use anyhow::Context;

use tsuru_core::config::{Config, CoreSettings};
use tsuru_core::logging;
use tsuru_core::service::StaticAppLister;
use tsuru_core::Services;

const DEFAULT_CONFIG_PATH: &str = "/etc/tsuru/tsuru.conf";

// ============================================================================
// Startup
// ============================================================================

fn load_settings() -> anyhow::Result<CoreSettings> {
    let path = std::env::var("TSURU_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = if std::path::Path::new(&path).exists() {
        Config::from_file(&path).with_context(|| format!("reading {path}"))?
    } else {
        Config::empty()
    };
    CoreSettings::from_config(&config).context("resolving core settings")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = load_settings()?;
    logging::init(&settings.log_level);

    let services = Services::in_memory(settings).context("building core services")?;
    // Apps are owned by the outer platform; standalone the syncer sees none.
    let syncer = services.start(Arc::new(StaticAppLister::new(Vec::new())))?;

    tracing::info!("tsuru-core daemon running, Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;

    tracing::info!("shutting down");
    services.shutdown().await?;

    let stats = syncer.stats();
    let dispatched = services.dispatcher.stats();
    tracing::info!(
        sync_ticks = stats.ticks,
        binds = stats.binds,
        unbinds = stats.unbinds,
        webhook_calls = dispatched.calls,
        webhook_failures = dispatched.failed_calls,
        "bye"
    );
    Ok(())
}
