// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

use anyhow::{Context, Result};
use clap::Parser;
use fluxion_evcc::{AppConfig, DeviceRegistry, RegistryKind, Session, TracingDeviceRegistry};
use fluxion_evcc_ha::{HaDeviceRegistry, HomeAssistantClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "fluxion-evcc")]
#[command(version, about = "Mirror EVCC charging state into smart-home devices", long_about = None)]
struct Cli {
    /// Configuration file (TOML or JSON); defaults to the add-on options or config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    // RUST_LOG wins over the configured level
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.system.effective_log_level())),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    info!("🚀 Starting FluxION EVCC bridge");
    info!("📋 Configuration Summary:");
    info!("   EVCC: {}", config.evcc.base_url());
    info!("   Transport: {}", config.evcc.transport);
    info!("   Update interval: {}s", config.evcc.update_interval_secs);
    info!("   Password: {}", if config.evcc.has_password() { "set" } else { "none" });
    info!("   Vanished devices: {:?}", config.system.vanished_devices);
    info!("   Debug mode: {}", config.system.debug_mode);
    if config.system.install_dashboard {
        info!("📊 Dashboard installation requested; left to the host's dashboard tooling");
    }

    let registry = build_registry(&config).await?;
    info!("🏠 Device registry: {}", registry.name());

    let mut session = Session::start(config, registry).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let result = session.run(shutdown).await;
    session.stop().await;

    if let Err(e) = &result {
        error!("❌ Bridge stopped: {}", e);
    }
    result.map_err(Into::into)
}

async fn build_registry(config: &AppConfig) -> Result<Arc<dyn DeviceRegistry>> {
    match config.registry.kind {
        RegistryKind::HomeAssistant => {
            let client = HomeAssistantClient::from_config(
                config.registry.ha_base_url.clone(),
                config.registry.ha_token.clone(),
            )?;
            if !client.ping().await? {
                warn!("⚠️ Home Assistant not reachable yet, device writes will be retried");
            }
            Ok(Arc::new(HaDeviceRegistry::new(
                client,
                config.registry.entity_prefix.clone(),
            )))
        }
        RegistryKind::Log => {
            warn!("⚠️ No device host configured, device changes are only logged");
            Ok(Arc::new(TracingDeviceRegistry))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl+C received"),
        () = terminate => info!("SIGTERM received"),
    }
}
