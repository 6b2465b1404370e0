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

//! Bridge session lifecycle.
//!
//! A [`Session`] owns everything for one run: configuration, the EVCC client, the
//! single refresh source, device sync state and the last good snapshot. Refreshes are
//! processed one at a time; a new snapshot replaces the previous one wholesale.

use crate::client::EvccClient;
use crate::config::AppConfig;
use crate::devices::{DeviceKey, DeviceKind, DeviceValue, Parameter};
use crate::errors::{ErrorKind, EvccError, EvccResult};
use crate::normalizer::normalize;
use crate::registry::DeviceRegistry;
use crate::snapshot::{BatteryMode, ChargeMode, PhaseSetting, Snapshot};
use crate::sync::{DeviceSync, SyncReport};
use crate::transport::{RefreshSource, TransportMode, select_source};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for closing the stream and logging out
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    config: AppConfig,
    client: Arc<EvccClient>,
    source: Box<dyn RefreshSource>,
    sync: DeviceSync,
    registry: Arc<dyn DeviceRegistry>,
    snapshot: Option<Snapshot>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client)
            .field("mode", &self.source.mode())
            .field("registry", &self.registry.name())
            .field("devices", &self.sync.known_devices())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Validate, log in, run the initial fetch and device discovery, open the refresh source
    pub async fn start(config: AppConfig, registry: Arc<dyn DeviceRegistry>) -> EvccResult<Self> {
        config.validate()?;

        let client = Arc::new(EvccClient::from_config(&config.evcc)?);
        client.login().await?;

        let registry_ref = registry.as_ref();
        let mut sync = DeviceSync::new(config.system.vanished_devices);
        let mut snapshot = None;
        let seed = match client.fetch_state().await {
            Ok(document) => {
                match refresh(&mut sync, registry_ref, &document).await {
                    Ok((initial, _)) => snapshot = Some(initial),
                    Err(e) => warn!("⚠️ [SESSION] Initial state discarded: {}", e),
                }
                document
            }
            Err(e) if e.is_auth() => {
                error!("❌ [SESSION] EVCC rejected credentials: {}", e);
                return Err(e);
            }
            Err(e) => {
                warn!("⚠️ [SESSION] Initial fetch failed, devices appear on first refresh: {}", e);
                Value::Null
            }
        };

        let source = select_source(&config.evcc, client.clone(), seed).await?;
        let session = Self {
            config,
            client,
            source,
            sync,
            registry,
            snapshot,
        };

        info!(
            "✅ [SESSION] Started: {} mode, {} devices via {} registry",
            session.source.mode(),
            session.sync.known_devices(),
            session.registry.name()
        );
        Ok(session)
    }

    pub fn mode(&self) -> TransportMode {
        self.source.mode()
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Normalize one state document and sync devices.
    /// A payload that fails to decode leaves the current snapshot untouched.
    pub async fn apply_payload(&mut self, payload: &Value) -> EvccResult<SyncReport> {
        let (snapshot, report) = refresh(&mut self.sync, self.registry.as_ref(), payload).await?;
        self.snapshot = Some(snapshot);
        Ok(report)
    }

    /// Process refreshes until `shutdown` fires or EVCC rejects the credentials
    pub async fn run(&mut self, shutdown: CancellationToken) -> EvccResult<()> {
        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("🛑 [SESSION] Shutdown requested");
                    return Ok(());
                }
                next = self.source.next_payload() => next,
            };

            let result = match next {
                Ok(payload) => self.apply_payload(&payload).await.map(|_| ()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                match e.kind() {
                    ErrorKind::Transport => warn!("⚠️ [SESSION] Refresh skipped: {}", e),
                    ErrorKind::Decode => warn!("⚠️ [SESSION] Payload discarded: {}", e),
                    ErrorKind::Auth | ErrorKind::Config => {
                        error!("❌ [SESSION] Halting: {}", e);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Close the refresh source and log out, bounded by [`SHUTDOWN_TIMEOUT`]
    pub async fn stop(&mut self) {
        let teardown = async {
            self.source.close().await;
            self.client.logout().await;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, teardown).await.is_err() {
            warn!(
                "⚠️ [SESSION] Teardown exceeded {:?}, abandoning",
                SHUTDOWN_TIMEOUT
            );
        } else {
            info!("👋 [SESSION] Stopped");
        }
    }

    /// Apply a host-side change to a controllable device.
    ///
    /// Selectors carry their level (0, 10, 20, ...); SoC devices carry the percentage.
    /// The accepted value is reflected on the device immediately.
    pub async fn handle_command(&mut self, key: &DeviceKey, level: u32) -> EvccResult<()> {
        let rejected = |reason: &str| EvccError::CommandFailed {
            command: key.to_string(),
            reason: reason.to_owned(),
        };
        let selector = u16::try_from(level).map_err(|_| rejected("level out of range"))?;

        let value = match (key.kind, key.parameter) {
            (DeviceKind::Loadpoint, Parameter::Mode) => {
                let mode =
                    ChargeMode::from_level(selector).ok_or_else(|| rejected("unknown mode level"))?;
                self.client
                    .set_loadpoint_mode(loadpoint_id(key)?, mode)
                    .await?;
                DeviceValue::Selector(mode.level())
            }
            (DeviceKind::Loadpoint, Parameter::Phases) => {
                let phases = PhaseSetting::from_level(selector)
                    .ok_or_else(|| rejected("unknown phases level"))?;
                self.client
                    .set_loadpoint_phases(loadpoint_id(key)?, phases)
                    .await?;
                DeviceValue::Selector(phases.level())
            }
            (DeviceKind::Loadpoint, parameter @ (Parameter::MinSoc | Parameter::TargetSoc)) => {
                let soc = u8::try_from(level)
                    .ok()
                    .filter(|soc| *soc <= 100)
                    .ok_or_else(|| rejected("SoC must be between 0 and 100"))?;
                let id = loadpoint_id(key)?;
                if parameter == Parameter::MinSoc {
                    self.client.set_loadpoint_min_soc(id, soc).await?;
                } else {
                    self.client.set_loadpoint_target_soc(id, soc).await?;
                }
                DeviceValue::Percentage(f64::from(soc))
            }
            (DeviceKind::Battery, Parameter::Mode) => {
                let mode = BatteryMode::from_level(selector)
                    .ok_or_else(|| rejected("unknown battery mode level"))?;
                self.client.set_battery_mode(mode).await?;
                DeviceValue::Selector(mode.level())
            }
            _ => return Err(rejected("device is read-only")),
        };

        if let Err(e) = self
            .sync
            .push_value(key, value, self.registry.as_ref())
            .await
        {
            warn!("⚠️ [COMMAND] Accepted by EVCC but not reflected on {}: {:#}", key, e);
        }
        Ok(())
    }
}

async fn refresh(
    sync: &mut DeviceSync,
    registry: &dyn DeviceRegistry,
    payload: &Value,
) -> EvccResult<(Snapshot, SyncReport)> {
    let snapshot = normalize(payload)?;
    let report = sync.sync(&snapshot, registry).await;
    if report != SyncReport::default() {
        debug!(
            "🔁 [SYNC] created {}, updated {}, removed {}, failed {}",
            report.created, report.updated, report.removed, report.failed
        );
    }
    Ok((snapshot, report))
}

fn loadpoint_id(key: &DeviceKey) -> EvccResult<u32> {
    key.id.parse().map_err(|_| EvccError::CommandFailed {
        command: key.to_string(),
        reason: format!("invalid loadpoint id '{}'", key.id),
    })
}
