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

//! Refresh sources and transport selection.
//!
//! A session owns exactly one [`RefreshSource`], chosen once at startup. The only
//! switch ever made is the fallback from streaming to polling when the stream
//! cannot be opened at all.

use crate::client::EvccClient;
use crate::config::EvccConfig;
use crate::errors::EvccResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Periodic `GET /api/state`
    #[default]
    Poll,
    /// Persistent WebSocket push
    Stream,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Poll => f.write_str("poll"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "rest" => Ok(Self::Poll),
            "stream" | "websocket" | "ws" => Ok(Self::Stream),
            other => Err(format!("unknown transport '{other}' (expected poll or stream)")),
        }
    }
}

/// Anything that yields successive full EVCC state documents
#[async_trait]
pub trait RefreshSource: Send {
    fn mode(&self) -> TransportMode;

    /// Wait for the next state document.
    ///
    /// Transport errors are returned for the caller to skip; auth errors are final.
    /// Must be cancel-safe: dropping the future loses at most the in-flight refresh.
    async fn next_payload(&mut self) -> EvccResult<Value>;

    /// Release held connections
    async fn close(&mut self);
}

/// Fetches the state on a fixed interval
#[derive(Debug)]
pub struct PollSource {
    client: Arc<EvccClient>,
    interval: Interval,
}

impl PollSource {
    /// The first tick fires one period from now; the initial fetch happens at startup
    pub fn new(client: Arc<EvccClient>, period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { client, interval }
    }
}

#[async_trait]
impl RefreshSource for PollSource {
    fn mode(&self) -> TransportMode {
        TransportMode::Poll
    }

    async fn next_payload(&mut self) -> EvccResult<Value> {
        self.interval.tick().await;
        self.client.fetch_state().await
    }

    async fn close(&mut self) {}
}

/// Open the refresh source for `config`.
///
/// `seed` is the last full state document; the stream merges partial updates into it.
pub async fn select_source(
    config: &EvccConfig,
    client: Arc<EvccClient>,
    seed: Value,
) -> EvccResult<Box<dyn RefreshSource>> {
    match config.transport {
        TransportMode::Poll => {
            info!(
                "🔄 [TRANSPORT] Polling every {}s",
                config.update_interval_secs
            );
            Ok(Box::new(PollSource::new(client, config.update_interval())))
        }
        TransportMode::Stream => open_stream_or_poll(config, client, seed).await,
    }
}

#[cfg(feature = "websocket")]
async fn open_stream_or_poll(
    config: &EvccConfig,
    client: Arc<EvccClient>,
    seed: Value,
) -> EvccResult<Box<dyn RefreshSource>> {
    use crate::stream::StreamSource;

    match StreamSource::connect(
        config.ws_url(),
        client.auth_cookie(),
        config.connect_timeout(),
        seed,
    )
    .await
    {
        Ok(source) => {
            info!("📡 [TRANSPORT] Streaming from {}", config.ws_url());
            Ok(Box::new(source))
        }
        Err(e) if e.is_auth() => Err(e),
        Err(e) => {
            warn!(
                "⚠️ [TRANSPORT] Stream unavailable ({}), running in degraded mode: polling every {}s",
                e, config.update_interval_secs
            );
            Ok(Box::new(PollSource::new(client, config.update_interval())))
        }
    }
}

#[cfg(not(feature = "websocket"))]
async fn open_stream_or_poll(
    config: &EvccConfig,
    client: Arc<EvccClient>,
    _seed: Value,
) -> EvccResult<Box<dyn RefreshSource>> {
    warn!(
        "⚠️ [TRANSPORT] Streaming support not compiled in, running in degraded mode: polling every {}s",
        config.update_interval_secs
    );
    Ok(Box::new(PollSource::new(client, config.update_interval())))
}
