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

//! EVCC WebSocket stream.
//!
//! EVCC pushes partial updates as flat JSON objects whose keys are dotted paths into
//! the state document, e.g. `{"loadpoints.0.chargePower": 7400}`. Updates are merged
//! into the last full document, and the merged document is what gets normalized.

use crate::backoff::Backoff;
use crate::errors::{EvccError, EvccResult};
use crate::normalizer::normalize;
use crate::transport::{RefreshSource, TransportMode};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Full state document kept up to date from partial stream messages
#[derive(Debug, Clone, Default)]
pub struct StreamDocument {
    document: Value,
}

impl StreamDocument {
    /// Start from `seed`; a seed that does not decode as EVCC state starts empty
    pub fn new(seed: Value) -> Self {
        let document = if seed.is_object() && normalize(&seed).is_ok() {
            seed
        } else {
            Value::Object(Map::new())
        };
        Self { document }
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Merge one raw message.
    ///
    /// The merge happens on a copy that must still decode as EVCC state; a message that
    /// is malformed or leaves the document in an invalid shape changes nothing.
    pub fn apply(&mut self, text: &str) -> EvccResult<&Value> {
        let message: Value = serde_json::from_str(text)
            .map_err(|e| EvccError::InvalidPayload(format!("stream message is not JSON: {e}")))?;
        let Value::Object(fields) = message else {
            return Err(EvccError::InvalidPayload(
                "stream message is not an object".to_owned(),
            ));
        };

        let mut candidate = self.document.clone();
        for (path, value) in fields {
            let segments: Vec<&str> = path.split('.').collect();
            merge_path(&mut candidate, &segments, value).map_err(|reason| {
                EvccError::InvalidPayload(format!("stream key '{path}': {reason}"))
            })?;
        }
        normalize(&candidate)?;

        self.document = candidate;
        Ok(&self.document)
    }
}

/// Set `value` at the dotted path `segments`, creating intermediate containers.
/// Numeric segments index into arrays, which may only grow by appending.
fn merge_path(target: &mut Value, segments: &[&str], value: Value) -> Result<(), String> {
    let Some((head, rest)) = segments.split_first() else {
        *target = value;
        return Ok(());
    };

    if let Value::Array(items) = &mut *target
        && let Ok(index) = head.parse::<usize>()
    {
        if index > items.len() {
            return Err(format!(
                "index {index} skips past the end of a {}-element array",
                items.len()
            ));
        }
        if index == items.len() {
            items.push(Value::Null);
        }
        return match items.get_mut(index) {
            Some(item) => merge_path(item, rest, value),
            None => Err(format!("index {index} out of range")),
        };
    }

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = &mut *target else {
        return Err("path does not address an object".to_owned());
    };
    let next_is_index = rest.first().is_some_and(|s| s.parse::<usize>().is_ok());
    let entry = map.entry((*head).to_owned()).or_insert_with(|| {
        if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Null
        }
    });
    merge_path(entry, rest, value)
}

/// Refresh source backed by EVCC's `/ws` endpoint
pub struct StreamSource {
    url: String,
    cookie: Option<String>,
    connect_timeout: Duration,
    socket: Option<WsStream>,
    document: StreamDocument,
    backoff: Backoff,
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("url", &self.url)
            .field("connected", &self.socket.is_some())
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl StreamSource {
    /// Open the stream; fails if the first connection cannot be established in time
    pub async fn connect(
        url: impl Into<String>,
        cookie: Option<String>,
        connect_timeout: Duration,
        seed: Value,
    ) -> EvccResult<Self> {
        let mut source = Self {
            url: url.into(),
            cookie,
            connect_timeout,
            socket: None,
            document: StreamDocument::new(seed),
            backoff: Backoff::default(),
        };
        source.socket = Some(source.open().await?);
        info!("📡 [EVCC STREAM] Connected to {}", source.url);
        Ok(source)
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn document(&self) -> &Value {
        self.document.document()
    }

    async fn open(&self) -> EvccResult<WsStream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| EvccError::WebSocket(format!("invalid stream url: {e}")))?;
        if let Some(cookie) = &self.cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| EvccError::WebSocket(format!("invalid auth cookie: {e}")))?;
            request.headers_mut().insert(COOKIE, value);
        }

        match tokio::time::timeout(self.connect_timeout, connect_async(request)).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(map_ws_error(e)),
            Err(_) => Err(EvccError::Timeout),
        }
    }

    /// Reconnect until a connection is up, sleeping per backoff between attempts
    async fn reconnect(&mut self) -> EvccResult<()> {
        loop {
            let delay = self.backoff.next_delay();
            info!("🔌 [EVCC STREAM] Reconnecting in {:?}", delay);
            tokio::time::sleep(delay).await;

            match self.open().await {
                Ok(socket) => {
                    info!("📡 [EVCC STREAM] Reconnected to {}", self.url);
                    self.backoff.reset();
                    self.socket = Some(socket);
                    return Ok(());
                }
                Err(e) if e.is_auth() => {
                    error!("❌ [EVCC STREAM] Handshake rejected: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("⚠️ [EVCC STREAM] Reconnect failed: {}", e),
            }
        }
    }
}

fn map_ws_error(e: tungstenite::Error) -> EvccError {
    match e {
        tungstenite::Error::Http(response)
            if matches!(
                response.status(),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
            ) =>
        {
            EvccError::AuthenticationFailed(format!(
                "stream handshake rejected with status {}",
                response.status().as_u16()
            ))
        }
        other => EvccError::WebSocket(other.to_string()),
    }
}

#[async_trait]
impl RefreshSource for StreamSource {
    fn mode(&self) -> TransportMode {
        TransportMode::Stream
    }

    async fn next_payload(&mut self) -> EvccResult<Value> {
        loop {
            let Some(socket) = self.socket.as_mut() else {
                self.reconnect().await?;
                continue;
            };

            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    trace!("   Stream message: {}", text);
                    return self.document.apply(&text).cloned();
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes);
                    return self.document.apply(&text).cloned();
                }
                Some(Ok(Message::Close(frame))) => {
                    warn!("⚠️ [EVCC STREAM] Closed by EVCC: {:?}", frame);
                    self.socket = None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("⚠️ [EVCC STREAM] Connection lost: {}", e);
                    self.socket = None;
                }
                None => {
                    warn!("⚠️ [EVCC STREAM] Connection ended");
                    self.socket = None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!("Stream close failed: {}", e);
            }
            // Drain until the close handshake completes or the peer goes away
            while let Some(Ok(_)) = socket.next().await {}
            info!("🔌 [EVCC STREAM] Disconnected");
        }
    }
}
