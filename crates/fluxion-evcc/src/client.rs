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

use crate::config::EvccConfig;
use crate::errors::{EvccError, EvccResult};
use crate::normalizer::unwrap_envelope;
use crate::snapshot::{BatteryMode, ChargeMode, PhaseSetting};
use parking_lot::RwLock;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const AUTH_COOKIE: &str = "auth";

/// EVCC REST API client
pub struct EvccClient {
    base_url: String,
    password: Option<String>,
    client: Client,
    /// Value of the `auth` cookie after a successful login
    auth_cookie: RwLock<Option<String>>,
    max_retries: u32,
    retry_delay: Duration,
}

impl fmt::Debug for EvccClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvccClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.auth_cookie.read().is_some())
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl EvccClient {
    pub fn new(
        base_url: impl Into<String>,
        password: Option<String>,
        request_timeout: Duration,
    ) -> EvccResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EvccError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            password: password.filter(|p| !p.is_empty()),
            client,
            auth_cookie: RwLock::new(None),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        })
    }

    pub fn from_config(config: &EvccConfig) -> EvccResult<Self> {
        info!("Initializing EVCC client: {}", config.base_url());
        Self::new(
            config.base_url(),
            config.password.clone(),
            config.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `Cookie` header value for authenticated requests and the WebSocket handshake
    pub fn auth_cookie(&self) -> Option<String> {
        self.auth_cookie
            .read()
            .as_ref()
            .map(|value| format!("{AUTH_COOKIE}={value}"))
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn with_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth_cookie() {
            Some(cookie) => request.header(COOKIE, cookie),
            None => request,
        }
    }

    /// Log in when a password is configured; a no-op otherwise
    pub async fn login(&self) -> EvccResult<()> {
        let Some(password) = self.password.as_deref() else {
            debug!("No EVCC password configured, skipping login");
            return Ok(());
        };

        let url = self.api_url("auth/login");
        info!("🔐 [EVCC AUTH] Logging in");
        let body = json!({ "password": password });
        let response = self
            .retry_request(|| async { self.client.post(&url).json(&body).send().await })
            .await?;

        match response.status() {
            StatusCode::OK => {
                let cookie = response
                    .headers()
                    .get_all(SET_COOKIE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .find_map(parse_auth_cookie);
                match cookie {
                    Some(value) => {
                        *self.auth_cookie.write() = Some(value);
                        info!("✅ [EVCC AUTH] Logged in");
                        Ok(())
                    }
                    None => {
                        error!("❌ [EVCC AUTH] No auth cookie received after login");
                        Err(EvccError::AuthenticationFailed(
                            "no auth cookie in login response".to_owned(),
                        ))
                    }
                }
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                error!("❌ [EVCC AUTH] Login rejected: {}", response.status());
                Err(EvccError::AuthenticationFailed(format!(
                    "login rejected with status {}",
                    response.status().as_u16()
                )))
            }
            status => Err(EvccError::ApiError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Log out if logged in. Failures are logged, never returned.
    pub async fn logout(&self) {
        if self.auth_cookie.read().is_none() {
            return;
        }
        let url = self.api_url("auth/logout");
        match self.with_auth(self.client.post(&url)).send().await {
            Ok(response) if response.status().is_success() => {
                info!("👋 [EVCC AUTH] Logged out");
            }
            Ok(response) => warn!("Logout returned status {}", response.status()),
            Err(e) => warn!("Logout failed: {}", e),
        }
        *self.auth_cookie.write() = None;
    }

    /// Fetch the full state document, with any `result` envelope removed
    pub async fn fetch_state(&self) -> EvccResult<Value> {
        let url = self.api_url("state");
        debug!("🔍 [EVCC QUERY] GET {}", url);

        let response = self
            .retry_request(|| async { self.with_auth(self.client.get(&url)).send().await })
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                let value: Value = serde_json::from_str(&body)
                    .map_err(|e| EvccError::InvalidPayload(format!("state is not JSON: {e}")))?;
                let state = unwrap_envelope(value);
                if !state.is_object() {
                    return Err(EvccError::InvalidPayload(
                        "state root is not an object".to_owned(),
                    ));
                }
                trace!("   State: {}", state);
                Ok(state)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                error!("❌ [EVCC ERROR] State request not authorized");
                Err(EvccError::AuthenticationFailed(format!(
                    "state request rejected with status {}",
                    response.status().as_u16()
                )))
            }
            status => {
                let message = response.text().await.unwrap_or_default();
                debug!("❌ [EVCC ERROR] Status {}: {}", status, message);
                Err(EvccError::ApiError {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    pub async fn set_loadpoint_mode(&self, loadpoint: u32, mode: ChargeMode) -> EvccResult<()> {
        self.command(&format!("loadpoints/{loadpoint}/mode/{}", mode.api_value()))
            .await
    }

    pub async fn set_loadpoint_phases(&self, loadpoint: u32, phases: PhaseSetting) -> EvccResult<()> {
        self.command(&format!("loadpoints/{loadpoint}/phases/{}", phases.count()))
            .await
    }

    pub async fn set_loadpoint_min_soc(&self, loadpoint: u32, soc: u8) -> EvccResult<()> {
        self.command(&format!("loadpoints/{loadpoint}/minsoc/{soc}"))
            .await
    }

    pub async fn set_loadpoint_target_soc(&self, loadpoint: u32, soc: u8) -> EvccResult<()> {
        self.command(&format!("loadpoints/{loadpoint}/limitsoc/{soc}"))
            .await
    }

    pub async fn set_battery_mode(&self, mode: BatteryMode) -> EvccResult<()> {
        self.command(&format!("batterymode/{}", mode.api_value()))
            .await
    }

    async fn command(&self, path: &str) -> EvccResult<()> {
        let url = self.api_url(path);
        info!("📞 [EVCC COMMAND] POST {}", path);

        let response = self
            .retry_request(|| async { self.with_auth(self.client.post(&url)).send().await })
            .await?;

        let status = response.status();
        match status {
            StatusCode::OK => {
                info!("✅ [EVCC COMMAND] Success: {}", path);
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                error!("❌ [EVCC COMMAND] Not authorized: {}", path);
                Err(EvccError::AuthenticationFailed(format!(
                    "command rejected with status {}",
                    status.as_u16()
                )))
            }
            _ => {
                let reason = response.text().await.unwrap_or_default();
                error!("❌ [EVCC COMMAND] Failed: {} (status: {})", path, status);
                Err(EvccError::CommandFailed {
                    command: path.to_owned(),
                    reason: format!("status {}: {reason}", status.as_u16()),
                })
            }
        }
    }

    /// Retry a request with exponential backoff
    async fn retry_request<F, Fut>(&self, mut request_fn: F) -> EvccResult<reqwest::Response>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempts = 0;
        let mut delay = self.retry_delay;

        loop {
            attempts += 1;
            match request_fn().await {
                Ok(response) => return Ok(response),
                Err(e) if attempts >= self.max_retries => {
                    debug!("Request failed after {} attempts: {}", attempts, e);
                    return Err(if e.is_timeout() {
                        EvccError::Timeout
                    } else {
                        EvccError::HttpError(e)
                    });
                }
                Err(e) => {
                    debug!(
                        "Request failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempts, self.max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    /// Set custom retry configuration
    #[must_use]
    pub fn with_retry_config(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }
}

/// Extract the `auth` value from one `Set-Cookie` header
fn parse_auth_cookie(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    (name.trim() == AUTH_COOKIE && !value.is_empty()).then(|| value.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use mockito::{Matcher, Server};

    fn client(url: &str, password: Option<&str>) -> EvccClient {
        EvccClient::new(url, password.map(str::to_owned), Duration::from_secs(5))
            .unwrap()
            .with_retry_config(2, Duration::from_millis(10))
    }

    #[test]
    fn test_parse_auth_cookie() {
        assert_eq!(
            parse_auth_cookie("auth=abc123; Path=/; HttpOnly"),
            Some("abc123".to_owned())
        );
        assert_eq!(parse_auth_cookie("session=xyz; Path=/"), None);
        assert_eq!(parse_auth_cookie("auth=; Path=/"), None);
    }

    #[tokio::test]
    async fn test_fetch_state_unwraps_envelope() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/state")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"result": {"site": {"grid": -500}}}"#)
            .create_async()
            .await;

        let state = client(&server.url(), None).fetch_state().await.unwrap();

        assert_eq!(state["site"]["grid"], -500);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_state_error_kinds() {
        let mut server = Server::new_async().await;
        let evcc = client(&server.url(), None);

        let unauthorized = server
            .mock("GET", "/api/state")
            .with_status(401)
            .create_async()
            .await;
        assert_eq!(evcc.fetch_state().await.unwrap_err().kind(), ErrorKind::Auth);
        unauthorized.remove_async().await;

        let unavailable = server
            .mock("GET", "/api/state")
            .with_status(503)
            .create_async()
            .await;
        assert!(matches!(
            evcc.fetch_state().await,
            Err(EvccError::ApiError { status: 503, .. })
        ));
        unavailable.remove_async().await;

        let not_object = server
            .mock("GET", "/api/state")
            .with_status(200)
            .with_body("[1, 2, 3]")
            .create_async()
            .await;
        assert_eq!(evcc.fetch_state().await.unwrap_err().kind(), ErrorKind::Decode);
        not_object.remove_async().await;

        let _not_json = server
            .mock("GET", "/api/state")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;
        assert_eq!(evcc.fetch_state().await.unwrap_err().kind(), ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_unreachable_is_transport_error() {
        let evcc = client("http://127.0.0.1:1", None);
        let err = evcc.fetch_state().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_login_cookie_sent_on_requests() {
        let mut server = Server::new_async().await;
        let login = server
            .mock("POST", "/api/auth/login")
            .match_body(Matcher::Json(json!({"password": "secret"})))
            .with_status(200)
            .with_header("set-cookie", "auth=token42; Path=/; HttpOnly")
            .create_async()
            .await;
        let state = server
            .mock("GET", "/api/state")
            .match_header("cookie", "auth=token42")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;
        let logout = server
            .mock("POST", "/api/auth/logout")
            .match_header("cookie", "auth=token42")
            .with_status(200)
            .create_async()
            .await;

        let evcc = client(&server.url(), Some("secret"));
        evcc.login().await.unwrap();
        assert_eq!(evcc.auth_cookie().as_deref(), Some("auth=token42"));
        evcc.fetch_state().await.unwrap();
        evcc.logout().await;
        assert!(evcc.auth_cookie().is_none());

        login.assert_async().await;
        state.assert_async().await;
        logout.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = Server::new_async().await;
        let _login = server
            .mock("POST", "/api/auth/login")
            .with_status(401)
            .create_async()
            .await;

        let err = client(&server.url(), Some("wrong")).login().await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_login_skipped_without_password() {
        let server = Server::new_async().await;
        // No mocks registered; any request would get a 501 from mockito
        client(&server.url(), None).login().await.unwrap();
        client(&server.url(), Some("")).login().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_paths() {
        let mut server = Server::new_async().await;
        let mode = server
            .mock("POST", "/api/loadpoints/1/mode/minpv")
            .with_status(200)
            .create_async()
            .await;
        let phases = server
            .mock("POST", "/api/loadpoints/2/phases/3")
            .with_status(200)
            .create_async()
            .await;
        let target = server
            .mock("POST", "/api/loadpoints/1/limitsoc/80")
            .with_status(200)
            .create_async()
            .await;
        let battery = server
            .mock("POST", "/api/batterymode/hold")
            .with_status(200)
            .create_async()
            .await;

        let evcc = client(&server.url(), None);
        evcc.set_loadpoint_mode(1, ChargeMode::MinPv).await.unwrap();
        evcc.set_loadpoint_phases(2, PhaseSetting::Three).await.unwrap();
        evcc.set_loadpoint_target_soc(1, 80).await.unwrap();
        evcc.set_battery_mode(BatteryMode::Hold).await.unwrap();

        mode.assert_async().await;
        phases.assert_async().await;
        target.assert_async().await;
        battery.assert_async().await;
    }

    #[tokio::test]
    async fn test_command_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/loadpoints/1/minsoc/20")
            .with_status(400)
            .with_body("invalid")
            .create_async()
            .await;

        let err = client(&server.url(), None)
            .set_loadpoint_min_soc(1, 20)
            .await
            .unwrap_err();
        assert!(matches!(err, EvccError::CommandFailed { .. }));
    }
}
