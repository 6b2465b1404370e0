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

//! End-to-end session tests against a mocked EVCC instance

use fluxion_evcc::devices::DeviceValue;
use fluxion_evcc::registry::RegistryCall;
use fluxion_evcc::{
    AppConfig, DeviceKey, DeviceKind, ErrorKind, InMemoryDeviceRegistry, Parameter, Session,
    TransportMode,
};
use mockito::{Mock, Server, ServerGuard};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn config_for(server: &ServerGuard, transport: TransportMode) -> AppConfig {
    let address = server.host_with_port();
    let (host, port) = address.rsplit_once(':').unwrap();
    let mut config = AppConfig::default();
    config.evcc.host = host.to_owned();
    config.evcc.port = port.parse().unwrap();
    config.evcc.transport = transport;
    config.evcc.request_timeout_secs = 2;
    config.evcc.connect_timeout_secs = 2;
    config
}

async fn mock_state(server: &mut ServerGuard, body: Value) -> Mock {
    server
        .mock("GET", "/api/state")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body.to_string())
        .create_async()
        .await
}

async fn start(server: &ServerGuard, registry: &Arc<InMemoryDeviceRegistry>) -> Session {
    Session::start(config_for(server, TransportMode::Poll), registry.clone())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_site_only_payload_touches_site_devices_only() {
    let mut server = Server::new_async().await;
    let _state = mock_state(
        &mut server,
        json!({"site": {"grid": -500, "home": 1200, "pv": 1800}}),
    )
    .await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let session = start(&server, &registry).await;

    let site = session.snapshot().unwrap().site.unwrap();
    assert_eq!(site.grid_power_w, -500.0);
    assert_eq!(site.home_power_w, 1200.0);
    assert_eq!(site.pv_power_w, 1800.0);

    let devices = registry.devices();
    assert_eq!(devices.len(), 3);
    assert!(devices.iter().all(|d| d.descriptor.key.kind == DeviceKind::Site));
    assert_eq!(
        registry.device(&DeviceKey::site(Parameter::GridPower)).unwrap().value,
        Some(DeviceValue::Power(-500.0))
    );
}

#[tokio::test]
async fn test_no_battery_devices_without_battery_data() {
    let mut server = Server::new_async().await;
    let _state = mock_state(
        &mut server,
        json!({"site": {"grid": 10}, "loadpoints": [{"title": "Garage"}]}),
    )
    .await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let _session = start(&server, &registry).await;

    assert!(
        registry
            .devices()
            .iter()
            .all(|d| d.descriptor.key.kind != DeviceKind::Battery)
    );
}

#[tokio::test]
async fn test_repeated_loadpoint_payload_sends_no_updates() {
    let mut server = Server::new_async().await;
    let payload = json!({
        "loadpoints": [{
            "title": "Garage",
            "chargePower": 7400,
            "chargedEnergy": 5300,
            "mode": "pv",
            "phases": 3,
            "minSoc": 20,
            "limitSoc": 80,
            "charging": true,
            "chargeTimer": 1800
        }]
    });
    let _state = mock_state(&mut server, payload.clone()).await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let mut session = start(&server, &registry).await;
    let first_updates = registry.update_count();
    assert_eq!(first_updates, 7);

    let report = session.apply_payload(&payload).await.unwrap();

    assert_eq!(report.updated, 0);
    assert_eq!(report.created, 0);
    assert_eq!(registry.update_count(), first_updates);
    assert_eq!(
        registry
            .device(&DeviceKey::loadpoint(1, Parameter::ChargingTimer))
            .unwrap()
            .value,
        Some(DeviceValue::Counter(30))
    );
}

#[tokio::test]
async fn test_loadpoint_identity_stable_across_refreshes() {
    let mut server = Server::new_async().await;
    let _state = mock_state(
        &mut server,
        json!({"loadpoints": [{"title": "Garage"}, {"title": "Carport"}]}),
    )
    .await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let mut session = start(&server, &registry).await;
    let unit_before = registry
        .device(&DeviceKey::loadpoint(2, Parameter::ChargingPower))
        .unwrap()
        .unit;
    registry.clear_calls();

    session
        .apply_payload(&json!({"loadpoints": [{"title": "Garage"}, {"title": "Carport", "chargePower": 3700}]}))
        .await
        .unwrap();

    let key = DeviceKey::loadpoint(2, Parameter::ChargingPower);
    assert_eq!(registry.device(&key).unwrap().unit, unit_before);
    assert_eq!(
        registry.calls(),
        vec![RegistryCall::Update(key, DeviceValue::Power(3700.0))]
    );
}

#[tokio::test]
async fn test_malformed_payload_keeps_previous_snapshot() {
    let mut server = Server::new_async().await;
    let _state = mock_state(&mut server, json!({"site": {"grid": 100}})).await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let mut session = start(&server, &registry).await;
    let before = session.snapshot().cloned();
    registry.clear_calls();

    let err = session
        .apply_payload(&json!({"loadpoints": "broken"}))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Decode);
    assert_eq!(session.snapshot().cloned(), before);
    assert!(registry.calls().is_empty());
}

#[tokio::test]
async fn test_auth_rejection_is_fatal_at_start() {
    let mut server = Server::new_async().await;
    let _state = server
        .mock("GET", "/api/state")
        .with_status(401)
        .create_async()
        .await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let err = Session::start(config_for(&server, TransportMode::Poll), registry)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test]
async fn test_unavailable_evcc_starts_without_devices() {
    let mut server = Server::new_async().await;
    let _state = server
        .mock("GET", "/api/state")
        .with_status(503)
        .create_async()
        .await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let session = start(&server, &registry).await;

    assert!(session.snapshot().is_none());
    assert!(registry.devices().is_empty());
}

#[tokio::test]
async fn test_stream_without_websocket_endpoint_degrades_to_poll() {
    let mut server = Server::new_async().await;
    let _state = mock_state(&mut server, json!({"site": {"grid": 1}})).await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let session = Session::start(config_for(&server, TransportMode::Stream), registry)
        .await
        .unwrap();

    assert_eq!(session.mode(), TransportMode::Poll);
}

#[tokio::test]
async fn test_run_returns_on_shutdown() {
    let mut server = Server::new_async().await;
    let _state = mock_state(&mut server, json!({})).await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let mut session = start(&server, &registry).await;
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    session.run(shutdown).await.unwrap();
    session.stop().await;
}

#[tokio::test]
async fn test_command_reflected_on_device() {
    let mut server = Server::new_async().await;
    let _state = mock_state(
        &mut server,
        json!({"loadpoints": [{"mode": "off"}], "battery": {"power": 0, "soc": 50, "mode": "normal"}}),
    )
    .await;
    let mode = server
        .mock("POST", "/api/loadpoints/1/mode/pv")
        .with_status(200)
        .create_async()
        .await;
    let battery = server
        .mock("POST", "/api/batterymode/hold")
        .with_status(200)
        .create_async()
        .await;
    let registry = Arc::new(InMemoryDeviceRegistry::new());

    let mut session = start(&server, &registry).await;
    let mode_key = DeviceKey::loadpoint(1, Parameter::Mode);
    let battery_key = DeviceKey::battery(Parameter::Mode);

    session.handle_command(&mode_key, 30).await.unwrap();
    session.handle_command(&battery_key, 20).await.unwrap();

    mode.assert_async().await;
    battery.assert_async().await;
    assert_eq!(
        registry.device(&mode_key).unwrap().value,
        Some(DeviceValue::Selector(30))
    );
    assert_eq!(
        registry.device(&battery_key).unwrap().value,
        Some(DeviceValue::Selector(20))
    );

    // Read-only devices and invalid levels are rejected without calling EVCC
    assert!(
        session
            .handle_command(&DeviceKey::loadpoint(1, Parameter::ChargingPower), 0)
            .await
            .is_err()
    );
    assert!(session.handle_command(&mode_key, 15).await.is_err());
}
