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

//! Raw EVCC payload -> canonical [`Snapshot`].
//!
//! Pure: no I/O, no logging side effects beyond `trace!`.

use chrono::Utc;
use serde_json::Value;
use tracing::trace;

use crate::errors::{EvccError, EvccResult};
use crate::snapshot::{
    BatteryMode, BatteryState, ChargeMode, ChargingStatus, Loadpoint, PhaseSetting, PvSystem,
    SiteSnapshot, Snapshot, Vehicle,
};
use crate::types::{
    RawBattery, RawBatteryFields, RawLoadpoint, RawSite, RawState, RawVehicle, RawVehicles,
};

/// Strip the `{"result": {...}}` envelope some EVCC versions wrap the state in
pub fn unwrap_envelope(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) if map.get("result").is_some_and(Value::is_object) => {
            map.remove("result").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Normalize a decoded EVCC state document
pub fn normalize(payload: &Value) -> EvccResult<Snapshot> {
    let root = match payload {
        Value::Object(map) => match map.get("result") {
            Some(inner @ Value::Object(_)) => inner,
            _ => payload,
        },
        other => {
            return Err(EvccError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                json_type_name(other)
            )));
        }
    };

    let raw: RawState = serde_json::from_value(root.clone())
        .map_err(|e| EvccError::InvalidPayload(format!("unexpected state shape: {e}")))?;

    let snapshot = Snapshot {
        received_at: Utc::now(),
        site: site_from(&raw),
        battery: battery_from(&raw),
        pv_systems: pv_systems_from(&raw),
        vehicles: vehicles_from(raw.vehicles.as_ref()),
        loadpoints: raw
            .loadpoints
            .as_deref()
            .unwrap_or_default()
            .iter()
            .zip(1u32..)
            .map(|(lp, id)| loadpoint_from(id, lp))
            .collect(),
    };

    trace!(
        "Normalized snapshot: site={}, battery={}, pv={}, vehicles={}, loadpoints={}",
        snapshot.site.is_some(),
        snapshot.battery.is_some(),
        snapshot.pv_systems.len(),
        snapshot.vehicles.len(),
        snapshot.loadpoints.len()
    );

    Ok(snapshot)
}

fn site_from(raw: &RawState) -> Option<SiteSnapshot> {
    if let Some(site) = &raw.site {
        return Some(SiteSnapshot {
            grid_power_w: site.grid.or(site.grid_power).unwrap_or_default(),
            home_power_w: site.home.or(site.home_power).unwrap_or_default(),
            pv_power_w: site.pv.or(site.pv_power).unwrap_or_default(),
        });
    }

    raw.has_root_site_fields().then(|| SiteSnapshot {
        grid_power_w: raw.grid_power.unwrap_or_default(),
        home_power_w: raw.home_power.unwrap_or_default(),
        pv_power_w: raw.pv_power.unwrap_or_default(),
    })
}

/// Battery data may come from a `battery` section, from the site section or from
/// root-level fields, in that order of preference.
fn battery_from(raw: &RawState) -> Option<BatteryState> {
    let site_mode = raw
        .site
        .as_ref()
        .and_then(|s| s.battery_mode.as_deref())
        .or(raw.battery_mode.as_deref());

    match &raw.battery {
        Some(RawBattery::Single(fields)) => Some(battery_fields(fields, site_mode)),
        Some(RawBattery::Many(list)) if !list.is_empty() => Some(aggregate_batteries(list, site_mode)),
        Some(RawBattery::Many(_)) | None => {
            if let Some(site) = raw.site.as_ref().filter(|s| s.has_battery_fields()) {
                Some(battery_from_site(site))
            } else if raw.has_root_battery_fields() {
                Some(BatteryState {
                    power_w: raw.battery_power.unwrap_or_default(),
                    soc_percent: raw.battery_soc.unwrap_or_default(),
                    mode: site_mode.map(BatteryMode::parse).unwrap_or_default(),
                })
            } else {
                None
            }
        }
    }
}

fn battery_fields(fields: &RawBatteryFields, fallback_mode: Option<&str>) -> BatteryState {
    BatteryState {
        power_w: fields.power.unwrap_or_default(),
        soc_percent: fields.soc.unwrap_or_default(),
        mode: fields
            .mode
            .as_deref()
            .or(fallback_mode)
            .map(BatteryMode::parse)
            .unwrap_or_default(),
    }
}

#[expect(clippy::cast_precision_loss)]
fn aggregate_batteries(list: &[RawBatteryFields], fallback_mode: Option<&str>) -> BatteryState {
    let power_w = list.iter().filter_map(|b| b.power).sum();
    let socs: Vec<f64> = list.iter().filter_map(|b| b.soc).collect();
    let soc_percent = if socs.is_empty() {
        0.0
    } else {
        socs.iter().sum::<f64>() / socs.len() as f64
    };
    let mode = list
        .iter()
        .find_map(|b| b.mode.as_deref())
        .or(fallback_mode)
        .map(BatteryMode::parse)
        .unwrap_or_default();

    BatteryState {
        power_w,
        soc_percent,
        mode,
    }
}

fn battery_from_site(site: &RawSite) -> BatteryState {
    BatteryState {
        power_w: site.battery_power.unwrap_or_default(),
        soc_percent: site.battery_soc.unwrap_or_default(),
        mode: site
            .battery_mode
            .as_deref()
            .map(BatteryMode::parse)
            .unwrap_or_default(),
    }
}

fn pv_systems_from(raw: &RawState) -> Vec<PvSystem> {
    raw.pv
        .as_deref()
        .unwrap_or_default()
        .iter()
        .zip(1u32..)
        .map(|(pv, id)| PvSystem {
            id,
            power_w: pv.power.unwrap_or_default(),
        })
        .collect()
}

fn vehicles_from(raw: Option<&RawVehicles>) -> Vec<Vehicle> {
    match raw {
        None => Vec::new(),
        Some(RawVehicles::List(list)) => list
            .iter()
            .zip(1u32..)
            .map(|(v, position)| {
                let id = position.to_string();
                let title = v
                    .title
                    .clone()
                    .or_else(|| v.name.clone())
                    .unwrap_or_else(|| format!("Vehicle {id}"));
                vehicle_from(id, title, v)
            })
            .collect(),
        Some(RawVehicles::Map(map)) => map
            .iter()
            .map(|(name, v)| {
                let title = v.title.clone().unwrap_or_else(|| name.clone());
                vehicle_from(name.clone(), title, v)
            })
            .collect(),
    }
}

fn vehicle_from(id: String, title: String, raw: &RawVehicle) -> Vehicle {
    Vehicle {
        id,
        title,
        soc_percent: raw.soc.or(raw.vehicle_soc).unwrap_or_default(),
        range_km: raw.range.or(raw.vehicle_range).unwrap_or_default(),
        status: raw
            .status
            .as_deref()
            .map(ChargingStatus::parse)
            .unwrap_or_default(),
    }
}

#[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn loadpoint_from(id: u32, raw: &RawLoadpoint) -> Loadpoint {
    let charging = raw.charging.unwrap_or(false);
    let timer_secs = raw.charge_timer.or(raw.charge_duration).unwrap_or_default();
    let charge_timer_minutes = if charging && timer_secs > 0.0 {
        (timer_secs / 60.0).floor().min(f64::from(u32::MAX)) as u32
    } else {
        0
    };

    Loadpoint {
        id,
        title: raw
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("Loadpoint {id}")),
        charge_power_w: raw.charge_power.or(raw.power).unwrap_or_default(),
        charged_energy_wh: raw.charged_energy.unwrap_or_default(),
        mode: raw.mode.as_deref().map(ChargeMode::parse).unwrap_or_default(),
        phases: raw
            .phases
            .or(raw.phases_configured)
            .map(PhaseSetting::from_count)
            .unwrap_or_default(),
        min_soc_percent: raw.min_soc,
        target_soc_percent: raw.target_soc.or(raw.limit_soc),
        charging,
        charge_timer_minutes,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_site_section() {
        let snapshot = normalize(&json!({"site": {"grid": -500, "home": 1200, "pv": 1800}})).unwrap();

        let site = snapshot.site.unwrap();
        assert_eq!(site.grid_power_w, -500.0);
        assert_eq!(site.home_power_w, 1200.0);
        assert_eq!(site.pv_power_w, 1800.0);
        assert!(snapshot.battery.is_none());
        assert!(snapshot.pv_systems.is_empty());
        assert!(snapshot.vehicles.is_empty());
        assert!(snapshot.loadpoints.is_empty());
    }

    #[test]
    fn test_site_defaults_missing_fields_to_zero() {
        let snapshot = normalize(&json!({"site": {"gridPower": 250}})).unwrap();
        let site = snapshot.site.unwrap();
        assert_eq!(site.grid_power_w, 250.0);
        assert_eq!(site.home_power_w, 0.0);
        assert_eq!(site.pv_power_w, 0.0);
    }

    #[test]
    fn test_native_root_layout() {
        let snapshot = normalize(&json!({
            "gridPower": 100,
            "homePower": 400,
            "pvPower": 300,
            "batteryPower": -200,
            "batterySoc": 64,
            "batteryMode": "hold",
            "pv": [{"power": 180}, {"power": 120}]
        }))
        .unwrap();

        assert_eq!(snapshot.site.unwrap().home_power_w, 400.0);
        let battery = snapshot.battery.unwrap();
        assert_eq!(battery.power_w, -200.0);
        assert_eq!(battery.soc_percent, 64.0);
        assert_eq!(battery.mode, BatteryMode::Hold);
        assert_eq!(snapshot.pv_systems.len(), 2);
        assert_eq!(snapshot.pv_systems[1].id, 2);
        assert_eq!(snapshot.pv_systems[1].power_w, 120.0);
    }

    #[test]
    fn test_result_envelope() {
        let snapshot = normalize(&json!({"result": {"site": {"grid": 1}}})).unwrap();
        assert_eq!(snapshot.site.unwrap().grid_power_w, 1.0);

        let unwrapped = unwrap_envelope(json!({"result": {"site": {}}}));
        assert_eq!(unwrapped, json!({"site": {}}));
    }

    #[test]
    fn test_battery_from_site_fields() {
        let snapshot =
            normalize(&json!({"site": {"grid": 0, "batterySoc": 80, "batteryMode": "charge"}}))
                .unwrap();
        let battery = snapshot.battery.unwrap();
        assert_eq!(battery.soc_percent, 80.0);
        assert_eq!(battery.power_w, 0.0);
        assert_eq!(battery.mode, BatteryMode::Charge);
    }

    #[test]
    fn test_battery_array_aggregates() {
        let snapshot = normalize(&json!({
            "battery": [{"power": 100, "soc": 40}, {"power": 300, "soc": 60}]
        }))
        .unwrap();
        let battery = snapshot.battery.unwrap();
        assert_eq!(battery.power_w, 400.0);
        assert_eq!(battery.soc_percent, 50.0);
    }

    #[test]
    fn test_no_battery_without_data() {
        let snapshot = normalize(&json!({"site": {"grid": 1}, "battery": []})).unwrap();
        assert!(snapshot.battery.is_none());
    }

    #[test]
    fn test_loadpoint_fields() {
        let snapshot = normalize(&json!({"loadpoints": [
            {"title": "Garage", "chargePower": 11000, "chargedEnergy": 5300, "mode": "minpv",
             "phasesConfigured": 3, "minSoc": 20, "limitSoc": 80, "charging": true, "chargeDuration": 1810},
            {"power": 7400, "mode": "pv", "phases": 1}
        ]}))
        .unwrap();

        let garage = snapshot.loadpoint(1).unwrap();
        assert_eq!(garage.title, "Garage");
        assert_eq!(garage.charge_power_w, 11000.0);
        assert_eq!(garage.charged_energy_wh, 5300.0);
        assert_eq!(garage.mode, ChargeMode::MinPv);
        assert_eq!(garage.phases, PhaseSetting::Three);
        assert_eq!(garage.min_soc_percent, Some(20.0));
        assert_eq!(garage.target_soc_percent, Some(80.0));
        assert_eq!(garage.charge_timer_minutes, 30);

        let second = snapshot.loadpoint(2).unwrap();
        assert_eq!(second.title, "Loadpoint 2");
        assert_eq!(second.charge_power_w, 7400.0);
        assert_eq!(second.phases, PhaseSetting::Single);
        assert_eq!(second.min_soc_percent, None);
        assert_eq!(second.charge_timer_minutes, 0);
    }

    #[test]
    fn test_timer_zero_when_not_charging() {
        let snapshot =
            normalize(&json!({"loadpoints": [{"charging": false, "chargeTimer": 3600}]})).unwrap();
        assert_eq!(snapshot.loadpoints[0].charge_timer_minutes, 0);
    }

    #[test]
    fn test_vehicles_by_position_and_name() {
        let listed = normalize(&json!({"vehicles": [
            {"title": "Zoe", "soc": 55, "range": 180, "status": "B"},
            {"name": "ID.3"}
        ]}))
        .unwrap();
        assert_eq!(listed.vehicles[0].id, "1");
        assert_eq!(listed.vehicles[0].status, ChargingStatus::Charging);
        assert_eq!(listed.vehicles[1].title, "ID.3");
        assert_eq!(listed.vehicles[1].soc_percent, 0.0);

        let keyed = normalize(&json!({"vehicles": {"db:2": {"title": "Model 3", "vehicleSoc": 71}}}))
            .unwrap();
        let vehicle = keyed.vehicle("db:2").unwrap();
        assert_eq!(vehicle.title, "Model 3");
        assert_eq!(vehicle.soc_percent, 71.0);
    }

    #[test]
    fn test_loadpoint_identity_stable() {
        let payload = json!({"loadpoints": [{"title": "A"}, {"title": "B"}]});
        let first = normalize(&payload).unwrap();
        let second = normalize(&payload).unwrap();

        let ids = |s: &Snapshot| s.loadpoints.iter().map(|lp| lp.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), vec![1, 2]);
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            normalize(&json!([1, 2])),
            Err(EvccError::InvalidPayload(_))
        ));
        assert!(matches!(
            normalize(&json!({"loadpoints": "nope"})),
            Err(EvccError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_empty_object_is_empty_snapshot() {
        let snapshot = normalize(&json!({})).unwrap();
        assert!(snapshot.site.is_none());
        assert!(snapshot.battery.is_none());
        assert!(snapshot.loadpoints.is_empty());
    }
}
