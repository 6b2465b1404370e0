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

//! Raw EVCC payload shapes.
//!
//! Every scalar is decoded leniently into `Option<T>`: numbers, numeric strings and
//! booleans are coerced, anything else becomes `None`. Container types are strict,
//! so a `loadpoints` that is not an array fails the whole decode.
//!
//! EVCC renamed several fields over time; where two spellings exist both are kept
//! as separate fields because payloads in the wild sometimes carry both.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawState {
    pub site: Option<RawSite>,
    pub battery: Option<RawBattery>,
    pub pv: Option<Vec<RawPv>>,
    pub loadpoints: Option<Vec<RawLoadpoint>>,
    pub vehicles: Option<RawVehicles>,

    // EVCC's native layout keeps site values at the root
    #[serde(rename = "gridPower", deserialize_with = "lenient_f64")]
    pub grid_power: Option<f64>,
    #[serde(rename = "homePower", deserialize_with = "lenient_f64")]
    pub home_power: Option<f64>,
    #[serde(rename = "pvPower", deserialize_with = "lenient_f64")]
    pub pv_power: Option<f64>,
    #[serde(rename = "batteryPower", deserialize_with = "lenient_f64")]
    pub battery_power: Option<f64>,
    #[serde(rename = "batterySoc", deserialize_with = "lenient_f64")]
    pub battery_soc: Option<f64>,
    #[serde(rename = "batteryMode", deserialize_with = "lenient_string")]
    pub battery_mode: Option<String>,
}

impl RawState {
    pub fn has_root_site_fields(&self) -> bool {
        self.grid_power.is_some() || self.home_power.is_some() || self.pv_power.is_some()
    }

    pub fn has_root_battery_fields(&self) -> bool {
        self.battery_power.is_some() || self.battery_soc.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSite {
    #[serde(deserialize_with = "lenient_f64")]
    pub grid: Option<f64>,
    #[serde(rename = "gridPower", deserialize_with = "lenient_f64")]
    pub grid_power: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub home: Option<f64>,
    #[serde(rename = "homePower", deserialize_with = "lenient_f64")]
    pub home_power: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub pv: Option<f64>,
    #[serde(rename = "pvPower", deserialize_with = "lenient_f64")]
    pub pv_power: Option<f64>,
    #[serde(rename = "batteryPower", deserialize_with = "lenient_f64")]
    pub battery_power: Option<f64>,
    #[serde(rename = "batterySoc", deserialize_with = "lenient_f64")]
    pub battery_soc: Option<f64>,
    #[serde(rename = "batteryMode", deserialize_with = "lenient_string")]
    pub battery_mode: Option<String>,
}

impl RawSite {
    pub fn has_battery_fields(&self) -> bool {
        self.battery_power.is_some() || self.battery_soc.is_some()
    }
}

/// `battery` is an object on older releases and a per-device array on newer ones.
/// `Many` must stay first, a struct also deserializes from a sequence.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawBattery {
    Many(Vec<RawBatteryFields>),
    Single(RawBatteryFields),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawBatteryFields {
    #[serde(deserialize_with = "lenient_f64")]
    pub power: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub soc: Option<f64>,
    #[serde(deserialize_with = "lenient_string")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPv {
    #[serde(deserialize_with = "lenient_f64")]
    pub power: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawLoadpoint {
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub power: Option<f64>,
    #[serde(rename = "chargePower", deserialize_with = "lenient_f64")]
    pub charge_power: Option<f64>,
    #[serde(rename = "chargedEnergy", deserialize_with = "lenient_f64")]
    pub charged_energy: Option<f64>,
    #[serde(deserialize_with = "lenient_string")]
    pub mode: Option<String>,
    #[serde(deserialize_with = "lenient_i64")]
    pub phases: Option<i64>,
    #[serde(rename = "phasesConfigured", deserialize_with = "lenient_i64")]
    pub phases_configured: Option<i64>,
    #[serde(rename = "minSoc", deserialize_with = "lenient_f64")]
    pub min_soc: Option<f64>,
    #[serde(rename = "targetSoc", deserialize_with = "lenient_f64")]
    pub target_soc: Option<f64>,
    #[serde(rename = "limitSoc", deserialize_with = "lenient_f64")]
    pub limit_soc: Option<f64>,
    #[serde(deserialize_with = "lenient_bool")]
    pub charging: Option<bool>,
    /// Seconds
    #[serde(rename = "chargeTimer", deserialize_with = "lenient_f64")]
    pub charge_timer: Option<f64>,
    /// Seconds
    #[serde(rename = "chargeDuration", deserialize_with = "lenient_f64")]
    pub charge_duration: Option<f64>,
}

/// `vehicles` is a list in the plugin-facing API and a name-keyed map in EVCC's own state
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawVehicles {
    List(Vec<RawVehicle>),
    Map(BTreeMap<String, RawVehicle>),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawVehicle {
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub soc: Option<f64>,
    #[serde(rename = "vehicleSoc", deserialize_with = "lenient_f64")]
    pub vehicle_soc: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub range: Option<f64>,
    #[serde(rename = "vehicleRange", deserialize_with = "lenient_f64")]
    pub vehicle_range: Option<f64>,
    #[serde(deserialize_with = "lenient_string")]
    pub status: Option<String>,
}

/// Coerce a JSON scalar into `f64`
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_f64(&value))
}

#[expect(clippy::cast_possible_truncation)]
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match &value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        other => coerce_f64(other).map(|f| f.round() as i64),
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    })
}
