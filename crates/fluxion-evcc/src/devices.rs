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

//! Device slots exposed to the host platform.
//!
//! A [`DeviceKey`] names one device for the life of the session and renders as
//! `{kind}_{id}_{parameter}`, e.g. `loadpoint_1_charging_power`. That string is the
//! description stored with the host device, so it must never change shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::snapshot::{BatteryMode, ChargeMode, ChargingStatus, PhaseSetting, Snapshot};

/// Entity families and their unit number bases in the host registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Site,
    Battery,
    Pv,
    Vehicle,
    Loadpoint,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Site => "site",
            Self::Battery => "battery",
            Self::Pv => "pv",
            Self::Vehicle => "vehicle",
            Self::Loadpoint => "loadpoint",
        }
    }

    /// Entities that come and go with EVCC's configuration
    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::Pv | Self::Vehicle | Self::Loadpoint)
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "site" => Ok(Self::Site),
            "battery" => Ok(Self::Battery),
            "pv" => Ok(Self::Pv),
            "vehicle" => Ok(Self::Vehicle),
            "loadpoint" => Ok(Self::Loadpoint),
            other => Err(format!("unknown device kind '{other}'")),
        }
    }
}

/// Measured or controlled quantity of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    GridPower,
    HomePower,
    PvPower,
    Power,
    Soc,
    Mode,
    Range,
    Status,
    ChargingPower,
    ChargedEnergy,
    Phases,
    MinSoc,
    TargetSoc,
    ChargingTimer,
}

impl Parameter {
    pub const ALL: [Parameter; 14] = [
        Self::GridPower,
        Self::HomePower,
        Self::PvPower,
        Self::Power,
        Self::Soc,
        Self::Mode,
        Self::Range,
        Self::Status,
        Self::ChargingPower,
        Self::ChargedEnergy,
        Self::Phases,
        Self::MinSoc,
        Self::TargetSoc,
        Self::ChargingTimer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GridPower => "grid_power",
            Self::HomePower => "home_power",
            Self::PvPower => "pv_power",
            Self::Power => "power",
            Self::Soc => "soc",
            Self::Mode => "mode",
            Self::Range => "range",
            Self::Status => "status",
            Self::ChargingPower => "charging_power",
            Self::ChargedEnergy => "charged_energy",
            Self::Phases => "phases",
            Self::MinSoc => "min_soc",
            Self::TargetSoc => "target_soc",
            Self::ChargingTimer => "charging_timer",
        }
    }

    /// Name suffix shown on the host device
    pub fn display_name(self) -> &'static str {
        match self {
            Self::GridPower => "Grid Power",
            Self::HomePower => "Home Power",
            Self::PvPower => "PV Power",
            Self::Power => "Power",
            Self::Soc => "SoC",
            Self::Mode => "Mode",
            Self::Range => "Range",
            Self::Status => "Status",
            Self::ChargingPower => "Charging Power",
            Self::ChargedEnergy => "Charged Energy",
            Self::Phases => "Charging Phases",
            Self::MinSoc => "Min SoC",
            Self::TargetSoc => "Target SoC",
            Self::ChargingTimer => "Charging Timer",
        }
    }
}

impl FromStr for Parameter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown device parameter '{s}'"))
    }
}

/// Stable identity of one host device
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceKey {
    pub kind: DeviceKind,
    pub id: String,
    pub parameter: Parameter,
}

impl DeviceKey {
    pub fn new(kind: DeviceKind, id: impl Into<String>, parameter: Parameter) -> Self {
        Self {
            kind,
            id: id.into(),
            parameter,
        }
    }

    pub fn site(parameter: Parameter) -> Self {
        Self::new(DeviceKind::Site, "1", parameter)
    }

    pub fn battery(parameter: Parameter) -> Self {
        Self::new(DeviceKind::Battery, "1", parameter)
    }

    pub fn loadpoint(id: u32, parameter: Parameter) -> Self {
        Self::new(DeviceKind::Loadpoint, id.to_string(), parameter)
    }

    /// Numeric part of the id; vehicle names like `db:2` use the part after the colon
    pub fn ordinal(&self) -> u16 {
        let tail = self.id.rsplit(':').next().unwrap_or(&self.id);
        tail.parse::<u16>().unwrap_or(1).max(1)
    }

    /// Preferred unit number in hosts that address devices by small integers
    pub fn unit_base(&self) -> u16 {
        let n = self.ordinal() - 1;
        match self.kind {
            DeviceKind::Site => 1,
            DeviceKind::Battery => 20,
            DeviceKind::Pv => 40u16.saturating_add(n),
            DeviceKind::Vehicle => 100u16.saturating_add(n.saturating_mul(20)),
            DeviceKind::Loadpoint => 200u16.saturating_add(n.saturating_mul(20)),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.kind.as_str(),
            self.id,
            self.parameter.as_str()
        )
    }
}

impl FromStr for DeviceKey {
    type Err = String;

    /// Parse a device description back into its key.
    /// Ids may contain `_`; the parameter is the longest known suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || format!("malformed device key '{s}'");
        let (kind, rest) = s.split_once('_').ok_or_else(malformed)?;

        let mut candidates = Parameter::ALL;
        candidates.sort_by_key(|p| std::cmp::Reverse(p.as_str().len()));
        let (id, parameter) = candidates
            .iter()
            .find_map(|p| {
                rest.strip_suffix(p.as_str())
                    .and_then(|head| head.strip_suffix('_'))
                    .filter(|id| !id.is_empty())
                    .map(|id| (id, *p))
            })
            .ok_or_else(malformed)?;

        Ok(Self {
            kind: kind.parse()?,
            id: id.to_owned(),
            parameter,
        })
    }
}

/// Presentation type of a host device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Watts
    Power,
    /// Kilowatt-hours
    Energy,
    Percentage,
    /// Kilometres
    Distance,
    /// Minutes
    Counter,
    /// Named levels at 0, 10, 20, ...
    Selector { levels: Vec<String> },
}

impl DeviceType {
    pub fn unit(&self) -> Option<&'static str> {
        match self {
            Self::Power => Some("W"),
            Self::Energy => Some("kWh"),
            Self::Percentage => Some("%"),
            Self::Distance => Some("km"),
            Self::Counter => Some("min"),
            Self::Selector { .. } => None,
        }
    }

    fn selector<T: Copy>(all: &[T], label: impl Fn(T) -> &'static str) -> Self {
        Self::Selector {
            levels: all.iter().map(|v| label(*v).to_owned()).collect(),
        }
    }
}

/// Everything a registry needs to create a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub key: DeviceKey,
    pub name: String,
    pub device_type: DeviceType,
}

/// Device value as pushed to the host
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeviceValue {
    Power(f64),
    Energy(f64),
    Percentage(f64),
    Distance(f64),
    Counter(u32),
    Selector(u16),
}

impl DeviceValue {
    /// Numeric host value; selectors carry their level here
    pub fn n_value(&self) -> i64 {
        match self {
            Self::Selector(level) => i64::from(*level),
            Self::Power(_)
            | Self::Energy(_)
            | Self::Percentage(_)
            | Self::Distance(_)
            | Self::Counter(_) => 0,
        }
    }

    /// String host value, rendered at the device's display precision
    pub fn s_value(&self) -> String {
        match self {
            Self::Power(w) => format!("{w:.1};0"),
            Self::Energy(kwh) => format!("0;{kwh:.3}"),
            Self::Percentage(v) | Self::Distance(v) => format!("{v:.1}"),
            Self::Counter(n) => n.to_string(),
            Self::Selector(_) => "0".to_owned(),
        }
    }

    /// Plain state for hosts that take a single scalar
    pub fn state(&self) -> String {
        match self {
            Self::Power(v) | Self::Percentage(v) | Self::Distance(v) => format!("{v:.1}"),
            Self::Energy(v) => format!("{v:.3}"),
            Self::Counter(n) => n.to_string(),
            Self::Selector(level) => level.to_string(),
        }
    }

    /// Change detection: exact for integers and selectors, display precision for floats
    pub fn same_reading(&self, other: &DeviceValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
            && self.n_value() == other.n_value()
            && self.s_value() == other.s_value()
    }
}

/// One device slot filled from a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub descriptor: DeviceDescriptor,
    pub value: DeviceValue,
}

impl DeviceReading {
    fn new(key: DeviceKey, title: &str, device_type: DeviceType, value: DeviceValue) -> Self {
        let name = if title.is_empty() {
            key.parameter.display_name().to_owned()
        } else {
            format!("{title} {}", key.parameter.display_name())
        };
        Self {
            descriptor: DeviceDescriptor {
                key,
                name,
                device_type,
            },
            value,
        }
    }
}

/// Flatten a snapshot into device readings. Absent sections produce no readings.
pub fn readings(snapshot: &Snapshot) -> Vec<DeviceReading> {
    let mut out = Vec::new();

    if let Some(site) = &snapshot.site {
        for (parameter, watts) in [
            (Parameter::GridPower, site.grid_power_w),
            (Parameter::HomePower, site.home_power_w),
            (Parameter::PvPower, site.pv_power_w),
        ] {
            out.push(DeviceReading::new(
                DeviceKey::site(parameter),
                "",
                DeviceType::Power,
                DeviceValue::Power(watts),
            ));
        }
    }

    if let Some(battery) = &snapshot.battery {
        out.push(DeviceReading::new(
            DeviceKey::battery(Parameter::Power),
            "Battery",
            DeviceType::Power,
            DeviceValue::Power(battery.power_w),
        ));
        out.push(DeviceReading::new(
            DeviceKey::battery(Parameter::Soc),
            "Battery",
            DeviceType::Percentage,
            DeviceValue::Percentage(battery.soc_percent),
        ));
        out.push(DeviceReading::new(
            DeviceKey::battery(Parameter::Mode),
            "Battery",
            DeviceType::selector(&BatteryMode::ALL, BatteryMode::label),
            DeviceValue::Selector(battery.mode.level()),
        ));
    }

    for pv in &snapshot.pv_systems {
        out.push(DeviceReading::new(
            DeviceKey::new(DeviceKind::Pv, pv.id.to_string(), Parameter::Power),
            &format!("PV {}", pv.id),
            DeviceType::Power,
            DeviceValue::Power(pv.power_w),
        ));
    }

    for vehicle in &snapshot.vehicles {
        let key = |p| DeviceKey::new(DeviceKind::Vehicle, vehicle.id.clone(), p);
        out.push(DeviceReading::new(
            key(Parameter::Soc),
            &vehicle.title,
            DeviceType::Percentage,
            DeviceValue::Percentage(vehicle.soc_percent),
        ));
        out.push(DeviceReading::new(
            key(Parameter::Range),
            &vehicle.title,
            DeviceType::Distance,
            DeviceValue::Distance(vehicle.range_km),
        ));
        out.push(DeviceReading::new(
            key(Parameter::Status),
            &vehicle.title,
            DeviceType::selector(&ChargingStatus::ALL, ChargingStatus::label),
            DeviceValue::Selector(vehicle.status.level()),
        ));
    }

    for lp in &snapshot.loadpoints {
        let key = |p| DeviceKey::loadpoint(lp.id, p);
        let title = lp.title.as_str();
        out.push(DeviceReading::new(
            key(Parameter::ChargingPower),
            title,
            DeviceType::Power,
            DeviceValue::Power(lp.charge_power_w),
        ));
        out.push(DeviceReading::new(
            key(Parameter::ChargedEnergy),
            title,
            DeviceType::Energy,
            DeviceValue::Energy(lp.charged_energy_wh / 1000.0),
        ));
        out.push(DeviceReading::new(
            key(Parameter::Mode),
            title,
            DeviceType::selector(&ChargeMode::ALL, ChargeMode::label),
            DeviceValue::Selector(lp.mode.level()),
        ));
        out.push(DeviceReading::new(
            key(Parameter::Phases),
            title,
            DeviceType::selector(&PhaseSetting::ALL, PhaseSetting::label),
            DeviceValue::Selector(lp.phases.level()),
        ));
        if let Some(min_soc) = lp.min_soc_percent {
            out.push(DeviceReading::new(
                key(Parameter::MinSoc),
                title,
                DeviceType::Percentage,
                DeviceValue::Percentage(min_soc),
            ));
        }
        if let Some(target_soc) = lp.target_soc_percent {
            out.push(DeviceReading::new(
                key(Parameter::TargetSoc),
                title,
                DeviceType::Percentage,
                DeviceValue::Percentage(target_soc),
            ));
        }
        out.push(DeviceReading::new(
            key(Parameter::ChargingTimer),
            title,
            DeviceType::Counter,
            DeviceValue::Counter(lp.charge_timer_minutes),
        ));
    }

    out
}
