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

//! Canonical EVCC state snapshot.
//!
//! A snapshot is produced fresh from every refresh (poll tick or stream message)
//! and replaced wholesale; it is never patched field by field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized EVCC state from one refresh cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub received_at: DateTime<Utc>,
    /// `None` when the payload carried no site section
    pub site: Option<SiteSnapshot>,
    /// `None` when the EVCC instance reports no battery
    pub battery: Option<BatteryState>,
    pub pv_systems: Vec<PvSystem>,
    pub vehicles: Vec<Vehicle>,
    pub loadpoints: Vec<Loadpoint>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            received_at: Utc::now(),
            site: None,
            battery: None,
            pv_systems: Vec::new(),
            vehicles: Vec::new(),
            loadpoints: Vec::new(),
        }
    }

    pub fn loadpoint(&self, id: u32) -> Option<&Loadpoint> {
        self.loadpoints.iter().find(|lp| lp.id == id)
    }

    pub fn vehicle(&self, id: &str) -> Option<&Vehicle> {
        self.vehicles.iter().find(|v| v.id == id)
    }
}

/// Site-level power flows in watts. Grid power is negative while exporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteSnapshot {
    pub grid_power_w: f64,
    pub home_power_w: f64,
    pub pv_power_w: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Positive while discharging, negative while charging
    pub power_w: f64,
    pub soc_percent: f64,
    pub mode: BatteryMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PvSystem {
    /// 1-based position in the `pv` array
    pub id: u32,
    pub power_w: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    /// Position (`"1"`, `"2"`, ...) or EVCC vehicle name (`"db:2"`)
    pub id: String,
    pub title: String,
    pub soc_percent: f64,
    pub range_km: f64,
    pub status: ChargingStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Loadpoint {
    /// 1-based position in the `loadpoints` array, also the id EVCC's API uses
    pub id: u32,
    pub title: String,
    pub charge_power_w: f64,
    /// Energy charged in the current session; resets when a session starts
    pub charged_energy_wh: f64,
    pub mode: ChargeMode,
    pub phases: PhaseSetting,
    pub min_soc_percent: Option<f64>,
    pub target_soc_percent: Option<f64>,
    pub charging: bool,
    /// Elapsed charging time, zero whenever the loadpoint is not charging
    pub charge_timer_minutes: u32,
}

/// Levels on selector devices advance in steps of ten
pub const SELECTOR_STEP: u16 = 10;

/// Battery operating mode as reported by EVCC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryMode {
    #[default]
    Unknown,
    Normal,
    Hold,
    Charge,
    External,
}

impl BatteryMode {
    pub const ALL: [BatteryMode; 5] = [
        Self::Unknown,
        Self::Normal,
        Self::Hold,
        Self::Charge,
        Self::External,
    ];

    /// Lenient parse; anything unrecognized is `Unknown`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Self::Normal,
            "hold" => Self::Hold,
            "charge" => Self::Charge,
            "external" => Self::External,
            _ => Self::Unknown,
        }
    }

    pub fn api_value(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Normal => "normal",
            Self::Hold => "hold",
            Self::Charge => "charge",
            Self::External => "external",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Normal => "Normal",
            Self::Hold => "Hold",
            Self::Charge => "Charge",
            Self::External => "External",
        }
    }

    pub fn level(self) -> u16 {
        level_of(&Self::ALL, self)
    }

    pub fn from_level(level: u16) -> Option<Self> {
        from_level(&Self::ALL, level)
    }
}

/// Vehicle charging status.
///
/// EVCC reports IEC-style status letters; `A` connected, `B` charging, `C` complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargingStatus {
    #[default]
    Disconnected,
    Connected,
    Charging,
    Complete,
}

impl ChargingStatus {
    pub const ALL: [ChargingStatus; 4] = [
        Self::Disconnected,
        Self::Connected,
        Self::Charging,
        Self::Complete,
    ];

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "a" | "connected" => Self::Connected,
            "b" | "charging" => Self::Charging,
            "c" | "complete" => Self::Complete,
            _ => Self::Disconnected,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connected => "Connected",
            Self::Charging => "Charging",
            Self::Complete => "Complete",
        }
    }

    pub fn level(self) -> u16 {
        level_of(&Self::ALL, self)
    }
}

/// Loadpoint charging mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeMode {
    #[default]
    Off,
    Now,
    MinPv,
    Pv,
}

impl ChargeMode {
    pub const ALL: [ChargeMode; 4] = [Self::Off, Self::Now, Self::MinPv, Self::Pv];

    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "now" => Self::Now,
            "minpv" | "min+pv" => Self::MinPv,
            "pv" => Self::Pv,
            _ => Self::Off,
        }
    }

    pub fn api_value(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Now => "now",
            Self::MinPv => "minpv",
            Self::Pv => "pv",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Now => "Now",
            Self::MinPv => "Min+PV",
            Self::Pv => "PV",
        }
    }

    pub fn level(self) -> u16 {
        level_of(&Self::ALL, self)
    }

    pub fn from_level(level: u16) -> Option<Self> {
        from_level(&Self::ALL, level)
    }
}

impl fmt::Display for ChargeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_value())
    }
}

/// Configured phase count of a loadpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseSetting {
    #[default]
    Auto,
    Single,
    Three,
}

impl PhaseSetting {
    pub const ALL: [PhaseSetting; 3] = [Self::Auto, Self::Single, Self::Three];

    pub fn from_count(count: i64) -> Self {
        match count {
            1 => Self::Single,
            3 => Self::Three,
            _ => Self::Auto,
        }
    }

    /// Value EVCC expects on `/phases/{n}`, 0 meaning automatic switching
    pub fn count(self) -> u8 {
        match self {
            Self::Auto => 0,
            Self::Single => 1,
            Self::Three => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Auto => "Auto",
            Self::Single => "1-Phase",
            Self::Three => "3-Phase",
        }
    }

    pub fn level(self) -> u16 {
        level_of(&Self::ALL, self)
    }

    pub fn from_level(level: u16) -> Option<Self> {
        from_level(&Self::ALL, level)
    }
}

fn level_of<T: PartialEq>(all: &[T], value: T) -> u16 {
    let index = all.iter().position(|v| *v == value).unwrap_or(0);
    u16::try_from(index).unwrap_or(0) * SELECTOR_STEP
}

fn from_level<T: Copy>(all: &[T], level: u16) -> Option<T> {
    if level % SELECTOR_STEP != 0 {
        return None;
    }
    all.get(usize::from(level / SELECTOR_STEP)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_mode_levels_round_trip() {
        for mode in ChargeMode::ALL {
            assert_eq!(ChargeMode::from_level(mode.level()), Some(mode));
        }
        assert_eq!(ChargeMode::Pv.level(), 30);
        assert_eq!(ChargeMode::from_level(15), None);
        assert_eq!(ChargeMode::from_level(40), None);
    }

    #[test]
    fn test_lenient_parsing() {
        assert_eq!(ChargeMode::parse("MinPV"), ChargeMode::MinPv);
        assert_eq!(ChargeMode::parse("bogus"), ChargeMode::Off);
        assert_eq!(BatteryMode::parse(" hold "), BatteryMode::Hold);
        assert_eq!(BatteryMode::parse(""), BatteryMode::Unknown);
        assert_eq!(ChargingStatus::parse("B"), ChargingStatus::Charging);
        assert_eq!(ChargingStatus::parse("x"), ChargingStatus::Disconnected);
    }

    #[test]
    fn test_phase_setting() {
        assert_eq!(PhaseSetting::from_count(3), PhaseSetting::Three);
        assert_eq!(PhaseSetting::from_count(2), PhaseSetting::Auto);
        assert_eq!(PhaseSetting::Three.level(), 20);
        assert_eq!(PhaseSetting::from_level(10), Some(PhaseSetting::Single));
        assert_eq!(PhaseSetting::Single.count(), 1);
    }

    #[test]
    fn test_battery_mode_levels() {
        assert_eq!(BatteryMode::External.level(), 40);
        assert_eq!(BatteryMode::from_level(20), Some(BatteryMode::Hold));
    }
}
