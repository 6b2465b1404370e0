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

//! Diff-based device synchronization.
//!
//! [`DeviceSync`] remembers what the registry last accepted per device key and only
//! emits calls for devices that are new or whose rendered value changed. A call that
//! fails is not remembered, so the next pass retries it.

use crate::devices::{DeviceDescriptor, DeviceKey, DeviceValue, readings};
use crate::registry::DeviceRegistry;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// What happens to devices whose entity disappears from EVCC
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VanishedPolicy {
    /// Keep the device at its last value
    #[default]
    Retain,
    /// Remove devices of vanished vehicles, loadpoints and PV systems
    Remove,
}

/// Registry calls needed to bring the host in line with one snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub creates: Vec<DeviceDescriptor>,
    pub updates: Vec<(DeviceKey, DeviceValue)>,
    pub removals: Vec<DeviceKey>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.removals.is_empty()
    }
}

/// Outcome of applying a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct DeviceSync {
    policy: VanishedPolicy,
    /// Devices the registry confirmed as created
    known: BTreeSet<DeviceKey>,
    /// Last value the registry accepted per device
    reported: BTreeMap<DeviceKey, DeviceValue>,
}

impl DeviceSync {
    pub fn new(policy: VanishedPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn reported(&self, key: &DeviceKey) -> Option<&DeviceValue> {
        self.reported.get(key)
    }

    pub fn known_devices(&self) -> usize {
        self.known.len()
    }

    /// Compute the calls for `snapshot` without touching the registry
    pub fn plan(&self, snapshot: &Snapshot) -> SyncPlan {
        let mut plan = SyncPlan::default();
        let mut present = BTreeSet::new();

        for reading in readings(snapshot) {
            let key = reading.descriptor.key.clone();
            present.insert(key.clone());

            if !self.known.contains(&key) {
                plan.creates.push(reading.descriptor);
                plan.updates.push((key, reading.value));
                continue;
            }

            let changed = self
                .reported
                .get(&key)
                .is_none_or(|last| !last.same_reading(&reading.value));
            if changed {
                plan.updates.push((key, reading.value));
            }
        }

        if self.policy == VanishedPolicy::Remove {
            plan.removals = self
                .known
                .iter()
                .filter(|key| key.kind.is_dynamic() && !present.contains(*key))
                .cloned()
                .collect();
        }

        plan
    }

    /// Execute a plan against the registry, recording only what succeeded
    pub async fn apply(&mut self, plan: SyncPlan, registry: &dyn DeviceRegistry) -> SyncReport {
        let mut report = SyncReport::default();
        let mut failed_creates = BTreeSet::new();

        for descriptor in &plan.creates {
            match registry.create_device(descriptor).await {
                Ok(()) => {
                    info!("➕ [SYNC] Created device: {} ({})", descriptor.name, descriptor.key);
                    self.known.insert(descriptor.key.clone());
                    report.created += 1;
                }
                Err(e) => {
                    warn!("⚠️ [SYNC] Failed to create {}: {:#}", descriptor.key, e);
                    failed_creates.insert(descriptor.key.clone());
                    report.failed += 1;
                }
            }
        }

        for (key, value) in plan.updates {
            if failed_creates.contains(&key) {
                continue;
            }
            match registry.update_value(&key, &value).await {
                Ok(()) => {
                    debug!("📝 [SYNC] {} = {}", key, value.s_value());
                    self.reported.insert(key, value);
                    report.updated += 1;
                }
                Err(e) => {
                    warn!("⚠️ [SYNC] Failed to update {}: {:#}", key, e);
                    report.failed += 1;
                }
            }
        }

        for key in plan.removals {
            match registry.remove_device(&key).await {
                Ok(()) => {
                    info!("➖ [SYNC] Removed vanished device: {}", key);
                    self.known.remove(&key);
                    self.reported.remove(&key);
                    report.removed += 1;
                }
                Err(e) => {
                    warn!("⚠️ [SYNC] Failed to remove {}: {:#}", key, e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Plan and apply in one step
    pub async fn sync(&mut self, snapshot: &Snapshot, registry: &dyn DeviceRegistry) -> SyncReport {
        let plan = self.plan(snapshot);
        if plan.is_empty() {
            debug!("[SYNC] No device changes");
            return SyncReport::default();
        }
        self.apply(plan, registry).await
    }

    /// Push a value that did not come from a snapshot, such as an accepted command
    pub async fn push_value(
        &mut self,
        key: &DeviceKey,
        value: DeviceValue,
        registry: &dyn DeviceRegistry,
    ) -> anyhow::Result<()> {
        registry.update_value(key, &value).await?;
        self.reported.insert(key.clone(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceKind, Parameter};
    use crate::normalizer::normalize;
    use crate::registry::{InMemoryDeviceRegistry, RegistryCall};
    use serde_json::json;

    fn snapshot(value: serde_json::Value) -> Snapshot {
        normalize(&value).unwrap()
    }

    #[tokio::test]
    async fn test_first_pass_creates_and_initializes() {
        let registry = InMemoryDeviceRegistry::new();
        let mut sync = DeviceSync::default();

        let report = sync
            .sync(&snapshot(json!({"site": {"grid": 0, "home": 0, "pv": 0}})), &registry)
            .await;

        assert_eq!(report.created, 3);
        assert_eq!(report.updated, 3);
        assert_eq!(
            registry.device(&DeviceKey::site(Parameter::GridPower)).unwrap().value,
            Some(DeviceValue::Power(0.0))
        );
    }

    #[tokio::test]
    async fn test_unchanged_payload_produces_no_calls() {
        let registry = InMemoryDeviceRegistry::new();
        let mut sync = DeviceSync::default();
        let payload = json!({"loadpoints": [{"title": "Garage", "chargePower": 7400, "mode": "pv"}]});

        sync.sync(&snapshot(payload.clone()), &registry).await;
        registry.clear_calls();

        let plan = sync.plan(&snapshot(payload));
        assert!(plan.is_empty());
        assert!(registry.calls().is_empty());
    }

    #[tokio::test]
    async fn test_only_changed_values_are_sent() {
        let registry = InMemoryDeviceRegistry::new();
        let mut sync = DeviceSync::default();

        sync.sync(&snapshot(json!({"site": {"grid": 100, "home": 500, "pv": 0}})), &registry)
            .await;
        registry.clear_calls();
        let report = sync
            .sync(&snapshot(json!({"site": {"grid": 100.01, "home": 650, "pv": 0}})), &registry)
            .await;

        assert_eq!(report.updated, 1);
        assert_eq!(
            registry.calls(),
            vec![RegistryCall::Update(
                DeviceKey::site(Parameter::HomePower),
                DeviceValue::Power(650.0)
            )]
        );
    }

    #[tokio::test]
    async fn test_failed_update_is_retried() {
        let registry = InMemoryDeviceRegistry::new();
        let mut sync = DeviceSync::default();
        let payload = json!({"site": {"grid": 1, "home": 2, "pv": 3}});
        let key = DeviceKey::site(Parameter::PvPower);

        sync.sync(&snapshot(payload.clone()), &registry).await;
        registry.fail_on(key.clone());
        let report = sync
            .sync(&snapshot(json!({"site": {"grid": 1, "home": 2, "pv": 4}})), &registry)
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(sync.reported(&key), Some(&DeviceValue::Power(3.0)));

        registry.recover(&key);
        let report = sync
            .sync(&snapshot(json!({"site": {"grid": 1, "home": 2, "pv": 4}})), &registry)
            .await;
        assert_eq!(report.updated, 1);
        assert_eq!(sync.reported(&key), Some(&DeviceValue::Power(4.0)));
    }

    #[tokio::test]
    async fn test_failed_create_is_retried() {
        let registry = InMemoryDeviceRegistry::new();
        let mut sync = DeviceSync::default();
        let key = DeviceKey::battery(Parameter::Soc);
        let payload = json!({"battery": {"power": 0, "soc": 50}});

        registry.fail_on(key.clone());
        sync.sync(&snapshot(payload.clone()), &registry).await;
        assert!(registry.device(&key).is_none());

        registry.recover(&key);
        let plan = sync.plan(&snapshot(payload));
        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.creates[0].key, key);
    }

    #[tokio::test]
    async fn test_vanished_devices_retained_by_default() {
        let registry = InMemoryDeviceRegistry::new();
        let mut sync = DeviceSync::default();

        sync.sync(&snapshot(json!({"loadpoints": [{}, {}]})), &registry).await;
        let plan = sync.plan(&snapshot(json!({"loadpoints": [{}]})));

        assert!(plan.removals.is_empty());
        assert!(registry.device(&DeviceKey::loadpoint(2, Parameter::Mode)).is_some());
    }

    #[tokio::test]
    async fn test_vanished_devices_removed_when_configured() {
        let registry = InMemoryDeviceRegistry::new();
        let mut sync = DeviceSync::new(VanishedPolicy::Remove);

        sync.sync(
            &snapshot(json!({"site": {"grid": 1}, "loadpoints": [{}, {}]})),
            &registry,
        )
        .await;
        let report = sync.sync(&snapshot(json!({"loadpoints": [{}]})), &registry).await;

        assert_eq!(report.removed, 5);
        assert!(registry.device(&DeviceKey::loadpoint(2, Parameter::Mode)).is_none());
        // Site devices are never removed
        assert!(registry.device(&DeviceKey::site(Parameter::GridPower)).is_some());
        assert!(
            registry
                .devices()
                .iter()
                .all(|d| d.descriptor.key.kind != DeviceKind::Loadpoint || d.descriptor.key.id == "1")
        );
    }
}
