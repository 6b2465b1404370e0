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

use crate::devices::{DeviceDescriptor, DeviceKey, DeviceValue};
use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Host platform device registry.
/// Sync logic talks to this trait only and never knows which smart-home host sits behind it.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Create a device; creating an existing key is not an error
    async fn create_device(&self, descriptor: &DeviceDescriptor) -> Result<()>;

    /// Push a new value to an existing device
    async fn update_value(&self, key: &DeviceKey, value: &DeviceValue) -> Result<()>;

    /// Remove a device that no longer exists upstream
    async fn remove_device(&self, key: &DeviceKey) -> Result<()>;

    /// Registry name for logging
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredDevice {
    pub descriptor: DeviceDescriptor,
    pub unit: u16,
    pub value: Option<DeviceValue>,
}

/// Every call the in-memory registry has seen, in order
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryCall {
    Create(DeviceKey),
    Update(DeviceKey, DeviceValue),
    Remove(DeviceKey),
}

/// Registry kept entirely in memory.
///
/// Allocates unit numbers from each key's base the way unit-addressed hosts do and
/// records every call, which makes it the registry of choice for tests.
#[derive(Debug, Default)]
pub struct InMemoryDeviceRegistry {
    devices: RwLock<BTreeMap<DeviceKey, RegisteredDevice>>,
    calls: RwLock<Vec<RegistryCall>>,
    failing: RwLock<BTreeSet<DeviceKey>>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call touching `key` fail until [`Self::recover`] is called
    pub fn fail_on(&self, key: DeviceKey) {
        self.failing.write().insert(key);
    }

    pub fn recover(&self, key: &DeviceKey) {
        self.failing.write().remove(key);
    }

    pub fn device(&self, key: &DeviceKey) -> Option<RegisteredDevice> {
        self.devices.read().get(key).cloned()
    }

    pub fn devices(&self) -> Vec<RegisteredDevice> {
        self.devices.read().values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        self.calls.read().clone()
    }

    pub fn update_count(&self) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|c| matches!(c, RegistryCall::Update(..)))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.write().clear();
    }

    fn check_failing(&self, key: &DeviceKey) -> Result<()> {
        if self.failing.read().contains(key) {
            bail!("registry rejected {key}");
        }
        Ok(())
    }

    fn allocate_unit(devices: &BTreeMap<DeviceKey, RegisteredDevice>, base: u16) -> u16 {
        let used: BTreeSet<u16> = devices.values().map(|d| d.unit).collect();
        (base..=u16::MAX)
            .find(|unit| !used.contains(unit))
            .unwrap_or(base)
    }
}

#[async_trait]
impl DeviceRegistry for InMemoryDeviceRegistry {
    async fn create_device(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        self.check_failing(&descriptor.key)?;
        let mut devices = self.devices.write();
        if !devices.contains_key(&descriptor.key) {
            let unit = Self::allocate_unit(&devices, descriptor.key.unit_base());
            devices.insert(
                descriptor.key.clone(),
                RegisteredDevice {
                    descriptor: descriptor.clone(),
                    unit,
                    value: None,
                },
            );
        }
        self.calls
            .write()
            .push(RegistryCall::Create(descriptor.key.clone()));
        Ok(())
    }

    async fn update_value(&self, key: &DeviceKey, value: &DeviceValue) -> Result<()> {
        self.check_failing(key)?;
        let mut devices = self.devices.write();
        let Some(device) = devices.get_mut(key) else {
            bail!("device {key} does not exist");
        };
        device.value = Some(*value);
        self.calls
            .write()
            .push(RegistryCall::Update(key.clone(), *value));
        Ok(())
    }

    async fn remove_device(&self, key: &DeviceKey) -> Result<()> {
        self.check_failing(key)?;
        self.devices.write().remove(key);
        self.calls.write().push(RegistryCall::Remove(key.clone()));
        Ok(())
    }

    fn name(&self) -> &str {
        "in-memory"
    }
}

/// Registry that only logs; used when no host is configured
#[derive(Debug, Default)]
pub struct TracingDeviceRegistry;

#[async_trait]
impl DeviceRegistry for TracingDeviceRegistry {
    async fn create_device(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        info!(
            "➕ [DEVICE] {} ({}) unit base {}",
            descriptor.name,
            descriptor.key,
            descriptor.key.unit_base()
        );
        Ok(())
    }

    async fn update_value(&self, key: &DeviceKey, value: &DeviceValue) -> Result<()> {
        debug!("📝 [DEVICE] {} = {} ({})", key, value.state(), value.s_value());
        Ok(())
    }

    async fn remove_device(&self, key: &DeviceKey) -> Result<()> {
        info!("➖ [DEVICE] Removed {}", key);
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceType, Parameter};

    fn descriptor(key: DeviceKey) -> DeviceDescriptor {
        DeviceDescriptor {
            name: key.to_string(),
            key,
            device_type: DeviceType::Power,
        }
    }

    #[tokio::test]
    async fn test_units_allocated_from_base() {
        let registry = InMemoryDeviceRegistry::new();
        for parameter in [Parameter::GridPower, Parameter::HomePower] {
            registry
                .create_device(&descriptor(DeviceKey::site(parameter)))
                .await
                .unwrap();
        }
        registry
            .create_device(&descriptor(DeviceKey::loadpoint(2, Parameter::ChargingPower)))
            .await
            .unwrap();

        assert_eq!(registry.device(&DeviceKey::site(Parameter::GridPower)).unwrap().unit, 1);
        assert_eq!(registry.device(&DeviceKey::site(Parameter::HomePower)).unwrap().unit, 2);
        assert_eq!(
            registry
                .device(&DeviceKey::loadpoint(2, Parameter::ChargingPower))
                .unwrap()
                .unit,
            220
        );
    }

    #[tokio::test]
    async fn test_update_requires_device() {
        let registry = InMemoryDeviceRegistry::new();
        let key = DeviceKey::battery(Parameter::Power);

        assert!(registry.update_value(&key, &DeviceValue::Power(1.0)).await.is_err());

        registry.create_device(&descriptor(key.clone())).await.unwrap();
        registry.update_value(&key, &DeviceValue::Power(1.0)).await.unwrap();
        assert_eq!(registry.device(&key).unwrap().value, Some(DeviceValue::Power(1.0)));
        assert_eq!(registry.update_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let registry = InMemoryDeviceRegistry::new();
        let key = DeviceKey::battery(Parameter::Soc);
        registry.fail_on(key.clone());

        assert!(registry.create_device(&descriptor(key.clone())).await.is_err());
        registry.recover(&key);
        assert!(registry.create_device(&descriptor(key)).await.is_ok());
    }
}
