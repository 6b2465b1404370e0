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

//! Home Assistant backed device registry.
//!
//! Each device becomes a `sensor.<prefix>_<key>` entity. Home Assistant keeps no device
//! schema for state-API entities, so attributes are re-sent with every value.

use crate::client::HomeAssistantClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use fluxion_evcc::registry::DeviceRegistry;
use fluxion_evcc::{DeviceDescriptor, DeviceKey, DeviceType, DeviceValue};
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use tracing::debug;

pub struct HaDeviceRegistry {
    client: HomeAssistantClient,
    prefix: String,
    descriptors: RwLock<HashMap<DeviceKey, DeviceDescriptor>>,
}

impl std::fmt::Debug for HaDeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaDeviceRegistry")
            .field("client", &self.client)
            .field("prefix", &self.prefix)
            .field("devices", &self.descriptors.read().len())
            .finish()
    }
}

impl HaDeviceRegistry {
    pub fn new(client: HomeAssistantClient, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: sanitize(&prefix.into()),
            descriptors: RwLock::new(HashMap::new()),
        }
    }

    /// Entity id for a device key, e.g. `sensor.evcc_loadpoint_1_charging_power`
    pub fn entity_id(&self, key: &DeviceKey) -> String {
        let object = sanitize(&key.to_string());
        if self.prefix.is_empty() {
            format!("sensor.{object}")
        } else {
            format!("sensor.{}_{}", self.prefix, object)
        }
    }
}

#[async_trait]
impl DeviceRegistry for HaDeviceRegistry {
    async fn create_device(&self, descriptor: &DeviceDescriptor) -> Result<()> {
        let entity_id = self.entity_id(&descriptor.key);
        self.client
            .set_state(&entity_id, "unknown", &attributes(descriptor))
            .await
            .with_context(|| format!("creating {entity_id}"))?;
        self.descriptors
            .write()
            .insert(descriptor.key.clone(), descriptor.clone());
        debug!("🆕 [HA DEVICE] {} ({})", entity_id, descriptor.name);
        Ok(())
    }

    async fn update_value(&self, key: &DeviceKey, value: &DeviceValue) -> Result<()> {
        let descriptor = self
            .descriptors
            .read()
            .get(key)
            .cloned()
            .with_context(|| format!("device {key} was never created"))?;
        let entity_id = self.entity_id(key);
        self.client
            .set_state(
                &entity_id,
                &render_state(&descriptor.device_type, value),
                &attributes(&descriptor),
            )
            .await
            .with_context(|| format!("updating {entity_id}"))?;
        Ok(())
    }

    async fn remove_device(&self, key: &DeviceKey) -> Result<()> {
        let entity_id = self.entity_id(key);
        self.client
            .delete_state(&entity_id)
            .await
            .with_context(|| format!("removing {entity_id}"))?;
        self.descriptors.write().remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "home-assistant"
    }
}

fn attributes(descriptor: &DeviceDescriptor) -> Value {
    let mut attrs = Map::new();
    attrs.insert("friendly_name".to_owned(), json!(descriptor.name));
    if let Some(unit) = descriptor.device_type.unit() {
        attrs.insert("unit_of_measurement".to_owned(), json!(unit));
    }
    let (device_class, state_class) = match &descriptor.device_type {
        DeviceType::Power => (Some("power"), Some("measurement")),
        DeviceType::Energy => (Some("energy"), Some("total_increasing")),
        DeviceType::Distance => (Some("distance"), Some("measurement")),
        DeviceType::Counter => (Some("duration"), Some("measurement")),
        DeviceType::Percentage => (None, Some("measurement")),
        DeviceType::Selector { levels } => {
            attrs.insert("options".to_owned(), json!(levels));
            (Some("enum"), None)
        }
    };
    if let Some(class) = device_class {
        attrs.insert("device_class".to_owned(), json!(class));
    }
    if let Some(class) = state_class {
        attrs.insert("state_class".to_owned(), json!(class));
    }
    Value::Object(attrs)
}

/// Selectors show their label; everything else its plain state
fn render_state(device_type: &DeviceType, value: &DeviceValue) -> String {
    if let (DeviceType::Selector { levels }, DeviceValue::Selector(level)) = (device_type, value)
        && let Some(label) = levels.get(usize::from(*level / 10))
    {
        return label.clone();
    }
    value.state()
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}
