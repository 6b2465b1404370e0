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

//! EVCC bridge core: fetches or streams EVCC state, normalizes it into a snapshot
//! and keeps host devices in sync with it.

pub mod backoff;
pub mod client;
pub mod config;
pub mod devices;
pub mod errors;
pub mod normalizer;
pub mod registry;
pub mod session;
pub mod snapshot;
#[cfg(feature = "websocket")]
pub mod stream;
pub mod sync;
pub mod transport;
pub mod types;

pub use client::EvccClient;
pub use config::{AppConfig, RegistryKind, ValidationResult};
pub use devices::{DeviceDescriptor, DeviceKey, DeviceKind, DeviceType, DeviceValue, Parameter};
pub use errors::{ErrorKind, EvccError, EvccResult};
pub use normalizer::normalize;
pub use registry::{DeviceRegistry, InMemoryDeviceRegistry, TracingDeviceRegistry};
pub use session::Session;
pub use snapshot::Snapshot;
pub use sync::{DeviceSync, VanishedPolicy};
pub use transport::{RefreshSource, TransportMode};
