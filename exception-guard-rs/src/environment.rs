//! # Environment Snapshot
//!
//! Identification of the runtime the guard runs in, computed once per
//! process and shared by every log record. Only the network class changes
//! after initialization, updated in place when connectivity changes.

use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize, Serializer};

static CURRENT: Lazy<Arc<EnvironmentSnapshot>> =
    Lazy::new(|| Arc::new(EnvironmentSnapshot::detect()));

/// Connectivity class reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    #[default]
    Unknown,
    Offline,
    Slow2g,
    Cellular2g,
    Cellular3g,
    Cellular4g,
    Wifi,
    Ethernet,
}

impl NetworkClass {
    /// Parses the effective-type strings hosts usually report
    pub fn from_effective_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "offline" | "none" => NetworkClass::Offline,
            "slow-2g" => NetworkClass::Slow2g,
            "2g" => NetworkClass::Cellular2g,
            "3g" => NetworkClass::Cellular3g,
            "4g" | "5g" => NetworkClass::Cellular4g,
            "wifi" => NetworkClass::Wifi,
            "ethernet" => NetworkClass::Ethernet,
            _ => NetworkClass::Unknown,
        }
    }
}

/// Runtime and platform identification
#[derive(Debug, Serialize)]
pub struct EnvironmentSnapshot {
    /// Runtime name
    pub runtime: String,
    /// Version of this crate
    pub version: String,
    /// Operating system
    pub os: String,
    /// Operating system family
    pub family: String,
    /// CPU architecture
    pub arch: String,
    /// Locale identification, if the environment exposes one
    pub locale: Option<String>,
    /// Terminal or host identification, if the environment exposes one
    pub host: Option<String>,
    #[serde(serialize_with = "serialize_network")]
    network: RwLock<NetworkClass>,
}

fn serialize_network<S: Serializer>(
    network: &RwLock<NetworkClass>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let class = *network.read().unwrap_or_else(PoisonError::into_inner);
    class.serialize(serializer)
}

impl EnvironmentSnapshot {
    /// The process-wide snapshot, computed on first use
    pub fn current() -> Arc<EnvironmentSnapshot> {
        Arc::clone(&CURRENT)
    }

    /// Reads identification from the ambient environment
    pub fn detect() -> Self {
        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .ok()
            .filter(|value| !value.is_empty());
        let host = std::env::var("TERM_PROGRAM")
            .or_else(|_| std::env::var("TERM"))
            .ok()
            .filter(|value| !value.is_empty());

        Self {
            runtime: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            locale,
            host,
            network: RwLock::new(NetworkClass::Unknown),
        }
    }

    /// Builds a snapshot with fixed identification, for hosts that supply
    /// their own
    pub fn with_identity<S: Into<String>>(runtime: S, os: S, arch: S) -> Self {
        Self {
            runtime: runtime.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: os.into(),
            family: std::env::consts::FAMILY.to_string(),
            arch: arch.into(),
            locale: None,
            host: None,
            network: RwLock::new(NetworkClass::Unknown),
        }
    }

    /// Current network class
    pub fn network_class(&self) -> NetworkClass {
        *self.network.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the network class in place
    pub fn set_network_class(&self, class: NetworkClass) {
        let mut network = self.network.write().unwrap_or_else(PoisonError::into_inner);
        if *network != class {
            tracing::debug!(from = ?*network, to = ?class, "Network class changed");
            *network = class;
        }
    }
}
