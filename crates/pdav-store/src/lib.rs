// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Save-file model shared by the pdav daemon and its configuration front-ends.
//!
//! The save file maps an application identity to the volume it last had on
//! every output device, remembers which device was the default during the
//! most recent pass, and carries the user's ignore lists. Everything that
//! reads or writes that file goes through the types in this crate so that
//! identities are computed the same way everywhere.

pub mod file;
pub mod identity;
pub mod quirks;

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use file::{StoreError, VolumeStore};
pub use identity::{fingerprint, IdentityError, IdentityResolver, ResolvedApplication, StreamMetadata};
pub use quirks::{MatchType, QuirkRule, QuirksError, QuirksTable};

/// Stable server-side name of an output device (sink name, not description).
pub type DeviceKey = String;

/// Normalized volume: 1.0 is the server's nominal 100%.
pub type VolumeLevel = f64;

/// Property key for an application's display name.
pub const PROP_APPLICATION_NAME: &str = "application.name";

/// Property key for an application's process binary.
pub const PROP_APPLICATION_BINARY: &str = "application.process.binary";

/// Fingerprint of a (name, binary) pair, rendered as 32 lowercase hex chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationIdentity(String);

impl ApplicationIdentity {
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApplicationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Volumes remembered for one application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationVolumes {
    #[serde(default)]
    pub volumes: BTreeMap<DeviceKey, VolumeLevel>,
}

/// An ignored application, kept with its readable name for the front-end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredApplication {
    #[serde(rename = "application.name", default)]
    pub name: String,
    #[serde(rename = "application.process.binary", default)]
    pub binary: String,
}

/// Devices and applications excluded from capture and apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ignores {
    #[serde(default)]
    pub devices: BTreeSet<DeviceKey>,
    #[serde(default)]
    pub applications: BTreeMap<ApplicationIdentity, IgnoredApplication>,
}

/// The complete persisted document.
///
/// Maps are ordered so that serializing the same store twice yields the same
/// bytes. Top-level fields this crate does not know about are carried through
/// untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Store {
    #[serde(default)]
    pub applications: BTreeMap<ApplicationIdentity, ApplicationVolumes>,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_default_sink: Option<DeviceKey>,
    #[serde(default)]
    pub ignores: Ignores,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Store {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Parse raw file content; bytes that are not UTF-8 are a parse error.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Stored volume for an application on a device, if any.
    pub fn volume_for(&self, identity: &ApplicationIdentity, device: &str) -> Option<VolumeLevel> {
        self.applications
            .get(identity)
            .and_then(|app| app.volumes.get(device))
            .copied()
    }

    /// Record a volume, replacing any earlier value for the same pair.
    pub fn record_volume(&mut self, identity: &ApplicationIdentity, device: &str, level: VolumeLevel) {
        self.applications
            .entry(identity.clone())
            .or_default()
            .volumes
            .insert(device.to_string(), level);
    }

    pub fn is_application_ignored(&self, identity: &ApplicationIdentity) -> bool {
        self.ignores.applications.contains_key(identity)
    }

    pub fn is_device_ignored(&self, device: &str) -> bool {
        self.ignores.devices.contains(device)
    }

    /// Device seen by the last completed pass, `None` when none is known.
    pub fn previous_device(&self) -> Option<&str> {
        self.last_default_sink.as_deref()
    }
}

/// Placeholder the front-end writes before any pass has run.
pub const NO_DEVICE_SENTINEL: &str = "default_sink_input";

/// Treat `null`, `""` and the front-end placeholder as a missing field.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty() && s.as_str() != NO_DEVICE_SENTINEL))
}
