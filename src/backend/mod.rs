// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio server access.
//!
//! The reconciliation code only sees [`AudioBackend`]; a pass asks a
//! [`Connector`] for a fresh connection and drops it when the pass ends.
//! Change notifications arrive separately as [`BackendEvent`]s from a
//! long-lived subscription.

#[cfg(test)]
pub mod mock;
pub mod pulse;
pub mod subscription;

use pdav_store::{DeviceKey, StreamMetadata, VolumeLevel};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("audio server unavailable: {0}")]
    Unavailable(String),
    #[error("audio server operation failed: {0}")]
    OperationFailed(String),
}

/// An output device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub key: DeviceKey,
    pub description: String,
}

impl Device {
    pub fn display_name(&self) -> &str {
        if !self.description.is_empty() {
            &self.description
        } else {
            &self.key
        }
    }
}

/// A live playback stream as seen at the start of a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamView {
    /// Server-side stream index, only valid for this connection's lifetime.
    pub id: u32,
    pub metadata: StreamMetadata,
    /// Average over all channels.
    pub volume: VolumeLevel,
    /// Device the stream currently plays on, if known.
    pub device: Option<DeviceKey>,
}

/// Operations a reconciliation pass needs from the audio server.
pub trait AudioBackend {
    fn list_devices(&mut self) -> Result<Vec<Device>, BackendError>;

    fn list_streams(&mut self) -> Result<Vec<StreamView>, BackendError>;

    fn default_device(&mut self) -> Result<DeviceKey, BackendError>;

    /// Set every channel of a stream to `level`.
    fn set_stream_volume(&mut self, stream_id: u32, level: VolumeLevel) -> Result<(), BackendError>;
}

/// Opens short-lived backend connections, one per pass.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn AudioBackend>, BackendError>;
}

/// Notification categories a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// Default output device switched, or a device appeared/disappeared.
    DeviceSet,
    /// A stream appeared, disappeared, or changed (volume included).
    StreamSet,
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventClass::DeviceSet => write!(f, "device"),
            EventClass::StreamSet => write!(f, "stream"),
        }
    }
}

/// What happened to the object a notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Changed,
    Removed,
}

/// A change notification from the audio server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendEvent {
    pub class: EventClass,
    pub kind: ChangeKind,
    pub index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display_name_falls_back_to_key() {
        let named = Device {
            key: "alsa_output.usb".to_string(),
            description: "USB Headset".to_string(),
        };
        assert_eq!(named.display_name(), "USB Headset");

        let bare = Device {
            key: "alsa_output.pci".to_string(),
            description: String::new(),
        };
        assert_eq!(bare.display_name(), "alsa_output.pci");
    }
}
