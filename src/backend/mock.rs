// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory audio server for tests.

use super::{AudioBackend, BackendError, Connector, Device, StreamView};
use pdav_store::{DeviceKey, StreamMetadata, VolumeLevel};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct MockState {
    pub devices: Vec<Device>,
    pub default_device: DeviceKey,
    pub streams: Vec<StreamView>,
    /// Every successful `set_stream_volume`, in order.
    pub volume_writes: Vec<(u32, VolumeLevel)>,
    /// Number of connections opened so far.
    pub connections: usize,
    /// Refuse connections while set.
    pub unavailable: bool,
}

/// Shared handle; clones see the same server.
#[derive(Debug, Clone, Default)]
pub struct MockServer {
    state: Arc<Mutex<MockState>>,
}

impl MockServer {
    pub fn new(default_device: &str) -> Self {
        let server = Self::default();
        {
            let mut state = server.state();
            state.default_device = default_device.to_string();
            state.devices.push(Device {
                key: default_device.to_string(),
                description: String::new(),
            });
        }
        server
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_stream(&self, id: u32, name: &str, binary: &str, volume: VolumeLevel) {
        let mut state = self.state();
        let device = Some(state.default_device.clone());
        state.streams.push(StreamView {
            id,
            metadata: StreamMetadata::new(name, binary),
            volume,
            device,
        });
    }

    pub fn switch_default(&self, device: &str) {
        let mut state = self.state();
        state.default_device = device.to_string();
        for stream in &mut state.streams {
            stream.device = Some(device.to_string());
        }
    }

    pub fn stream_volume(&self, id: u32) -> Option<VolumeLevel> {
        self.state().streams.iter().find(|s| s.id == id).map(|s| s.volume)
    }
}

impl Connector for MockServer {
    fn connect(&self) -> Result<Box<dyn AudioBackend>, BackendError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(BackendError::Unavailable("mock server is down".into()));
        }
        state.connections += 1;
        Ok(Box::new(self.clone()))
    }
}

impl AudioBackend for MockServer {
    fn list_devices(&mut self) -> Result<Vec<Device>, BackendError> {
        Ok(self.state().devices.clone())
    }

    fn list_streams(&mut self) -> Result<Vec<StreamView>, BackendError> {
        Ok(self.state().streams.clone())
    }

    fn default_device(&mut self) -> Result<DeviceKey, BackendError> {
        Ok(self.state().default_device.clone())
    }

    fn set_stream_volume(&mut self, stream_id: u32, level: VolumeLevel) -> Result<(), BackendError> {
        let mut state = self.state();
        let stream = state
            .streams
            .iter_mut()
            .find(|s| s.id == stream_id)
            .ok_or_else(|| BackendError::OperationFailed(format!("no stream {}", stream_id)))?;
        stream.volume = level;
        state.volume_writes.push((stream_id, level));
        Ok(())
    }
}
