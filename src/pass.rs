// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! One complete reconciliation pass against a live audio server.

use crate::backend::{BackendError, Connector};
use crate::reconcile::{reconcile, PassMode, Verbosity};
use pdav_store::{DeviceKey, IdentityResolver, QuirksError, QuirksTable, StoreError, VolumeStore};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("quirks table: {0}")]
    Quirks(#[from] QuirksError),
}

/// Counts reported after a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub device: DeviceKey,
    pub device_changed: bool,
    pub captured: usize,
    pub skipped: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Runs passes; cheap to share between listeners.
pub struct PassRunner {
    connector: Arc<dyn Connector>,
    store: VolumeStore,
    quirks_path: PathBuf,
}

impl PassRunner {
    pub fn new(connector: Arc<dyn Connector>, store: VolumeStore, quirks_path: PathBuf) -> Self {
        Self {
            connector,
            store,
            quirks_path,
        }
    }

    /// Query the server, reconcile against the store, push commands, persist.
    ///
    /// Every backend query happens before the store is loaded, so an
    /// unavailable server leaves the file untouched.
    pub fn run(&self, mode: PassMode) -> Result<PassSummary, PassError> {
        let mut backend = self.connector.connect()?;

        let current_device = backend.default_device()?;
        if mode.verbosity == Verbosity::Verbose {
            let devices = backend.list_devices()?;
            let name = devices
                .iter()
                .find(|d| d.key == current_device)
                .map(|d| d.display_name())
                .unwrap_or(current_device.as_str());
            info!("Default device: {}", name);
        }
        let streams = backend.list_streams()?;
        debug!("{} streams on the server", streams.len());

        let quirks = QuirksTable::load(&self.quirks_path)?;
        let resolver = IdentityResolver::new(quirks);
        let store = self.store.load_or_recover()?;

        let result = reconcile(&current_device, &streams, store, &resolver, mode);

        let mut applied = 0;
        let mut failed = 0;
        for command in &result.commands {
            match backend.set_stream_volume(command.stream_id, command.level) {
                Ok(()) => applied += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        "Could not restore volume of '{}' (stream {}): {}",
                        command.application, command.stream_id, e
                    );
                    debug!("Identity of the failed stream: {}", command.identity);
                }
            }
        }
        drop(backend);

        self.store.save(&result.store)?;

        Ok(PassSummary {
            device: current_device,
            device_changed: result.device_changed,
            captured: result.captured(),
            skipped: result.skipped(),
            applied,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockServer;
    use crate::backend::{AudioBackend, Device, StreamView};
    use pdav_store::{fingerprint, Store, StreamMetadata};
    use std::fs;
    use tempfile::TempDir;

    fn runner(server: &MockServer, dir: &TempDir) -> PassRunner {
        PassRunner::new(
            Arc::new(server.clone()),
            VolumeStore::new(dir.path().join("save.json")),
            dir.path().join("quirks.toml"),
        )
    }

    fn saved(dir: &TempDir) -> Store {
        VolumeStore::new(dir.path().join("save.json")).load().unwrap()
    }

    #[test]
    fn test_switch_and_back_restores_each_device() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::new("speakers");
        server.add_stream(1, "Firefox", "firefox", 0.8);
        let runner = runner(&server, &dir);

        // Learn 0.8 on speakers.
        runner.run(PassMode::silent()).unwrap();

        // New device, user turns it down to 0.3.
        server.switch_default("headphones");
        let summary = runner.run(PassMode::verbose()).unwrap();
        assert!(summary.device_changed);
        assert_eq!(summary.applied, 0);
        server.state().streams[0].volume = 0.3;
        runner.run(PassMode::silent()).unwrap();

        // Back to speakers restores 0.8, then headphones restores 0.3.
        server.switch_default("speakers");
        let summary = runner.run(PassMode::verbose()).unwrap();
        assert_eq!(summary.applied, 1);
        assert_eq!(server.stream_volume(1), Some(0.8));

        server.switch_default("headphones");
        runner.run(PassMode::verbose()).unwrap();
        assert_eq!(server.stream_volume(1), Some(0.3));

        let store = saved(&dir);
        let firefox = fingerprint("Firefox", "firefox");
        assert_eq!(store.volume_for(&firefox, "speakers"), Some(0.8));
        assert_eq!(store.volume_for(&firefox, "headphones"), Some(0.3));
        assert_eq!(store.previous_device(), Some("headphones"));
    }

    #[test]
    fn test_unavailable_server_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::new("speakers");
        server.state().unavailable = true;

        let err = runner(&server, &dir).run(PassMode::silent()).unwrap_err();

        assert!(matches!(err, PassError::Backend(BackendError::Unavailable(_))));
        assert!(!dir.path().join("save.json").exists());
    }

    #[test]
    fn test_vanished_stream_does_not_stop_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::new("headphones");
        server.add_stream(1, "Firefox", "firefox", 0.8);

        let mut store = Store::default();
        store.record_volume(&fingerprint("Firefox", "firefox"), "headphones", 0.3);
        store.record_volume(&fingerprint("mpv", "mpv"), "headphones", 0.5);
        store.last_default_sink = Some("speakers".to_string());
        VolumeStore::new(dir.path().join("save.json")).save(&store).unwrap();

        // A connector whose backend loses stream 2 between listing and setting.
        struct Vanishing(MockServer);
        impl Connector for Vanishing {
            fn connect(&self) -> Result<Box<dyn AudioBackend>, BackendError> {
                Ok(Box::new(VanishingBackend(self.0.clone())))
            }
        }
        struct VanishingBackend(MockServer);
        impl AudioBackend for VanishingBackend {
            fn list_devices(&mut self) -> Result<Vec<Device>, BackendError> {
                self.0.list_devices()
            }
            fn list_streams(&mut self) -> Result<Vec<StreamView>, BackendError> {
                let mut streams = self.0.list_streams()?;
                let mut ghost = streams[0].clone();
                ghost.id = 2;
                ghost.metadata = StreamMetadata::new("mpv", "mpv");
                streams.push(ghost);
                Ok(streams)
            }
            fn default_device(&mut self) -> Result<DeviceKey, BackendError> {
                self.0.default_device()
            }
            fn set_stream_volume(&mut self, id: u32, level: f64) -> Result<(), BackendError> {
                self.0.set_stream_volume(id, level)
            }
        }

        let runner = PassRunner::new(
            Arc::new(Vanishing(server.clone())),
            VolumeStore::new(dir.path().join("save.json")),
            dir.path().join("quirks.toml"),
        );
        let summary = runner.run(PassMode::silent()).unwrap();

        assert_eq!(summary.applied, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(server.stream_volume(1), Some(0.3));
        assert_eq!(saved(&dir).previous_device(), Some("headphones"));
    }

    #[test]
    fn test_corrupt_store_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("save.json");
        fs::write(&save, "{ not json").unwrap();
        let server = MockServer::new("speakers");
        server.add_stream(1, "Firefox", "firefox", 0.4);

        runner(&server, &dir).run(PassMode::silent()).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("save.json.corrupt")).unwrap(), "{ not json");
        let store = saved(&dir);
        assert_eq!(store.volume_for(&fingerprint("Firefox", "firefox"), "speakers"), Some(0.4));
    }

    #[test]
    fn test_invalid_quirks_abort_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("quirks.toml"),
            "[[quirk]]\nmatch_name = { type = \"Regex\", pattern = \"(\" }\nname = \"x\"\n",
        )
        .unwrap();
        let server = MockServer::new("speakers");
        server.add_stream(1, "Firefox", "firefox", 0.4);

        let err = runner(&server, &dir).run(PassMode::silent()).unwrap_err();

        assert!(matches!(err, PassError::Quirks(_)));
        assert!(!dir.path().join("save.json").exists());
    }

    #[test]
    fn test_capture_only_pass() {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::new("headphones");
        server.add_stream(1, "Firefox", "firefox", 0.8);
        let mut store = Store::default();
        store.record_volume(&fingerprint("Firefox", "firefox"), "headphones", 0.3);
        store.last_default_sink = Some("speakers".to_string());
        VolumeStore::new(dir.path().join("save.json")).save(&store).unwrap();

        let summary = runner(&server, &dir)
            .run(PassMode::verbose().capture_only())
            .unwrap();

        assert_eq!(summary.applied, 0);
        assert!(server.state().volume_writes.is_empty());
        assert_eq!(
            saved(&dir).volume_for(&fingerprint("Firefox", "firefox"), "headphones"),
            Some(0.8)
        );
    }
}
