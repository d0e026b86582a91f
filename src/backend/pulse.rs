// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! PulseAudio backend (also serves PipeWire through its PA compatibility layer).
//!
//! Each [`PulseBackend`] owns a standard mainloop and a context. Introspection
//! calls are asynchronous in libpulse; every method here starts the operation
//! and iterates the mainloop until it completes, which keeps the pass code
//! straight-line.

use super::{AudioBackend, BackendError, Connector, Device, StreamView};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::introspect::{ServerInfo, SinkInfo, SinkInputInfo};
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::operation::{Operation, State as OperationState};
use libpulse_binding::proplist::properties::{APPLICATION_NAME, APPLICATION_PROCESS_BINARY};
use libpulse_binding::volume::{ChannelVolumes, Volume};
use pdav_store::{DeviceKey, StreamMetadata, VolumeLevel};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};

/// Channel count used when a stream's layout is unknown.
const FALLBACK_CHANNELS: u8 = 2;

/// Create a mainloop and a context, and wait until the context is ready.
pub(crate) fn open_context(client_name: &str) -> Result<(Mainloop, Context), BackendError> {
    let mut mainloop = Mainloop::new()
        .ok_or_else(|| BackendError::Unavailable("failed to create PA mainloop".into()))?;

    let mut context = Context::new(&mainloop, client_name)
        .ok_or_else(|| BackendError::Unavailable("failed to create PA context".into()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| BackendError::Unavailable(format!("failed to connect PA context: {}", e)))?;

    loop {
        iterate(&mut mainloop, true)?;
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(BackendError::Unavailable(format!(
                    "PA context for '{}' failed to connect",
                    client_name
                )));
            }
            _ => continue,
        }
    }

    debug!("PA context '{}' ready", client_name);
    Ok((mainloop, context))
}

/// Run one mainloop iteration; returns the number of dispatched sources.
pub(crate) fn iterate(mainloop: &mut Mainloop, block: bool) -> Result<u32, BackendError> {
    match mainloop.iterate(block) {
        IterateResult::Quit(_) => Err(BackendError::Unavailable("PA mainloop quit".into())),
        IterateResult::Err(e) => Err(BackendError::Unavailable(format!(
            "PA mainloop iteration failed: {}",
            e
        ))),
        IterateResult::Success(dispatched) => Ok(dispatched),
    }
}

pub(crate) fn check_context(context: &Context) -> Result<(), BackendError> {
    match context.get_state() {
        ContextState::Failed | ContextState::Terminated => Err(BackendError::Unavailable(
            "connection to the audio server was lost".into(),
        )),
        _ => Ok(()),
    }
}

/// Average of all channels, normalized so 1.0 is 100%.
pub fn level_from_volumes(volumes: &ChannelVolumes) -> VolumeLevel {
    volumes.avg().0 as f64 / Volume::NORMAL.0 as f64
}

/// The same level on `channels` channels.
pub fn volumes_from_level(level: VolumeLevel, channels: u8) -> ChannelVolumes {
    let raw = (level.max(0.0) * Volume::NORMAL.0 as f64).round();
    let raw = raw.min(Volume::MAX.0 as f64) as u32;
    let mut volumes = ChannelVolumes::default();
    volumes.set(channels.max(1), Volume(raw));
    volumes
}

/// Opens a [`PulseBackend`] per pass.
#[derive(Debug, Clone)]
pub struct PulseConnector {
    client_name: String,
}

impl PulseConnector {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
        }
    }
}

impl Connector for PulseConnector {
    fn connect(&self) -> Result<Box<dyn AudioBackend>, BackendError> {
        Ok(Box::new(PulseBackend::connect(&self.client_name)?))
    }
}

/// A connected PulseAudio client.
pub struct PulseBackend {
    mainloop: Mainloop,
    context: Context,
    /// Channel count per stream index, from the latest stream listing.
    stream_channels: HashMap<u32, u8>,
}

impl PulseBackend {
    pub fn connect(client_name: &str) -> Result<Self, BackendError> {
        let (mainloop, context) = open_context(client_name)?;
        Ok(Self {
            mainloop,
            context,
            stream_channels: HashMap::new(),
        })
    }

    /// Iterate the mainloop until `op` finishes.
    fn wait<T: ?Sized>(&mut self, op: &Operation<T>) -> Result<(), BackendError> {
        loop {
            match op.get_state() {
                OperationState::Done => return Ok(()),
                OperationState::Cancelled => {
                    return Err(BackendError::OperationFailed("operation was cancelled".into()));
                }
                OperationState::Running => {}
            }
            iterate(&mut self.mainloop, true)?;
            check_context(&self.context)?;
        }
    }

    /// All sinks with their server index.
    fn sinks(&mut self) -> Result<Vec<(u32, Device)>, BackendError> {
        let sinks = Rc::new(RefCell::new(Vec::new()));
        let failed = Rc::new(Cell::new(false));

        let op = {
            let sinks = Rc::clone(&sinks);
            let failed = Rc::clone(&failed);
            self.context
                .introspect()
                .get_sink_info_list(move |result: ListResult<&SinkInfo>| match result {
                    ListResult::Item(info) => {
                        let Some(name) = info.name.as_ref() else {
                            return;
                        };
                        sinks.borrow_mut().push((
                            info.index,
                            Device {
                                key: name.to_string(),
                                description: info
                                    .description
                                    .as_ref()
                                    .map(|d| d.to_string())
                                    .unwrap_or_default(),
                            },
                        ));
                    }
                    ListResult::End => {}
                    ListResult::Error => failed.set(true),
                })
        };
        self.wait(&op)?;

        if failed.get() {
            return Err(BackendError::OperationFailed("failed to list sinks".into()));
        }
        let sinks = std::mem::take(&mut *sinks.borrow_mut());
        Ok(sinks)
    }
}

impl AudioBackend for PulseBackend {
    fn list_devices(&mut self) -> Result<Vec<Device>, BackendError> {
        Ok(self.sinks()?.into_iter().map(|(_, device)| device).collect())
    }

    fn list_streams(&mut self) -> Result<Vec<StreamView>, BackendError> {
        let sink_names: HashMap<u32, DeviceKey> = self
            .sinks()?
            .into_iter()
            .map(|(index, device)| (index, device.key))
            .collect();

        let raw = Rc::new(RefCell::new(Vec::new()));
        let failed = Rc::new(Cell::new(false));

        let op = {
            let raw = Rc::clone(&raw);
            let failed = Rc::clone(&failed);
            self.context
                .introspect()
                .get_sink_input_info_list(move |result: ListResult<&SinkInputInfo>| match result {
                    ListResult::Item(info) => {
                        if !info.has_volume {
                            return;
                        }
                        let metadata = StreamMetadata {
                            name: info.proplist.get_str(APPLICATION_NAME),
                            binary: info.proplist.get_str(APPLICATION_PROCESS_BINARY),
                        };
                        raw.borrow_mut().push((
                            info.index,
                            info.sink,
                            info.volume.len(),
                            level_from_volumes(&info.volume),
                            metadata,
                        ));
                    }
                    ListResult::End => {}
                    ListResult::Error => failed.set(true),
                })
        };
        self.wait(&op)?;

        if failed.get() {
            return Err(BackendError::OperationFailed("failed to list streams".into()));
        }

        self.stream_channels.clear();
        let raw = std::mem::take(&mut *raw.borrow_mut());
        let streams = raw
            .into_iter()
            .map(|(id, sink, channels, volume, metadata)| {
                self.stream_channels.insert(id, channels);
                StreamView {
                    id,
                    metadata,
                    volume,
                    device: sink_names.get(&sink).cloned(),
                }
            })
            .collect::<Vec<_>>();

        trace!("Listed {} streams", streams.len());
        Ok(streams)
    }

    fn default_device(&mut self) -> Result<DeviceKey, BackendError> {
        let name = Rc::new(RefCell::new(None));

        let op = {
            let name = Rc::clone(&name);
            self.context.introspect().get_server_info(move |info: &ServerInfo| {
                *name.borrow_mut() = info.default_sink_name.as_ref().map(|n| n.to_string());
            })
        };
        self.wait(&op)?;

        let name = name.borrow_mut().take();
        name.ok_or_else(|| BackendError::OperationFailed("server reports no default sink".into()))
    }

    fn set_stream_volume(&mut self, stream_id: u32, level: VolumeLevel) -> Result<(), BackendError> {
        let channels = self
            .stream_channels
            .get(&stream_id)
            .copied()
            .unwrap_or(FALLBACK_CHANNELS);
        let volumes = volumes_from_level(level, channels);
        let success = Rc::new(Cell::new(false));

        let op = {
            let success = Rc::clone(&success);
            self.context.introspect().set_sink_input_volume(
                stream_id,
                &volumes,
                Some(Box::new(move |ok| success.set(ok))),
            )
        };
        self.wait(&op)?;

        if success.get() {
            Ok(())
        } else {
            Err(BackendError::OperationFailed(format!(
                "failed to set volume of stream {}",
                stream_id
            )))
        }
    }
}

impl Drop for PulseBackend {
    fn drop(&mut self) {
        self.context.disconnect();
    }
}
