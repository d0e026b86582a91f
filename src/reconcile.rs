// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Capture/apply decisions for one pass.
//!
//! A pass first captures every eligible stream's live volume under the
//! current device, then restores stored volumes, but only when the default
//! device differs from the one seen by the previous pass. Restores compare
//! against what was stored when the pass began; the capture of the same pass
//! never masks a restore. A restored stream's store entry is set to the level
//! it was restored to, so the store matches the live state afterwards.
//!
//! Nothing here talks to the audio server: the result is a list of
//! [`ApplyCommand`]s for the caller to execute.

use crate::backend::StreamView;
use pdav_store::{ApplicationIdentity, IdentityError, IdentityResolver, Store, VolumeLevel};
use std::fmt;
use tracing::{debug, info};

/// Differences below half of PA's volume step (1/65536) are the same volume.
const VOLUME_TOLERANCE: f64 = 0.5 / 65536.0;

/// How much a pass reports about individual applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Every per-application outcome at info level.
    Verbose,
    /// Per-application outcomes at debug level only.
    Silent,
}

/// What a pass is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassMode {
    pub verbosity: Verbosity,
    /// When false the pass only captures.
    pub restore: bool,
}

impl PassMode {
    pub fn verbose() -> Self {
        Self {
            verbosity: Verbosity::Verbose,
            restore: true,
        }
    }

    pub fn silent() -> Self {
        Self {
            verbosity: Verbosity::Silent,
            restore: true,
        }
    }

    pub fn capture_only(self) -> Self {
        Self {
            restore: false,
            ..self
        }
    }
}

/// Push `level` onto stream `stream_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyCommand {
    pub stream_id: u32,
    pub identity: ApplicationIdentity,
    pub application: String,
    pub level: VolumeLevel,
}

/// Why a stream took no part in the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    MetadataIncomplete(IdentityError),
    IgnoredApplication,
    IgnoredDevice,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MetadataIncomplete(e) => write!(f, "{}", e),
            SkipReason::IgnoredApplication => write!(f, "application is ignored"),
            SkipReason::IgnoredDevice => write!(f, "device is ignored"),
        }
    }
}

/// Per-stream result of a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Skipped(SkipReason),
    /// Captured; nothing stored for this device before the pass.
    NoStoredVolume,
    /// Captured; same device as last pass, so nothing was pushed.
    Captured(VolumeLevel),
    /// Device changed and the stored level was already live.
    AlreadyMatching(VolumeLevel),
    /// Device changed and the stored level will be pushed.
    Restored { from: VolumeLevel, to: VolumeLevel },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub stream_id: u32,
    pub application: String,
    pub outcome: Outcome,
}

/// Everything a pass decided.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub store: Store,
    pub commands: Vec<ApplyCommand>,
    pub outcomes: Vec<StreamOutcome>,
    pub device_changed: bool,
}

impl Reconciliation {
    pub fn captured(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o.outcome, Outcome::Skipped(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.captured()
    }
}

/// A stream that survived the exclusion checks.
struct Eligible<'a> {
    stream: &'a StreamView,
    identity: ApplicationIdentity,
    application: String,
    stored_at_start: Option<VolumeLevel>,
}

/// Run capture then apply over `streams`, returning the updated store.
pub fn reconcile(
    current_device: &str,
    streams: &[StreamView],
    mut store: Store,
    resolver: &IdentityResolver,
    mode: PassMode,
) -> Reconciliation {
    let previous_device = store.previous_device().map(str::to_owned);
    let device_changed = previous_device
        .as_deref()
        .map(|previous| previous != current_device)
        .unwrap_or(false);
    let device_ignored = store.is_device_ignored(current_device);

    if device_changed {
        report(
            mode.verbosity,
            format_args!(
                "Default device changed from '{}' to '{}'",
                previous_device.as_deref().unwrap_or_default(),
                current_device
            ),
        );
    }

    let mut outcomes = Vec::with_capacity(streams.len());
    let mut eligible = Vec::with_capacity(streams.len());

    for stream in streams {
        match select(stream, current_device, device_ignored, &store, resolver) {
            Ok(entry) => eligible.push(entry),
            Err(reason) => outcomes.push(StreamOutcome {
                stream_id: stream.id,
                application: stream.metadata.display_name().to_string(),
                outcome: Outcome::Skipped(reason),
            }),
        }
    }

    // Phase 1: capture.
    for entry in &eligible {
        store.record_volume(&entry.identity, current_device, entry.stream.volume);
    }

    // Phase 2: apply.
    let mut commands = Vec::new();
    for entry in &eligible {
        let live = entry.stream.volume;
        let outcome = match entry.stored_at_start {
            None => Outcome::NoStoredVolume,
            Some(_) if !(mode.restore && device_changed) => Outcome::Captured(live),
            Some(stored) if same_level(stored, live) => Outcome::AlreadyMatching(stored),
            Some(stored) => {
                store.record_volume(&entry.identity, current_device, stored);
                commands.push(ApplyCommand {
                    stream_id: entry.stream.id,
                    identity: entry.identity.clone(),
                    application: entry.application.clone(),
                    level: stored,
                });
                Outcome::Restored {
                    from: live,
                    to: stored,
                }
            }
        };
        outcomes.push(StreamOutcome {
            stream_id: entry.stream.id,
            application: entry.application.clone(),
            outcome,
        });
    }

    for outcome in &outcomes {
        report_outcome(mode.verbosity, current_device, outcome);
    }

    store.last_default_sink = Some(current_device.to_string());

    Reconciliation {
        store,
        commands,
        outcomes,
        device_changed,
    }
}

fn select<'a>(
    stream: &'a StreamView,
    current_device: &str,
    device_ignored: bool,
    store: &Store,
    resolver: &IdentityResolver,
) -> Result<Eligible<'a>, SkipReason> {
    let stream_device_ignored = stream
        .device
        .as_deref()
        .map(|device| store.is_device_ignored(device))
        .unwrap_or(false);
    if device_ignored || stream_device_ignored {
        return Err(SkipReason::IgnoredDevice);
    }

    let app = resolver
        .resolve(&stream.metadata)
        .map_err(SkipReason::MetadataIncomplete)?;
    if store.is_application_ignored(&app.identity) {
        return Err(SkipReason::IgnoredApplication);
    }

    Ok(Eligible {
        stream,
        stored_at_start: store.volume_for(&app.identity, current_device),
        identity: app.identity,
        application: app.name,
    })
}

fn same_level(a: VolumeLevel, b: VolumeLevel) -> bool {
    (a - b).abs() < VOLUME_TOLERANCE
}

fn percent(level: VolumeLevel) -> f64 {
    (level * 1000.0).round() / 10.0
}

fn report(verbosity: Verbosity, message: fmt::Arguments<'_>) {
    match verbosity {
        Verbosity::Verbose => info!("{}", message),
        Verbosity::Silent => debug!("{}", message),
    }
}

fn report_outcome(verbosity: Verbosity, device: &str, outcome: &StreamOutcome) {
    let app = &outcome.application;
    match &outcome.outcome {
        Outcome::Skipped(reason) => report(
            verbosity,
            format_args!("Skipping stream {} ('{}'): {}", outcome.stream_id, app, reason),
        ),
        Outcome::NoStoredVolume => report(
            verbosity,
            format_args!("No volume stored for '{}' on '{}', recorded the current one", app, device),
        ),
        Outcome::Captured(level) => report(
            verbosity,
            format_args!("Volume for '{}' on '{}' is {}%", app, device, percent(*level)),
        ),
        Outcome::AlreadyMatching(level) => report(
            verbosity,
            format_args!("Volume for '{}' on '{}' already at {}%", app, device, percent(*level)),
        ),
        Outcome::Restored { from, to } => report(
            verbosity,
            format_args!(
                "Volume for '{}' on '{}' set to {}% (was {}%)",
                app,
                device,
                percent(*to),
                percent(*from)
            ),
        ),
    }
}
