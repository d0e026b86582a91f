// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Notification-driven passes.
//!
//! A [`Listener`] waits for backend notifications, lets a burst settle, and
//! runs one pass on the blocking pool. Notifications that pile up while it
//! settles or while the pass runs are folded into a single follow-up pass.
//! Passes of one listener never overlap; listeners in the same process also
//! serialise on a shared gate so store updates don't interleave.

use crate::backend::{BackendEvent, EventClass};
use crate::pass::PassRunner;
use crate::reconcile::PassMode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("{0} notifications stopped arriving")]
    SubscriptionClosed(EventClass),
    #[error("{class} listener gave up after {failures} failed passes in a row, last: {last}")]
    TooManyFailures {
        class: EventClass,
        failures: u32,
        last: String,
    },
}

/// Shutdown state shared by everything running in this process.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    cancel: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel on SIGTERM or SIGINT. Must be called inside the runtime.
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down...");
                }
                _ = cancel.cancelled() => return,
            }
            cancel.cancel();
        });
        Ok(())
    }
}

/// Which notifications a listener follows, and how loudly its passes report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    DeviceChanges,
    StreamChanges,
}

impl ListenerRole {
    pub fn class(self) -> EventClass {
        match self {
            ListenerRole::DeviceChanges => EventClass::DeviceSet,
            ListenerRole::StreamChanges => EventClass::StreamSet,
        }
    }

    pub fn mode(self) -> PassMode {
        match self {
            ListenerRole::DeviceChanges => PassMode::verbose(),
            ListenerRole::StreamChanges => PassMode::silent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    pub settle_delay: Duration,
    pub max_consecutive_failures: u32,
}

pub struct Listener {
    role: ListenerRole,
    settings: ListenerSettings,
    runner: Arc<PassRunner>,
    gate: Arc<Mutex<()>>,
    cancel: CancellationToken,
    failures: u32,
}

impl Listener {
    pub fn new(
        role: ListenerRole,
        settings: ListenerSettings,
        runner: Arc<PassRunner>,
        gate: Arc<Mutex<()>>,
        lifecycle: &Lifecycle,
    ) -> Self {
        Self {
            role,
            settings,
            runner,
            gate,
            cancel: lifecycle.token(),
            failures: 0,
        }
    }

    /// Run until shutdown, the subscription closing, or too many failures.
    pub async fn run(mut self, mut events: UnboundedReceiver<BackendEvent>) -> Result<(), ListenerError> {
        let class = self.role.class();
        info!("{} listener started", class);

        self.pass().await?;

        loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        error!("{} subscription closed", class);
                        return Err(ListenerError::SubscriptionClosed(class));
                    }
                },
            };
            trace!("{} notification: {:?} #{}", first.class, first.kind, first.index);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.settle_delay) => {}
            }

            let coalesced = 1 + drain(&mut events);
            if coalesced > 1 {
                debug!("{} {} notifications coalesced into one pass", coalesced, class);
            }

            self.pass().await?;
        }

        info!("{} listener stopped", class);
        Ok(())
    }

    /// Run one pass to completion, holding the gate.
    async fn pass(&mut self) -> Result<(), ListenerError> {
        let class = self.role.class();
        let mode = self.role.mode();
        let runner = Arc::clone(&self.runner);

        let outcome = {
            let _gate = self.gate.lock().await;
            tokio::task::spawn_blocking(move || runner.run(mode)).await
        };

        let failure = match outcome {
            Ok(Ok(summary)) => {
                self.failures = 0;
                debug!(
                    "{} pass on '{}': {} captured, {} skipped, {} restored, {} failed",
                    class,
                    summary.device,
                    summary.captured,
                    summary.skipped,
                    summary.applied,
                    summary.failed
                );
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) if e.is_panic() => format!("pass panicked: {}", e),
            Err(e) => format!("pass was cancelled: {}", e),
        };

        self.failures += 1;
        error!(
            "{} pass failed ({}/{}): {}",
            class, self.failures, self.settings.max_consecutive_failures, failure
        );
        if self.failures >= self.settings.max_consecutive_failures {
            return Err(ListenerError::TooManyFailures {
                class,
                failures: self.failures,
                last: failure,
            });
        }
        Ok(())
    }
}

/// Take everything already queued; returns how many were taken.
fn drain(events: &mut UnboundedReceiver<BackendEvent>) -> usize {
    let mut taken = 0;
    loop {
        match events.try_recv() {
            Ok(_) => taken += 1,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return taken,
        }
    }
}
