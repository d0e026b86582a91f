// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Change notifications from PulseAudio.
//!
//! A subscription runs on its own thread with its own mainloop and forwards
//! matching events into a tokio channel. If the server goes away the thread
//! reconnects with exponential backoff; after too many failed attempts in a
//! row it gives up and drops the sender, which the listener sees as a closed
//! channel.

use super::pulse::{check_context, iterate, open_context};
use super::{BackendError, BackendEvent, ChangeKind, EventClass};
use libpulse_binding::context::subscribe::{Facility, InterestMaskSet, Operation as SubscriptionOp};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on sources dispatched per poll, so cancellation stays prompt.
const MAX_DISPATCH_PER_POLL: usize = 64;

/// Longest wait between reconnect attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    pub client_name: String,
    pub poll_interval: Duration,
    pub max_reconnect_attempts: u32,
}

/// How one connected session ended.
enum SessionEnd {
    /// Cancelled, or nobody listens any more.
    Stopped,
    /// Could not connect at all.
    ConnectFailed(BackendError),
    /// Was connected, then lost the server.
    Lost(BackendError),
}

/// Start a subscription thread for `class`.
pub fn spawn_subscription(
    class: EventClass,
    settings: SubscriptionSettings,
    tx: UnboundedSender<BackendEvent>,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pa-subscribe-{}", class))
        .spawn(move || subscription_thread(class, settings, tx, cancel))
}

fn subscription_thread(
    class: EventClass,
    settings: SubscriptionSettings,
    tx: UnboundedSender<BackendEvent>,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;

    loop {
        let error = match run_session(class, &settings, &tx, &cancel) {
            SessionEnd::Stopped => break,
            SessionEnd::ConnectFailed(e) => e,
            SessionEnd::Lost(e) => {
                failures = 0;
                e
            }
        };

        failures += 1;
        if failures > settings.max_reconnect_attempts {
            error!(
                "Giving up on {} notifications after {} failed attempts: {}",
                class, failures, error
            );
            break;
        }

        let delay = backoff_delay(failures);
        warn!(
            "{} subscription interrupted ({}), reconnecting in {}ms ({}/{})",
            class,
            error,
            delay.as_millis(),
            failures,
            settings.max_reconnect_attempts
        );
        if sleep_unless_cancelled(delay, &cancel) {
            break;
        }
    }

    debug!("{} subscription thread exiting", class);
}

fn run_session(
    class: EventClass,
    settings: &SubscriptionSettings,
    tx: &UnboundedSender<BackendEvent>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let client_name = format!("{}-{}-listener", settings.client_name, class);
    let (mut mainloop, mut context) = match open_context(&client_name) {
        Ok(pair) => pair,
        Err(e) => return SessionEnd::ConnectFailed(e),
    };

    let event_tx = tx.clone();
    context.set_subscribe_callback(Some(Box::new(
        move |facility: Option<Facility>, operation: Option<SubscriptionOp>, index: u32| {
            if let Some(event) = translate(class, facility, operation, index) {
                let _ = event_tx.send(event);
            }
        },
    )));
    let _subscribe_op = context.subscribe(interest_mask(class), move |success| {
        if !success {
            warn!("Subscribing to {} notifications was rejected", class);
        }
    });

    info!("Listening for {} changes", class);

    let end = loop {
        if cancel.is_cancelled() || tx.is_closed() {
            break SessionEnd::Stopped;
        }

        let mut lost = None;
        for _ in 0..MAX_DISPATCH_PER_POLL {
            match iterate(&mut mainloop, false) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    lost = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = lost.or_else(|| check_context(&context).err()) {
            break SessionEnd::Lost(e);
        }

        thread::sleep(settings.poll_interval);
    };

    context.disconnect();
    end
}

fn interest_mask(class: EventClass) -> InterestMaskSet {
    match class {
        EventClass::DeviceSet => InterestMaskSet::SERVER | InterestMaskSet::SINK,
        EventClass::StreamSet => InterestMaskSet::SINK_INPUT,
    }
}

/// Keep the notifications that matter for `class`.
///
/// Sink `Changed` events fire on every device volume tweak and are dropped;
/// a default-sink switch arrives as a server change.
fn translate(
    class: EventClass,
    facility: Option<Facility>,
    operation: Option<SubscriptionOp>,
    index: u32,
) -> Option<BackendEvent> {
    let kind = match operation? {
        SubscriptionOp::New => ChangeKind::New,
        SubscriptionOp::Changed => ChangeKind::Changed,
        SubscriptionOp::Removed => ChangeKind::Removed,
    };
    let relevant = match (class, facility?) {
        (EventClass::DeviceSet, Facility::Server) => true,
        (EventClass::DeviceSet, Facility::Sink) => kind != ChangeKind::Changed,
        (EventClass::StreamSet, Facility::SinkInput) => true,
        _ => false,
    };
    relevant.then_some(BackendEvent { class, kind, index })
}

/// 100ms, 200ms, 400ms, ... capped at [`MAX_BACKOFF`].
fn backoff_delay(failures: u32) -> Duration {
    let ms = 100u64.saturating_mul(1 << failures.saturating_sub(1).min(6));
    Duration::from_millis(ms).min(MAX_BACKOFF)
}

/// Sleep in short slices; returns true if cancelled meanwhile.
fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) -> bool {
    let slice = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < total {
        if cancel.is_cancelled() {
            return true;
        }
        let step = slice.min(total - waited);
        thread::sleep(step);
        waited += step;
    }
    cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_change_is_a_device_event() {
        let event = translate(
            EventClass::DeviceSet,
            Some(Facility::Server),
            Some(SubscriptionOp::Changed),
            0,
        );
        assert_eq!(
            event,
            Some(BackendEvent {
                class: EventClass::DeviceSet,
                kind: ChangeKind::Changed,
                index: 0,
            })
        );
    }

    #[test]
    fn test_sink_volume_change_is_ignored() {
        assert_eq!(
            translate(EventClass::DeviceSet, Some(Facility::Sink), Some(SubscriptionOp::Changed), 3),
            None
        );
        assert!(translate(EventClass::DeviceSet, Some(Facility::Sink), Some(SubscriptionOp::New), 3).is_some());
    }

    #[test]
    fn test_stream_listener_only_sees_sink_inputs() {
        assert!(translate(
            EventClass::StreamSet,
            Some(Facility::SinkInput),
            Some(SubscriptionOp::Changed),
            7
        )
        .is_some());
        assert_eq!(
            translate(EventClass::StreamSet, Some(Facility::Server), Some(SubscriptionOp::Changed), 0),
            None
        );
        assert_eq!(translate(EventClass::StreamSet, None, Some(SubscriptionOp::New), 0), None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_millis(200));
        assert_eq!(backoff_delay(3), Duration::from_millis(400));
        assert_eq!(backoff_delay(20), MAX_BACKOFF);
    }

    #[test]
    fn test_cancelled_sleep_returns_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(sleep_unless_cancelled(Duration::from_secs(10), &cancel));
    }
}
