// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! pdav - per-device application volume.
//!
//! Remembers the volume of every application for every output device and
//! restores it when the default device changes. Runs either as a one-shot
//! command or as a listener reacting to audio server notifications.

mod backend;
mod config;
mod listener;
mod pass;
mod reconcile;

use backend::pulse::PulseConnector;
use backend::subscription::spawn_subscription;
use backend::{AudioBackend, Connector};
use clap::{Parser, Subcommand, ValueEnum};
use config::{PathOverrides, Paths, Settings};
use listener::{Lifecycle, Listener, ListenerRole};
use pass::{PassError, PassRunner};
use pdav_store::{IdentityResolver, QuirksTable, VolumeStore};
use reconcile::PassMode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "pdav", version, about = "Per-device application volume")]
struct Cli {
    /// Settings file (default: config.toml in the user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Volume store (default: save.json in the user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    save_file: Option<PathBuf>,

    /// Quirks table (default: quirks.toml in the user config directory)
    #[arg(long, global = true, value_name = "FILE")]
    quirks_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record live volumes and restore stored ones if the default device changed
    Apply {
        /// Report per-application outcomes at debug level only
        #[arg(short, long)]
        quiet: bool,
    },
    /// Record live volumes without restoring anything
    Save,
    /// Run a pass whenever the audio server reports a change
    Listen {
        #[arg(value_enum)]
        target: ListenTarget,
    },
    /// Run the device and stream listeners together
    Daemon,
    /// List live streams with their application identity
    Streams,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ListenTarget {
    /// Default device switches; passes report every application
    Devices,
    /// Streams appearing or changing volume; passes are quiet
    Streams,
}

impl From<ListenTarget> for ListenerRole {
    fn from(target: ListenTarget) -> Self {
        match target {
            ListenTarget::Devices => ListenerRole::DeviceChanges,
            ListenTarget::Streams => ListenerRole::StreamChanges,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pdav=info".parse()?)
                .add_directive("pdav_store=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let paths = Paths::resolve(PathOverrides {
        config_file: cli.config,
        save_file: cli.save_file,
        quirks_file: cli.quirks_file,
    })?;
    let settings = Settings::load(&paths.config_file)?;

    let connector: Arc<dyn Connector> = Arc::new(PulseConnector::new(settings.client_name.clone()));
    let runner = Arc::new(PassRunner::new(
        connector.clone(),
        VolumeStore::new(paths.save_file.clone()),
        paths.quirks_file.clone(),
    ));

    match cli.command {
        Command::Apply { quiet } => {
            let mode = if quiet { PassMode::silent() } else { PassMode::verbose() };
            one_shot(runner, mode).await
        }
        Command::Save => one_shot(runner, PassMode::verbose().capture_only()).await,
        Command::Listen { target } => listen(&[target.into()], runner, &settings).await,
        Command::Daemon => {
            listen(
                &[ListenerRole::DeviceChanges, ListenerRole::StreamChanges],
                runner,
                &settings,
            )
            .await
        }
        Command::Streams => print_streams(connector, &paths).await,
    }
}

/// A single pass; a termination signal lets it finish and exits cleanly.
async fn one_shot(runner: Arc<PassRunner>, mode: PassMode) -> Result<(), Box<dyn std::error::Error>> {
    let lifecycle = Lifecycle::new();
    lifecycle.install_signal_handlers()?;

    let summary = tokio::task::spawn_blocking(move || runner.run(mode)).await??;
    info!(
        "Pass on '{}' done: {} captured, {} restored",
        summary.device, summary.captured, summary.applied
    );
    if summary.failed > 0 {
        warn!("{} volumes could not be restored", summary.failed);
    }
    if lifecycle.is_shutting_down() {
        info!("Termination requested, the pass was completed first");
    }
    Ok(())
}

async fn listen(
    roles: &[ListenerRole],
    runner: Arc<PassRunner>,
    settings: &Settings,
) -> Result<(), Box<dyn std::error::Error>> {
    let lifecycle = Lifecycle::new();
    lifecycle.install_signal_handlers()?;

    let gate = Arc::new(Mutex::new(()));
    let mut subscriptions = Vec::new();
    let mut listeners = JoinSet::new();

    for &role in roles {
        let (tx, rx) = mpsc::unbounded_channel();
        subscriptions.push(spawn_subscription(
            role.class(),
            settings.subscription_settings(),
            tx,
            lifecycle.token(),
        )?);

        let listener = Listener::new(
            role,
            settings.listener_settings(),
            runner.clone(),
            gate.clone(),
            &lifecycle,
        );
        listeners.spawn(listener.run(rx));
    }

    info!("pdav ready");

    let mut first_error: Option<Box<dyn std::error::Error>> = None;
    while let Some(joined) = listeners.join_next().await {
        let error: Box<dyn std::error::Error> = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.into(),
            Err(e) => e.into(),
        };
        error!("{}", error);
        lifecycle.shutdown();
        if first_error.is_none() {
            first_error = Some(error);
        }
    }

    // Subscription threads notice the cancellation within one poll interval.
    let joiner = tokio::task::spawn_blocking(move || {
        for handle in subscriptions {
            let _ = handle.join();
        }
    });
    if tokio::time::timeout(Duration::from_secs(2), joiner).await.is_err() {
        warn!("Subscription threads did not stop in time");
    }

    info!("pdav stopped");
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Print every live stream with the identity it is stored under.
async fn print_streams(connector: Arc<dyn Connector>, paths: &Paths) -> Result<(), Box<dyn std::error::Error>> {
    let quirks_file = paths.quirks_file.clone();
    let save_file = paths.save_file.clone();

    let lines = tokio::task::spawn_blocking(move || -> Result<Vec<String>, PassError> {
        let mut backend: Box<dyn AudioBackend> = connector.connect()?;
        let streams = backend.list_streams()?;
        let resolver = IdentityResolver::new(QuirksTable::load(&quirks_file)?);
        let store = VolumeStore::new(save_file).load()?;

        let lines = streams
            .iter()
            .map(|stream| {
                let device = stream.device.as_deref().unwrap_or("-");
                let quirk = resolver
                    .quirks()
                    .first_match(&stream.metadata)
                    .map(|rule| format!("  [quirk: {}]", rule.label()))
                    .unwrap_or_default();
                match resolver.resolve(&stream.metadata) {
                    Ok(app) => format!(
                        "{:>5}  {}  {:>5.1}%  {}  {} ({}){}{}",
                        stream.id,
                        app.identity,
                        stream.volume * 100.0,
                        device,
                        app.name,
                        app.binary,
                        quirk,
                        if store.is_application_ignored(&app.identity) {
                            "  [ignored]"
                        } else {
                            ""
                        }
                    ),
                    Err(e) => format!(
                        "{:>5}  {:<32}  {:>5.1}%  {}  {} ({})",
                        stream.id,
                        "-",
                        stream.volume * 100.0,
                        device,
                        stream.metadata.display_name(),
                        e
                    ),
                }
            })
            .collect();
        Ok(lines)
    })
    .await??;

    for line in lines {
        println!("{}", line);
    }
    Ok(())
}
