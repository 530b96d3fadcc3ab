//! MultiClone - Run identity-distinct copies of a single-instance application
//!
//! Manages a family of clones of one trusted application bundle: tracks which
//! copies are alive, creates and upgrades identity-rewritten duplicates, and
//! keeps itself current through a safe self-update pipeline. The UI layer sits
//! on top of the coordinator's event stream and is not part of this binary.

#![allow(dead_code)] // Several capability methods exist for the UI layer's API

mod core;
mod persistence;
mod platform;
mod update;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use single_instance::SingleInstance;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::core::clone_factory::{CloneFactory, SystemBundleOps};
use crate::core::coordinator::{Command, Coordinator, Event};
use crate::core::monitor::ProcessMonitor;
use crate::persistence::{CloneRegistry, CustomNames};
use crate::update::installer::{DiskImageExtractor, SystemAuthorizer, UpdateInstaller};
use crate::update::script::DetachedScriptExecutor;

/// Application name constant
pub const APP_NAME: &str = "MultiClone";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // The clone manager itself stays single-instance.
    let guard = SingleInstance::new(APP_NAME).expect("Failed to create single instance lock");
    if !guard.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(APP_NAME);
    let settings = persistence::load_settings(&data_dir)?;
    info!(
        "Managing {} ({})",
        settings.app_name, settings.base_identity
    );

    let monitor = ProcessMonitor::new(Duration::from_secs(settings.terminate_grace_secs));
    let factory = CloneFactory::new(
        settings.family(),
        settings.clones_directory(),
        Arc::new(SystemBundleOps),
    );
    let registry = CloneRegistry::load(&settings.get_data_directory())?;
    let names = CustomNames::load(&settings.get_data_directory())?;
    let installer = UpdateInstaller::new(
        APP_VERSION,
        settings.feed_url.clone(),
        settings.include_prereleases,
        settings.ignored_version.clone(),
        settings.staging_directory(),
    );

    let (coordinator, handle) = Coordinator::new(
        settings,
        monitor,
        factory,
        registry,
        names,
        installer,
        Arc::new(SystemAuthorizer),
        Arc::new(DetachedScriptExecutor),
        Arc::new(DiskImageExtractor),
    );

    // Log the event stream the UI layer would consume.
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::InstancesChanged(list)) => {
                    debug!("Instance list: {} entries", list.len())
                }
                Ok(Event::UpdateChanged(state)) => debug!("Update state: {:?}", state),
                Ok(Event::UpdatePrompt(release)) => {
                    info!("Update {} available: {}", release.version, release.web_url)
                }
                Ok(Event::OperationFailed { operation, message }) => {
                    error!("{} failed: {}", operation, message)
                }
                Ok(Event::RestartImminent) => info!("Install script launched; restarting"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Event stream lagged by {}", skipped)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Quiet update check shortly after startup.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            handle.send(Command::CheckForUpdates {
                user_initiated: false,
            });
        });
    }

    let mut coordinator_task = tokio::spawn(coordinator.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            handle.send(Command::Shutdown);
            let _ = (&mut coordinator_task).await;
        }
        // Ends on its own only for a restart; exiting releases our file lock
        // so the install script can replace the bundle.
        _ = &mut coordinator_task => {
            info!("{} exiting for update", APP_NAME);
        }
    }

    Ok(())
}

/// Initialize the logging system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("multiclone=info,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
