//! Update installer - Check, download, stage, authorize, install, restart
//!
//! A state machine owned by the coordinator. Long-running work (feed fetch,
//! asset download, package extraction, the interactive authorization probe)
//! runs on spawned tasks; their results come back through `finish_*` calls,
//! so every transition happens on the owning task and stays race-free.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::feed::{ReleaseAsset, ReleaseInfo};
use super::script::{self, ScriptExecutor, ScriptParams};
use super::version::Version;
use crate::core::error::UpdateError;
use crate::platform;

/// Installer state. `Failed` is reachable from every active state.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateState {
    Idle,
    Checking,
    UpToDate,
    Available(ReleaseInfo),
    Downloading { fraction: f32 },
    Staged,
    Authorizing,
    Installing,
    Ready,
    Restarting,
    /// Authorization was declined or failed; the staged update was moved to
    /// a user-writable location instead of being discarded.
    ManualInstall(PathBuf),
    Failed(String),
}

impl UpdateState {
    /// States from which a new check may start.
    fn can_check(&self) -> bool {
        matches!(
            self,
            Self::Idle
                | Self::UpToDate
                | Self::Available(_)
                | Self::ManualInstall(_)
                | Self::Failed(_)
        )
    }
}

/// Asks the user for elevated rights. The real implementation shows the OS
/// prompt; tests substitute a canned answer.
pub trait Authorizer: Send + Sync {
    fn authorize(&self) -> Result<bool>;
}

/// `Authorizer` backed by the platform elevation probe.
pub struct SystemAuthorizer;

impl Authorizer for SystemAuthorizer {
    fn authorize(&self) -> Result<bool> {
        platform::authorize_admin()
    }
}

/// Unpacks a downloaded package into a staged application bundle.
pub trait PackageExtractor: Send + Sync {
    fn extract(&self, package: &Path, dest_dir: &Path) -> Result<PathBuf>;
}

/// Extractor backed by the platform disk-image tools.
pub struct DiskImageExtractor;

impl PackageExtractor for DiskImageExtractor {
    fn extract(&self, package: &Path, dest_dir: &Path) -> Result<PathBuf> {
        platform::extract_package(package, dest_dir)
    }
}

/// A download the coordinator should run on a spawned task.
pub struct DownloadJob {
    pub asset: ReleaseAsset,
    pub dest_dir: PathBuf,
    pub cancel: watch::Receiver<bool>,
}

/// An install preparation the coordinator should run off-task.
pub struct InstallJob {
    pub plan: InstallPlan,
    pub target_writable: bool,
}

/// Paths an install attempt works with. Mirrors the lifetime of one attempt:
/// created at `begin_install`, dropped on failure or manual fallback.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub staged: PathBuf,
    pub target: PathBuf,
    pub backup: PathBuf,
    pub scripts_dir: PathBuf,
    /// Directory the update is parked in when only a manual install is possible
    pub fallback_dir: PathBuf,
    pub wait_pid: Option<u32>,
}

/// How a prepared install should proceed.
#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    Ready { script: PathBuf, admin: bool },
    ManualInstall { staged: PathBuf },
}

/// Live install attempt bookkeeping.
#[derive(Debug, Clone)]
struct InstallSession {
    plan: InstallPlan,
    admin_required: bool,
    script: Option<PathBuf>,
}

pub struct UpdateInstaller {
    current_version: Version,
    feed_url: String,
    include_prereleases: bool,
    ignored_version: Option<String>,
    staging_dir: PathBuf,
    state: UpdateState,
    /// Latest release known to be newer than us; survives until superseded
    available: Option<ReleaseInfo>,
    staged_bundle: Option<PathBuf>,
    session: Option<InstallSession>,
    cancel: Option<watch::Sender<bool>>,
}

impl UpdateInstaller {
    pub fn new(
        current_version: &str,
        feed_url: String,
        include_prereleases: bool,
        ignored_version: Option<String>,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            current_version: Version::parse(current_version),
            feed_url,
            include_prereleases,
            ignored_version,
            staging_dir,
            state: UpdateState::Idle,
            available: None,
            staged_bundle: None,
            session: None,
            cancel: None,
        }
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    pub fn available(&self) -> Option<&ReleaseInfo> {
        self.available.as_ref()
    }

    pub fn feed_url(&self) -> &str {
        &self.feed_url
    }

    pub fn include_prereleases(&self) -> bool {
        self.include_prereleases
    }

    /// Suppress the interactive prompt for one exact version string. The
    /// "update available" signal is unaffected.
    pub fn ignore_version(&mut self, version: String) {
        self.ignored_version = Some(version);
    }

    /// Whether a release should raise an interactive prompt.
    pub fn should_prompt(&self, release: &ReleaseInfo) -> bool {
        self.ignored_version.as_deref() != Some(release.version.as_str())
    }

    /// Start a check. Returns `false` when one is already in flight or the
    /// machine is mid-download/install; the caller treats that as up to date.
    pub fn begin_check(&mut self) -> bool {
        if !self.state.can_check() {
            debug!("Update check skipped in state {:?}", self.state);
            return false;
        }
        self.state = UpdateState::Checking;
        true
    }

    /// Record the outcome of a check. Background checks park failures back
    /// in `Idle` so timers never wedge the machine in `Failed`.
    pub fn finish_check(
        &mut self,
        result: Result<ReleaseInfo, UpdateError>,
        user_initiated: bool,
    ) -> &UpdateState {
        match result {
            Ok(release) => {
                let remote = Version::parse(&release.version);
                if remote.is_newer_than(&self.current_version) {
                    info!("Update available: {}", release.version);
                    self.available = Some(release.clone());
                    self.state = UpdateState::Available(release);
                } else {
                    debug!("Already newest: {}", self.current_version);
                    self.state = UpdateState::UpToDate;
                }
            }
            Err(e) => {
                warn!("Update check failed: {}", e);
                self.state = if user_initiated {
                    UpdateState::Failed(e.to_string())
                } else {
                    UpdateState::Idle
                };
            }
        }
        &self.state
    }

    /// Start downloading the available release. At most one download session
    /// exists system-wide; a second request is a no-op returning `None`.
    pub fn begin_download(&mut self) -> Option<DownloadJob> {
        let UpdateState::Available(release) = &self.state else {
            debug!("Download requested in state {:?}", self.state);
            return None;
        };
        let asset = release.asset.clone();

        if let Err(e) = prepare_staging(&self.staging_dir) {
            self.state = UpdateState::Failed(e.to_string());
            return None;
        }

        let (tx, rx) = watch::channel(false);
        self.cancel = Some(tx);
        self.staged_bundle = None;
        self.state = UpdateState::Downloading { fraction: 0.0 };
        Some(DownloadJob {
            asset,
            dest_dir: self.staging_dir.clone(),
            cancel: rx,
        })
    }

    pub fn note_progress(&mut self, fraction: f32) {
        if matches!(self.state, UpdateState::Downloading { .. }) {
            self.state = UpdateState::Downloading {
                fraction: fraction.clamp(0.0, 1.0),
            };
        }
    }

    /// Cancel an in-flight download. Possible only before installing begins.
    pub fn cancel_download(&mut self) -> bool {
        if !matches!(self.state, UpdateState::Downloading { .. }) {
            return false;
        }
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        self.state = match self.available.clone() {
            Some(release) => UpdateState::Available(release),
            None => UpdateState::Idle,
        };
        true
    }

    /// Record the downloaded-and-extracted bundle path.
    pub fn finish_download(&mut self, result: Result<PathBuf, UpdateError>) {
        self.cancel = None;
        if !matches!(self.state, UpdateState::Downloading { .. }) {
            // A cancel raced completion; the state already moved on.
            return;
        }
        match result {
            Ok(bundle) => {
                info!("Update staged at {:?}", bundle);
                self.staged_bundle = Some(bundle);
                self.state = UpdateState::Staged;
            }
            Err(UpdateError::Cancelled) => {
                self.state = match self.available.clone() {
                    Some(release) => UpdateState::Available(release),
                    None => UpdateState::Idle,
                };
            }
            Err(e) => {
                warn!("Download failed: {}", e);
                self.state = UpdateState::Failed(e.to_string());
            }
        }
    }

    /// Begin installing the staged bundle over `target`. Probes writability
    /// of the target's parent; a non-writable parent moves the machine to
    /// `Authorizing` for the elevation prompt.
    pub fn begin_install(&mut self, target: PathBuf, wait_pid: Option<u32>) -> Option<InstallJob> {
        if self.state != UpdateState::Staged {
            debug!("Install requested in state {:?}", self.state);
            return None;
        }
        let staged = self.staged_bundle.clone()?;

        let backup = backup_path_for(&target);
        let plan = InstallPlan {
            staged,
            target,
            backup,
            scripts_dir: self.staging_dir.join("scripts"),
            fallback_dir: self.staging_dir.join("manual"),
            wait_pid,
        };

        let writable = plan
            .target
            .parent()
            .map(dir_writable)
            .unwrap_or(false);
        self.state = if writable {
            UpdateState::Installing
        } else {
            UpdateState::Authorizing
        };
        self.session = Some(InstallSession {
            plan: plan.clone(),
            admin_required: !writable,
            script: None,
        });
        Some(InstallJob {
            plan,
            target_writable: writable,
        })
    }

    /// Record the prepared install. `Ready` keeps the session alive for the
    /// restart; anything else tears it down.
    pub fn finish_install(&mut self, result: Result<InstallOutcome, UpdateError>) {
        if !matches!(
            self.state,
            UpdateState::Installing | UpdateState::Authorizing
        ) {
            return;
        }
        match result {
            Ok(InstallOutcome::Ready { script, admin }) => {
                if let Some(session) = &mut self.session {
                    session.script = Some(script);
                    session.admin_required = admin;
                }
                self.state = UpdateState::Ready;
            }
            Ok(InstallOutcome::ManualInstall { staged }) => {
                info!("Update parked for manual install at {:?}", staged);
                self.session = None;
                self.staged_bundle = Some(staged.clone());
                self.state = UpdateState::ManualInstall(staged);
            }
            Err(e) => {
                warn!("Install preparation failed: {}", e);
                self.session = None;
                self.state = UpdateState::Failed(e.to_string());
            }
        }
    }

    /// Take the restart step: hand back the script to launch. Once taken,
    /// the transition cannot be cancelled.
    pub fn begin_restart(&mut self) -> Option<(PathBuf, bool)> {
        if self.state != UpdateState::Ready {
            return None;
        }
        let session = self.session.as_ref()?;
        let script = session.script.clone()?;
        let admin = session.admin_required;
        self.state = UpdateState::Restarting;
        Some((script, admin))
    }
}

/// Backup path next to the target: `App.app` -> `App.app.backup`.
fn backup_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    target.with_file_name(format!("{}.backup", name))
}

/// Reset the staging area to a fresh, empty directory.
fn prepare_staging(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context(format!("Failed to clear staging {:?}", dir)),
    }
    std::fs::create_dir_all(dir).context(format!("Failed to create staging {:?}", dir))?;
    Ok(())
}

/// Probe whether we can create files in `dir`.
fn dir_writable(dir: &Path) -> bool {
    let probe = dir.join(format!(".mc-writable-{}", Uuid::new_v4()));
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Prepare the install off the coordinator task: resolve authorization and
/// render the swap script. A declined or failed authorization parks the
/// staged bundle in the fallback directory; the update is never discarded.
pub fn prepare_install(
    job: &InstallJob,
    authorizer: &dyn Authorizer,
) -> Result<InstallOutcome, UpdateError> {
    let admin = if job.target_writable {
        false
    } else {
        match authorizer.authorize() {
            Ok(true) => true,
            Ok(false) => {
                info!("Authorization declined, falling back to manual install");
                return park_for_manual_install(&job.plan);
            }
            Err(e) => {
                warn!("Authorization probe failed: {}", e);
                return park_for_manual_install(&job.plan);
            }
        }
    };

    let mut params = ScriptParams::new(
        job.plan.staged.clone(),
        job.plan.target.clone(),
        job.plan.backup.clone(),
    );
    params.wait_pid = job.plan.wait_pid;

    let script = script::write_script(&job.plan.scripts_dir, &script::render(&params))?;
    Ok(InstallOutcome::Ready { script, admin })
}

fn park_for_manual_install(plan: &InstallPlan) -> Result<InstallOutcome, UpdateError> {
    std::fs::create_dir_all(&plan.fallback_dir)?;
    let name = plan
        .staged
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "update.app".into());
    let parked = plan.fallback_dir.join(name);
    if parked != plan.staged {
        if parked.exists() {
            std::fs::remove_dir_all(&parked)?;
        }
        std::fs::rename(&plan.staged, &parked)?;
    }
    Ok(InstallOutcome::ManualInstall { staged: parked })
}

/// Launch the prepared script through the executor. Called exactly once, on
/// the restart transition; after this the parent's only job is to exit.
pub fn launch_install_script(
    executor: &dyn ScriptExecutor,
    script: &Path,
    admin: bool,
) -> Result<()> {
    info!("Launching install script {:?} (admin: {})", script, admin);
    executor.execute(script, admin)
}

/// Stream an asset into the staging directory, reporting progress and
/// honoring cancellation between chunks. Returns the downloaded file path.
pub async fn download_asset(
    client: reqwest::Client,
    job: &mut DownloadJob,
    mut progress: impl FnMut(f32),
) -> Result<PathBuf, UpdateError> {
    let response = client
        .get(&job.asset.url)
        .header("User-Agent", concat!("multiclone/", env!("CARGO_PKG_VERSION")))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(UpdateError::InvalidResponse(format!(
            "asset download returned HTTP {}",
            response.status()
        )));
    }

    let total = response.content_length().unwrap_or(job.asset.size).max(1);
    let path = job.dest_dir.join(&job.asset.name);
    let mut file = tokio::fs::File::create(&path).await?;
    let mut downloaded: u64 = 0;
    let mut response = response;

    loop {
        tokio::select! {
            chunk = response.chunk() => {
                match chunk? {
                    Some(bytes) => {
                        file.write_all(&bytes).await?;
                        downloaded += bytes.len() as u64;
                        progress(downloaded as f32 / total as f32);
                    }
                    None => break,
                }
            }
            changed = job.cancel.changed() => {
                // A dropped sender also reads as a cancel; nobody is left
                // to want this download.
                if changed.is_err() || *job.cancel.borrow() {
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(UpdateError::Cancelled);
                }
            }
        }
    }

    file.flush().await?;
    Ok(path)
}
