//! Coordinator - Single owning execution context for all mutable state
//!
//! One tokio task owns the instance list, clone registry, custom names, and
//! update state. Timers, OS notifications, and user operations all arrive as
//! commands on one channel; long-running work is offloaded and reports back
//! through internal commands, so no state is ever mutated from two places.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::clone_factory::{next_ordinal, CloneFactory};
use super::error::{CloneError, UpdateError};
use super::instance::{IdentityFamily, Instance};
use super::monitor::ProcessMonitor;
use super::reconciler::{reconcile, CreatingPlaceholder, ReconcileInputs};
use super::settings::Settings;
use crate::persistence::{self, CloneRecord, CloneRegistry, CustomNames};
use crate::platform;
use crate::update::feed::{self, ReleaseInfo};
use crate::update::installer::{
    self, Authorizer, InstallOutcome, PackageExtractor, UpdateInstaller, UpdateState,
};
use crate::update::script::ScriptExecutor;

/// How long to let the OS settle after a launch/terminate notification
/// before re-deriving the instance list.
const NOTIFICATION_DEBOUNCE: Duration = Duration::from_millis(300);

/// Operations and internal completions the coordinator consumes.
#[derive(Debug)]
pub enum Command {
    // User-facing operations
    CreateClone,
    DeleteClone(String),
    DeleteAllClones,
    UpgradeAllClones,
    LaunchInstance { identity: String, activate: bool },
    TerminateInstance(String),
    SetCustomName { identity: String, name: Option<String> },
    CheckForUpdates { user_initiated: bool },
    StartDownload,
    CancelDownload,
    Install,
    IgnoreVersion(String),
    Restart,
    /// An OS launch/terminate notification for the managed family
    AppLifecycleChanged,
    Shutdown,

    // Internal completions from offloaded work
    CloneCreated {
        ordinal: u32,
        result: Result<CloneRecord, CloneError>,
    },
    UpgradeNext {
        queue: Vec<CloneRecord>,
    },
    UpgradeStepDone {
        identity: String,
        result: Result<(), CloneError>,
        queue: Vec<CloneRecord>,
    },
    CheckFinished {
        result: Result<ReleaseInfo, UpdateError>,
        user_initiated: bool,
    },
    DownloadProgress(f32),
    DownloadFinished(Result<PathBuf, UpdateError>),
    InstallPrepared(Result<InstallOutcome, UpdateError>),
}

/// Notifications published after a state mutation completes.
#[derive(Debug, Clone)]
pub enum Event {
    InstancesChanged(Vec<Instance>),
    UpdateChanged(UpdateState),
    /// An available release that should be offered interactively
    UpdatePrompt(ReleaseInfo),
    OperationFailed {
        operation: &'static str,
        message: String,
    },
    /// The install script is launched; the process is about to exit
    RestartImminent,
}

/// Cheap cloneable handle for submitting commands and subscribing to events.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Event>,
}

impl CoordinatorHandle {
    pub fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            warn!("Coordinator is gone; command dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

pub struct Coordinator {
    settings: Settings,
    family: IdentityFamily,
    monitor: ProcessMonitor,
    factory: CloneFactory,
    registry: CloneRegistry,
    names: CustomNames,
    installer: UpdateInstaller,
    authorizer: Arc<dyn Authorizer>,
    executor: Arc<dyn ScriptExecutor>,
    extractor: Arc<dyn PackageExtractor>,
    http: reqwest::Client,

    live: HashMap<String, u32>,
    placeholders: Vec<CreatingPlaceholder>,
    instances: Vec<Instance>,
    upgrading: bool,
    reconcile_after: Option<Instant>,

    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<Event>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        monitor: ProcessMonitor,
        factory: CloneFactory,
        registry: CloneRegistry,
        names: CustomNames,
        installer: UpdateInstaller,
        authorizer: Arc<dyn Authorizer>,
        executor: Arc<dyn ScriptExecutor>,
        extractor: Arc<dyn PackageExtractor>,
    ) -> (Self, CoordinatorHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let handle = CoordinatorHandle {
            tx: tx.clone(),
            events: events.clone(),
        };
        let family = settings.family();
        let coordinator = Self {
            settings,
            family,
            monitor,
            factory,
            registry,
            names,
            installer,
            authorizer,
            executor,
            extractor,
            http: reqwest::Client::new(),
            live: HashMap::new(),
            placeholders: Vec::new(),
            instances: Vec::new(),
            upgrading: false,
            reconcile_after: None,
            tx,
            rx,
            events,
        };
        (coordinator, handle)
    }

    /// Run until shutdown or restart. Everything is serialized here.
    pub async fn run(mut self) {
        let mut full = interval(Duration::from_secs(self.settings.reconcile_interval_secs));
        full.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut light = interval(Duration::from_secs(self.settings.refresh_interval_secs));
        light.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Coordinator running for family {}", self.family.base_identity);
        self.full_reconcile();

        loop {
            let debounce = self.reconcile_after;
            tokio::select! {
                _ = full.tick() => self.full_reconcile(),
                _ = light.tick() => self.light_refresh(),
                _ = async {
                    match debounce {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.reconcile_after = None;
                    self.full_reconcile();
                }
                command = self.rx.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => {
                        if self.handle(command) == ControlFlow::Break(()) {
                            break;
                        }
                    }
                }
            }
        }
        info!("Coordinator stopped");
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine; headless runs just log.
        let _ = self.events.send(event);
    }

    fn fail(&self, operation: &'static str, message: impl ToString) {
        let message = message.to_string();
        error!("{} failed: {}", operation, message);
        self.emit(Event::OperationFailed { operation, message });
    }

    fn schedule_reconcile(&mut self, after: Duration) {
        let deadline = Instant::now() + after;
        self.reconcile_after = Some(match self.reconcile_after {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
    }

    /// Bundle paths for every identity we know about.
    fn known_bundles(&self) -> Vec<(String, PathBuf)> {
        let mut bundles = vec![(
            self.family.base_identity.clone(),
            self.settings.original_app_path.clone(),
        )];
        bundles.extend(
            self.registry
                .records()
                .iter()
                .map(|r| (r.identity.clone(), r.path.clone())),
        );
        bundles
    }

    /// Full pass: refresh the process table, re-derive the list, attach
    /// resource counters, publish.
    fn full_reconcile(&mut self) {
        self.monitor.refresh();
        self.live = self.monitor.live_identities(&self.known_bundles());

        let mut instances = reconcile(
            &self.family,
            ReconcileInputs {
                live: &self.live,
                records: self.registry.records(),
                original_installed: self.settings.original_app_path.exists(),
                original_path: &self.settings.original_app_path,
                placeholders: &self.placeholders,
                custom_names: self.names.map(),
            },
        );

        for instance in &mut instances {
            if let Some(pid) = instance.pid {
                instance.launch_time = self.monitor.launch_time(pid);
                if let Some(usage) = self.monitor.resource_usage(pid) {
                    instance.cpu_percent = usage.cpu_percent;
                    instance.memory_mb = usage.memory_mb;
                }
            }
        }

        self.instances = instances;
        self.emit(Event::InstancesChanged(self.instances.clone()));
    }

    /// Cheap pass: update cpu/memory/liveness of already-running instances
    /// without re-deriving ordinals or the list shape.
    fn light_refresh(&mut self) {
        if !self.instances.iter().any(|i| i.running) {
            return;
        }
        self.monitor.refresh();

        let mut lost_one = false;
        for instance in &mut self.instances {
            if !instance.running {
                continue;
            }
            let Some(pid) = instance.pid else { continue };
            if let Some(usage) = self.monitor.resource_usage(pid) {
                instance.cpu_percent = usage.cpu_percent;
                instance.memory_mb = usage.memory_mb;
            } else {
                instance.running = false;
                instance.cpu_percent = 0.0;
                instance.memory_mb = 0.0;
                lost_one = true;
            }
        }

        if lost_one {
            // The list shape changed underneath us; re-derive soon.
            self.schedule_reconcile(NOTIFICATION_DEBOUNCE);
        }
        self.emit(Event::InstancesChanged(self.instances.clone()));
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::CreateClone => self.create_clone(),
            Command::DeleteClone(identity) => self.delete_clone(&identity),
            Command::DeleteAllClones => self.delete_all_clones(),
            Command::UpgradeAllClones => self.upgrade_all_clones(),
            Command::LaunchInstance { identity, activate } => {
                self.launch_instance(&identity, activate)
            }
            Command::TerminateInstance(identity) => self.terminate_instance(&identity),
            Command::SetCustomName { identity, name } => self.set_custom_name(&identity, name),
            Command::CheckForUpdates { user_initiated } => self.check_for_updates(user_initiated),
            Command::StartDownload => self.start_download(),
            Command::CancelDownload => {
                if self.installer.cancel_download() {
                    self.emit(Event::UpdateChanged(self.installer.state().clone()));
                }
            }
            Command::Install => self.install(),
            Command::IgnoreVersion(version) => self.ignore_version(version),
            Command::Restart => return self.restart(),
            Command::AppLifecycleChanged => self.schedule_reconcile(NOTIFICATION_DEBOUNCE),
            Command::Shutdown => return ControlFlow::Break(()),

            Command::CloneCreated { ordinal, result } => self.clone_created(ordinal, result),
            Command::UpgradeNext { queue } => self.upgrade_next(queue),
            Command::UpgradeStepDone {
                identity,
                result,
                queue,
            } => {
                if let Err(e) = result {
                    self.fail("upgrade clone", format!("{}: {}", identity, e));
                }
                self.send_internal(Command::UpgradeNext { queue });
            }
            Command::CheckFinished {
                result,
                user_initiated,
            } => self.check_finished(result, user_initiated),
            Command::DownloadProgress(fraction) => {
                self.installer.note_progress(fraction);
                self.emit(Event::UpdateChanged(self.installer.state().clone()));
            }
            Command::DownloadFinished(result) => {
                self.installer.finish_download(result);
                self.emit(Event::UpdateChanged(self.installer.state().clone()));
            }
            Command::InstallPrepared(result) => {
                self.installer.finish_install(result);
                self.emit(Event::UpdateChanged(self.installer.state().clone()));
            }
        }
        ControlFlow::Continue(())
    }

    fn send_internal(&self, command: Command) {
        let _ = self.tx.send(command);
    }

    // === Clone operations ===

    fn create_clone(&mut self) {
        let source = self.settings.original_app_path.clone();
        if !source.exists() {
            self.fail("create clone", CloneError::NotInstalled(source));
            return;
        }

        let mut taken: Vec<u32> = self.registry.ids();
        taken.extend(self.placeholders.iter().map(|p| p.ordinal));
        let ordinal = next_ordinal(&taken);

        self.placeholders.push(CreatingPlaceholder {
            ordinal,
            started_at: Utc::now(),
        });
        self.full_reconcile();

        let factory = self.factory.clone();
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = factory.create_clone(&source, &taken);
            let _ = tx.send(Command::CloneCreated { ordinal, result });
        });
    }

    fn clone_created(&mut self, ordinal: u32, result: Result<CloneRecord, CloneError>) {
        self.placeholders.retain(|p| p.ordinal != ordinal);
        match result {
            Ok(record) => {
                info!("Clone {} created at {:?}", record.identity, record.path);
                if let Err(e) = self.registry.add(record) {
                    self.fail("register clone", e);
                }
            }
            Err(e) => self.fail("create clone", e),
        }
        self.full_reconcile();
    }

    fn delete_clone(&mut self, identity: &str) {
        // Fresh liveness immediately before the destructive step.
        self.monitor.refresh();
        self.live = self.monitor.live_identities(&self.known_bundles());

        let Some(record) = self.registry.find_by_identity(identity).cloned() else {
            self.fail("delete clone", format!("no clone with identity {}", identity));
            return;
        };

        match self.factory.delete_clone(&record, &self.live) {
            Ok(()) => {
                if let Err(e) = self.registry.remove(record.id) {
                    self.fail("unregister clone", e);
                }
                if let Err(e) = self.names.remove(identity) {
                    warn!("Failed to drop custom name for {}: {}", identity, e);
                }
                self.full_reconcile();
            }
            Err(e) => self.fail("delete clone", e),
        }
    }

    fn delete_all_clones(&mut self) {
        let identities: Vec<String> = self
            .registry
            .records()
            .iter()
            .map(|r| r.identity.clone())
            .collect();
        for identity in identities {
            self.delete_clone(&identity);
        }
    }

    fn upgrade_all_clones(&mut self) {
        if self.upgrading {
            debug!("Upgrade already in progress");
            return;
        }
        let source = self.settings.original_app_path.clone();
        if !source.exists() {
            self.fail("upgrade clones", CloneError::NotInstalled(source));
            return;
        }
        self.upgrading = true;
        let queue = self.registry.records().to_vec();
        self.send_internal(Command::UpgradeNext { queue });
    }

    /// One serial upgrade step: fresh liveness, one clone, then the rest.
    fn upgrade_next(&mut self, mut queue: Vec<CloneRecord>) {
        let Some(record) = (!queue.is_empty()).then(|| queue.remove(0)) else {
            self.upgrading = false;
            info!("Clone upgrades finished");
            self.full_reconcile();
            return;
        };

        self.monitor.refresh();
        self.live = self.monitor.live_identities(&self.known_bundles());

        let factory = self.factory.clone();
        let live = self.live.clone();
        let source = self.settings.original_app_path.clone();
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let identity = record.identity.clone();
            let result = factory.upgrade_clone(&record, &source, &live);
            let _ = tx.send(Command::UpgradeStepDone {
                identity,
                result,
                queue,
            });
        });
    }

    // === Instance operations ===

    fn launch_instance(&mut self, identity: &str, activate: bool) {
        let Some(instance) = self.instances.iter().find(|i| i.identity == identity) else {
            self.fail("launch instance", format!("unknown identity {}", identity));
            return;
        };
        let Some(path) = instance.path.clone() else {
            self.fail("launch instance", format!("no bundle path for {}", identity));
            return;
        };
        if instance.ordinal == 0 && !path.exists() {
            self.fail("launch instance", CloneError::NotInstalled(path));
            return;
        }

        if let Err(e) = platform::open_application(&path, activate) {
            self.fail("launch instance", e);
            return;
        }
        self.schedule_reconcile(NOTIFICATION_DEBOUNCE);
    }

    fn terminate_instance(&mut self, identity: &str) {
        let Some(pid) = self.live.get(identity).copied() else {
            debug!("Terminate requested for {} but it is not live", identity);
            return;
        };
        // Fire-and-forget; the monitor schedules the forced kill itself.
        self.monitor.terminate(pid);
        self.schedule_reconcile(
            Duration::from_secs(self.settings.terminate_grace_secs) + NOTIFICATION_DEBOUNCE,
        );
    }

    fn set_custom_name(&mut self, identity: &str, name: Option<String>) {
        if let Err(e) = self.names.set(identity, name) {
            self.fail("rename instance", e);
            return;
        }
        self.full_reconcile();
    }

    // === Update operations ===

    fn check_for_updates(&mut self, user_initiated: bool) {
        if !self.installer.begin_check() {
            // A check is already in flight; callers read this as up to date.
            return;
        }
        self.emit(Event::UpdateChanged(UpdateState::Checking));

        let client = self.http.clone();
        let feed_url = self.installer.feed_url().to_string();
        let include_prereleases = self.installer.include_prereleases();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = feed::fetch_latest(&client, &feed_url, include_prereleases).await;
            let _ = tx.send(Command::CheckFinished {
                result,
                user_initiated,
            });
        });
    }

    fn check_finished(&mut self, result: Result<ReleaseInfo, UpdateError>, user_initiated: bool) {
        let failed = result.is_err();
        let state = self.installer.finish_check(result, user_initiated).clone();
        self.emit(Event::UpdateChanged(state.clone()));

        if let UpdateState::Available(release) = state {
            if self.installer.should_prompt(&release) {
                self.emit(Event::UpdatePrompt(release));
            }
        } else if failed && user_initiated {
            if let UpdateState::Failed(message) = self.installer.state() {
                self.fail("check for updates", message.clone());
            }
        }
    }

    fn start_download(&mut self) {
        let Some(mut job) = self.installer.begin_download() else {
            return;
        };
        self.emit(Event::UpdateChanged(self.installer.state().clone()));

        let client = self.http.clone();
        let extractor = Arc::clone(&self.extractor);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let mut last_reported = 0.0f32;
            let downloaded = installer::download_asset(client, &mut job, move |fraction| {
                if fraction - last_reported >= 0.01 || fraction >= 1.0 {
                    last_reported = fraction;
                    let _ = progress_tx.send(Command::DownloadProgress(fraction));
                }
            })
            .await;

            let result = match downloaded {
                Ok(package) => {
                    let dest = job.dest_dir.join("bundle");
                    tokio::task::spawn_blocking(move || {
                        extractor
                            .extract(&package, &dest)
                            .map_err(|e| UpdateError::InvalidResponse(e.to_string()))
                    })
                    .await
                    .unwrap_or_else(|e| Err(UpdateError::InvalidResponse(e.to_string())))
                }
                Err(e) => Err(e),
            };
            let _ = tx.send(Command::DownloadFinished(result));
        });
    }

    fn install(&mut self) {
        let Some(target) = current_bundle_path() else {
            self.fail(
                "install update",
                "not running from an application bundle; install manually",
            );
            return;
        };
        let Some(job) = self
            .installer
            .begin_install(target, Some(std::process::id()))
        else {
            return;
        };
        self.emit(Event::UpdateChanged(self.installer.state().clone()));

        let authorizer = Arc::clone(&self.authorizer);
        let tx = self.tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = installer::prepare_install(&job, authorizer.as_ref());
            let _ = tx.send(Command::InstallPrepared(result));
        });
    }

    fn ignore_version(&mut self, version: String) {
        self.installer.ignore_version(version.clone());
        self.settings.ignored_version = Some(version);
        if let Err(e) = persistence::save_settings(&self.settings.get_data_directory(), &self.settings)
        {
            warn!("Failed to persist ignored version: {}", e);
        }
    }

    /// Point of no return: launch the script, tell everyone, stop the loop.
    fn restart(&mut self) -> ControlFlow<()> {
        let Some((script, admin)) = self.installer.begin_restart() else {
            return ControlFlow::Continue(());
        };
        self.emit(Event::UpdateChanged(UpdateState::Restarting));

        if let Err(e) = installer::launch_install_script(self.executor.as_ref(), &script, admin) {
            self.fail("restart", e);
            return ControlFlow::Continue(());
        }
        self.emit(Event::RestartImminent);
        ControlFlow::Break(())
    }
}

/// The bundle containing the running executable, when there is one.
fn current_bundle_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.ancestors()
        .find(|p| p.extension().map(|ext| ext == "app").unwrap_or(false))
        .map(|p| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clone_factory::BundleOps;
    use crate::update::script::ScriptExecutor;
    use anyhow::Result;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::time::timeout;

    struct NoopOps;

    impl BundleOps for NoopOps {
        fn rewrite_identity(&self, _: &Path, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn strip_quarantine(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn sign_adhoc(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn refresh_discovery_cache(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct DenyAuthorizer;

    impl Authorizer for DenyAuthorizer {
        fn authorize(&self) -> Result<bool> {
            Ok(false)
        }
    }

    struct RecordingExecutor;

    impl ScriptExecutor for RecordingExecutor {
        fn execute(&self, _: &Path, _: bool) -> Result<()> {
            Ok(())
        }
    }

    struct NoopExtractor;

    impl PackageExtractor for NoopExtractor {
        fn extract(&self, package: &Path, _: &Path) -> Result<PathBuf> {
            Ok(package.to_path_buf())
        }
    }

    fn fake_bundle(dir: &Path) -> PathBuf {
        let bundle = dir.join("App.app");
        std::fs::create_dir_all(bundle.join("Contents/MacOS")).unwrap();
        std::fs::write(bundle.join("Contents/MacOS/App"), b"bin").unwrap();
        bundle
    }

    fn build(dir: &Path) -> (Coordinator, CoordinatorHandle) {
        let original = fake_bundle(dir);
        let settings = Settings {
            app_name: "App".into(),
            base_identity: "com.example.app".into(),
            original_app_path: original,
            data_directory: Some(dir.join("data")),
            ..Default::default()
        };
        let family = settings.family();
        let monitor = ProcessMonitor::new(Duration::from_secs(2));
        let factory = CloneFactory::new(
            family.clone(),
            settings.clones_directory(),
            Arc::new(NoopOps),
        );
        let registry = CloneRegistry::load(&settings.get_data_directory()).unwrap();
        let names = CustomNames::load(&settings.get_data_directory()).unwrap();
        let installer = UpdateInstaller::new(
            "1.0.0",
            settings.feed_url.clone(),
            false,
            None,
            settings.staging_directory(),
        );
        Coordinator::new(
            settings,
            monitor,
            factory,
            registry,
            names,
            installer,
            Arc::new(DenyAuthorizer),
            Arc::new(RecordingExecutor),
            Arc::new(NoopExtractor),
        )
    }

    async fn next_instances(rx: &mut broadcast::Receiver<Event>) -> Vec<Instance> {
        loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event within deadline")
                .expect("channel open");
            if let Event::InstancesChanged(list) = event {
                return list;
            }
        }
    }

    #[tokio::test]
    async fn create_clone_lands_in_registry_and_list() {
        let dir = TempDir::new().unwrap();
        let (coordinator, handle) = build(dir.path());
        let mut rx = handle.subscribe();
        tokio::spawn(coordinator.run());

        // Initial pass: just the stopped original.
        let list = next_instances(&mut rx).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].ordinal, 0);

        handle.send(Command::CreateClone);

        // The placeholder shows first, then the real clone replaces it.
        let list = loop {
            let list = next_instances(&mut rx).await;
            if list.iter().any(|i| i.ordinal == 1 && !i.creating) {
                break list;
            }
        };
        let clone = list.iter().find(|i| i.ordinal == 1).unwrap();
        assert_eq!(clone.identity, "com.example.app1");
        assert!(clone.path.as_ref().unwrap().exists());

        handle.send(Command::Shutdown);
    }

    #[tokio::test]
    async fn delete_clone_removes_bundle_and_record() {
        let dir = TempDir::new().unwrap();
        let (coordinator, handle) = build(dir.path());
        let mut rx = handle.subscribe();
        tokio::spawn(coordinator.run());

        handle.send(Command::CreateClone);
        let list = loop {
            let list = next_instances(&mut rx).await;
            if list.iter().any(|i| i.ordinal == 1 && !i.creating) {
                break list;
            }
        };
        let path = list[1].path.clone().unwrap();

        handle.send(Command::DeleteClone("com.example.app1".into()));
        loop {
            let list = next_instances(&mut rx).await;
            if !list.iter().any(|i| i.ordinal == 1) {
                break;
            }
        }
        assert!(!path.exists());

        handle.send(Command::Shutdown);
    }

    #[tokio::test]
    async fn rename_flows_into_the_instance_list() {
        let dir = TempDir::new().unwrap();
        let (coordinator, handle) = build(dir.path());
        let mut rx = handle.subscribe();
        tokio::spawn(coordinator.run());
        let _ = next_instances(&mut rx).await;

        handle.send(Command::SetCustomName {
            identity: "com.example.app".into(),
            name: Some("Primary".into()),
        });
        let list = loop {
            let list = next_instances(&mut rx).await;
            if list[0].custom_name.is_some() {
                break list;
            }
        };
        assert_eq!(list[0].custom_name.as_deref(), Some("Primary"));

        handle.send(Command::Shutdown);
    }
}
