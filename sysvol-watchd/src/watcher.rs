//! Directory watcher: bumps the `GPT.INI` marker of a root after content
//! under it changed and stayed quiet for the grace period.
//!
//! A supervisor task owns the lifecycle. Callers talk to it through a
//! cloneable [`WatcherHandle`]; each call is a message answered on a
//! oneshot channel once the supervisor has finished acting on it. The event
//! loop it spawns is the only owner of the watch subscriptions and of the
//! dirty-root set.
//!
//! ```text
//! Stopped ──start──▶ Starting ──ready──▶ Running ──stop──▶ Stopping ──exit──▶ Stopped
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use sysvol_core::config::validate_dirs;
use sysvol_core::{is_marker_file, VersionFile};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::debounce::DebounceTimer;
use crate::error::{io_err, DaemonError};
use crate::resolver::resolve;

/// Lifecycle state of a watcher.
///
/// `Starting` and `Stopping` only hold while the supervisor is inside a
/// start or stop request. Requests are served one at a time, so
/// [`WatcherHandle::state`] answers after the transition and reports
/// `Stopped` or `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

enum Control {
    Start {
        dirs: Vec<PathBuf>,
        respond_to: oneshot::Sender<Result<(), DaemonError>>,
    },
    Stop {
        respond_to: oneshot::Sender<Result<(), DaemonError>>,
    },
    UpdateDirs {
        dirs: Vec<PathBuf>,
        respond_to: oneshot::Sender<Result<(), DaemonError>>,
    },
    Dirs {
        respond_to: oneshot::Sender<Vec<PathBuf>>,
    },
    State {
        respond_to: oneshot::Sender<WatcherState>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable control handle. The watcher stops, flushing pending bumps,
/// once every handle is dropped.
#[derive(Debug, Clone)]
pub struct WatcherHandle {
    tx: mpsc::Sender<Control>,
}

impl WatcherHandle {
    /// Spawn a stopped watcher. Must be called within a Tokio runtime.
    pub fn spawn(grace: Duration) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let supervisor = Supervisor {
            grace,
            state: WatcherState::Stopped,
            dirs: Vec::new(),
            running: None,
        };
        tokio::spawn(supervisor.run(rx));
        Self { tx }
    }

    /// Validate `dirs`, subscribe to them recursively and start the event
    /// loop. Returns once the loop is ready or failed to initialise.
    pub async fn start(&self, dirs: Vec<PathBuf>) -> Result<(), DaemonError> {
        self.request(|respond_to| Control::Start { dirs, respond_to })
            .await?
    }

    /// Flush pending bumps and wait for the event loop to exit.
    pub async fn stop(&self) -> Result<(), DaemonError> {
        self.request(|respond_to| Control::Stop { respond_to }).await?
    }

    /// Restart on `dirs`. On validation failure nothing changes.
    pub async fn update_dirs(&self, dirs: Vec<PathBuf>) -> Result<(), DaemonError> {
        self.request(|respond_to| Control::UpdateDirs { dirs, respond_to })
            .await?
    }

    /// Directories currently watched, as configured.
    pub async fn dirs(&self) -> Result<Vec<PathBuf>, DaemonError> {
        self.request(|respond_to| Control::Dirs { respond_to }).await
    }

    /// Settled state: queued behind any start or stop in flight.
    pub async fn state(&self) -> Result<WatcherState, DaemonError> {
        self.request(|respond_to| Control::State { respond_to }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| DaemonError::ChannelClosed("watcher control"))?;
        rx.await
            .map_err(|_| DaemonError::ChannelClosed("watcher response"))
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct RunningLoop {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Supervisor {
    grace: Duration,
    state: WatcherState,
    dirs: Vec<PathBuf>,
    running: Option<RunningLoop>,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::Receiver<Control>) {
        while let Some(message) = rx.recv().await {
            match message {
                Control::Start { dirs, respond_to } => {
                    let _ = respond_to.send(self.start(dirs).await);
                }
                Control::Stop { respond_to } => {
                    let _ = respond_to.send(self.stop().await);
                }
                Control::UpdateDirs { dirs, respond_to } => {
                    let _ = respond_to.send(self.update_dirs(dirs).await);
                }
                Control::Dirs { respond_to } => {
                    let _ = respond_to.send(self.dirs.clone());
                }
                Control::State { respond_to } => {
                    let _ = respond_to.send(self.state);
                }
            }
        }
        if self.running.is_some() {
            let _ = self.stop().await;
        }
    }

    async fn start(&mut self, dirs: Vec<PathBuf>) -> Result<(), DaemonError> {
        if self.running.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }
        self.state = WatcherState::Starting;
        if let Err(err) = validate_dirs(&dirs) {
            self.state = WatcherState::Stopped;
            return Err(err.into());
        }

        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(event_loop(dirs.clone(), self.grace, cancel.clone(), ready_tx));

        let ready = ready_rx
            .await
            .unwrap_or(Err(DaemonError::ChannelClosed("watcher readiness")));
        match ready {
            Ok(()) => {
                tracing::info!(dirs = ?dirs, "watching directories");
                self.dirs = dirs;
                self.running = Some(RunningLoop { cancel, task });
                self.state = WatcherState::Running;
                Ok(())
            }
            Err(err) => {
                let _ = task.await;
                self.state = WatcherState::Stopped;
                Err(err)
            }
        }
    }

    async fn stop(&mut self) -> Result<(), DaemonError> {
        let Some(running) = self.running.take() else {
            return Err(DaemonError::NotRunning);
        };
        self.state = WatcherState::Stopping;
        running.cancel.cancel();
        if let Err(err) = running.task.await {
            tracing::error!(error = %err, "watch loop task failed");
        }
        self.state = WatcherState::Stopped;
        tracing::info!("watcher stopped");
        Ok(())
    }

    async fn update_dirs(&mut self, dirs: Vec<PathBuf>) -> Result<(), DaemonError> {
        validate_dirs(&dirs)?;
        let previous = self.running.is_some().then(|| self.dirs.clone());
        if let Err(err) = self.stop().await {
            tracing::warn!(error = %err, "error stopping watcher before update");
        }
        if let Err(err) = self.start(dirs).await {
            if let Some(previous) = previous {
                if let Err(restore) = self.start(previous).await {
                    tracing::error!(error = %restore, "cannot resume watching previous directories");
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn event_loop(
    dirs: Vec<PathBuf>,
    grace: Duration,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<(), DaemonError>>,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let watcher = match recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    }) {
        Ok(watcher) => watcher,
        Err(err) => {
            let _ = ready.send(Err(err.into()));
            return;
        }
    };

    let mut set = WatchSet::new(watcher, &dirs);
    if let Err(err) = set.subscribe_roots() {
        let _ = ready.send(Err(err));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut debounce = DebounceTimer::new(grace);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = debounce.fired() => set.commit(),
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                if set.handle(event) {
                    debounce.arm();
                }
            }
        }
    }

    // Changes already queued still count.
    while let Ok(event) = event_rx.try_recv() {
        if set.handle(event) {
            debounce.arm();
        }
    }
    if debounce.cancel_if_pending() {
        set.commit();
    }
    tracing::debug!("watch loop exited");
}

// ---------------------------------------------------------------------------
// Watch set
// ---------------------------------------------------------------------------

/// One filesystem change, with renames split into remove and create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Created(PathBuf),
    Written(PathBuf),
    Removed(PathBuf),
}

impl FsChange {
    pub fn path(&self) -> &Path {
        match self {
            FsChange::Created(path) | FsChange::Written(path) | FsChange::Removed(path) => path,
        }
    }
}

/// Translate a notifier event into changes. Access and metadata-only
/// events yield nothing.
pub fn classify(event: &Event) -> Vec<FsChange> {
    let paths = event.paths.iter().cloned();
    match &event.kind {
        EventKind::Create(_) => paths.map(FsChange::Created).collect(),
        EventKind::Remove(_) => paths.map(FsChange::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => paths.map(FsChange::Removed).collect(),
            RenameMode::To => paths.map(FsChange::Created).collect(),
            RenameMode::Both => {
                let mut changes = Vec::with_capacity(event.paths.len());
                if let Some((to, from)) = event.paths.split_last() {
                    changes.extend(from.iter().cloned().map(FsChange::Removed));
                    changes.push(FsChange::Created(to.clone()));
                }
                changes
            }
            RenameMode::Any | RenameMode::Other => paths
                .map(|path| {
                    if fs::symlink_metadata(&path).is_ok() {
                        FsChange::Created(path)
                    } else {
                        FsChange::Removed(path)
                    }
                })
                .collect(),
        },
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) | EventKind::Any => paths.map(FsChange::Written).collect(),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

struct WatchSet {
    watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
    watched: HashSet<PathBuf>,
    dirty: BTreeSet<PathBuf>,
}

impl WatchSet {
    fn new(watcher: RecommendedWatcher, dirs: &[PathBuf]) -> Self {
        // Notifiers report resolved paths on some platforms.
        let roots = dirs
            .iter()
            .map(|dir| fs::canonicalize(dir).unwrap_or_else(|_| dir.clone()))
            .collect();
        Self {
            watcher,
            roots,
            watched: HashSet::new(),
            dirty: BTreeSet::new(),
        }
    }

    fn subscribe_roots(&mut self) -> Result<(), DaemonError> {
        for root in self.roots.clone() {
            self.subscribe_tree(&root)
                .map_err(|err| DaemonError::WatchInit {
                    path: root.clone(),
                    reason: err.to_string(),
                })?;
        }
        Ok(())
    }

    fn subscribe_tree(&mut self, root: &Path) -> Result<(), DaemonError> {
        tracing::debug!(path = %root.display(), "watching directory and children");
        walk_tree(root, &mut |path| self.watch(path))
    }

    fn watch(&mut self, path: &Path) -> Result<(), DaemonError> {
        if !self.watched.insert(path.to_path_buf()) {
            return Ok(());
        }
        if let Err(err) = self.watcher.watch(path, RecursiveMode::NonRecursive) {
            self.watched.remove(path);
            return Err(err.into());
        }
        tracing::trace!(path = %path.display(), "watching");
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) {
        let gone: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|watched| watched.starts_with(path))
            .cloned()
            .collect();
        for watched in gone {
            self.watched.remove(&watched);
            if let Err(err) = self.watcher.unwatch(&watched) {
                tracing::debug!(path = %watched.display(), error = %err, "failed to remove watch");
            }
        }
    }

    /// Apply one notifier event. Returns true if a root became dirty.
    fn handle(&mut self, event: notify::Result<Event>) -> bool {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "watcher event error");
                return false;
            }
        };
        tracing::trace!(event = ?event, "got event");

        let mut dirtied = false;
        for change in classify(&event) {
            let path = change.path();
            if is_marker_file(path) {
                continue;
            }
            match &change {
                FsChange::Created(path) => self.subscribe_created(path),
                FsChange::Removed(path) => self.unwatch(path),
                FsChange::Written(_) => {}
            }
            match resolve(path, &self.roots) {
                Ok(root) => {
                    self.dirty.insert(root);
                    dirtied = true;
                }
                Err(err) => tracing::warn!(error = %err, "ignoring change"),
            }
        }
        dirtied
    }

    fn subscribe_created(&mut self, path: &Path) {
        let file_type = match fs::symlink_metadata(path) {
            Ok(meta) => meta.file_type(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to stat new entry");
                return;
            }
        };
        let result = if file_type.is_dir() {
            self.subscribe_tree(path)
        } else if file_type.is_file() {
            self.watch(path)
        } else {
            Ok(())
        };
        if let Err(err) = result {
            tracing::warn!(path = %path.display(), error = %err, "failed to watch new entry");
        }
    }

    /// Bump the marker of every dirty root, then forget them.
    fn commit(&mut self) {
        for root in std::mem::take(&mut self.dirty) {
            if let Err(err) = VersionFile::in_dir(&root).bump() {
                tracing::warn!(root = %root.display(), error = %err, "failed to bump marker version");
            }
        }
    }
}

/// Visit `root`, every directory below it and every regular file in them,
/// markers excepted. A directory is visited before it is listed, so entries
/// created meanwhile are either listed or reported. Symlinks are not
/// followed.
fn walk_tree(
    root: &Path,
    visit: &mut impl FnMut(&Path) -> Result<(), DaemonError>,
) -> Result<(), DaemonError> {
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        visit(&dir)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&dir, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let ty = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
            let path = entry.path();
            if ty.is_dir() {
                pending.push(path);
            } else if ty.is_file() && !is_marker_file(&path) {
                visit(&path)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    #[rstest]
    #[case(EventKind::Create(CreateKind::File), vec![FsChange::Created("/r/f".into())])]
    #[case(EventKind::Modify(ModifyKind::Data(DataChange::Content)), vec![FsChange::Written("/r/f".into())])]
    #[case(EventKind::Modify(ModifyKind::Any), vec![FsChange::Written("/r/f".into())])]
    #[case(EventKind::Remove(RemoveKind::Any), vec![FsChange::Removed("/r/f".into())])]
    #[case(EventKind::Modify(ModifyKind::Name(RenameMode::From)), vec![FsChange::Removed("/r/f".into())])]
    #[case(EventKind::Modify(ModifyKind::Name(RenameMode::To)), vec![FsChange::Created("/r/f".into())])]
    #[case(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)), vec![])]
    #[case(EventKind::Access(AccessKind::Any), vec![])]
    fn single_path_events(#[case] kind: EventKind, #[case] expected: Vec<FsChange>) {
        assert_eq!(classify(&event(kind, &["/r/f"])), expected);
    }

    #[test]
    fn rename_with_both_paths_is_remove_then_create() {
        let changes = classify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/r/old", "/r/new"],
        ));
        assert_eq!(
            changes,
            vec![
                FsChange::Removed("/r/old".into()),
                FsChange::Created("/r/new".into())
            ]
        );
    }

    #[test]
    fn ambiguous_rename_checks_existence() {
        let dir = TempDir::new().expect("tempdir");
        let present = dir.path().join("present");
        fs::write(&present, "x").expect("write");
        let absent = dir.path().join("absent");

        let changes = classify(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
                .add_path(present.clone())
                .add_path(absent.clone()),
        );
        assert_eq!(changes, vec![FsChange::Created(present), FsChange::Removed(absent)]);
    }

    #[test]
    fn walk_tree_visits_dirs_and_files_without_markers() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("Machine/Scripts")).expect("mkdir");
        fs::write(root.join("GPT.INI"), "[General]\nVersion=1\n").expect("marker");
        fs::write(root.join("Machine/Registry.pol"), "x").expect("file");

        let mut tree = Vec::new();
        walk_tree(root, &mut |path| {
            tree.push(path.to_path_buf());
            Ok(())
        })
        .expect("walk");
        tree.sort();
        let expected = {
            let mut v = vec![
                root.to_path_buf(),
                root.join("Machine"),
                root.join("Machine/Scripts"),
                root.join("Machine/Registry.pol"),
            ];
            v.sort();
            v
        };
        assert_eq!(tree, expected);
    }
}
