use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
    time::sleep,
};
use tracing::{error, info, warn};

use crate::{provider::EditorProvider, script::RhaiEngine};

/// Something that can be hot-reloaded from disk.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;
    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls a directory and forwards relevant changes to a [`WatchedType`].
///
/// Polling stops when this is dropped or [`shutdown`](Self::shutdown) is called.
pub struct DirectoryWatcher {
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl DirectoryWatcher {
    /// Watch `dir` (not recursively) every `interval`.
    ///
    /// With `initial_scan` every relevant file already present is loaded first. With
    /// `enable_retry` a failing initial load is retried a few times, for files that are still
    /// being written.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        interval: Duration,
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.is_dir() {
            let msg = format!("directory {} does not exist", dir.display());
            warn!(%msg);
            bail!(msg);
        }

        // 1) load what is already there
        if initial_scan {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if watched.is_relevant(&path) {
                    try_reload(&watched, &path, enable_retry).await;
                }
            }
        }

        // 2) poll watcher -> channel
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res| {
                // the receiver is gone on shutdown
                let _ = tx.send(res);
            },
            Config::default()
                .with_poll_interval(interval)
                .with_compare_contents(true),
        )
        .context("creating poll watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", dir.display()))?;

        // 3) channel -> watched type
        let dispatch = tokio::spawn(dispatch_events(rx, watched));
        info!(dir = %dir.display(), ?interval, "watching for changes");

        Ok(DirectoryWatcher {
            _watcher: watcher,
            dispatch,
        })
    }

    pub fn shutdown(self) {
        self.dispatch.abort();
    }
}

async fn dispatch_events(
    mut rx: UnboundedReceiver<notify::Result<Event>>,
    watched: Arc<dyn WatchedType>,
) {
    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "watcher error");
                continue;
            }
        };
        for path in event.paths.iter().filter(|p| watched.is_relevant(p)) {
            let result = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => watched.on_create_or_modify(path).await,
                EventKind::Remove(_) => watched.on_remove(path).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %format!("{e:#}"), "failed to handle change");
            }
        }
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 1..=MAX_RETRIES {
        match watched.reload(path).await {
            Ok(()) => return,
            Err(e) if retry && attempt < MAX_RETRIES => {
                warn!(path = %path.display(), attempt, error = %format!("{e:#}"), "retrying reload");
                sleep(Duration::from_millis(100)).await;
            }
            Err(e) => {
                error!(path = %path.display(), error = %format!("{e:#}"), "failed to reload");
                return;
            }
        }
    }
}

/// Reloads the user script into the editors whenever the file changes.
///
/// A script that fails to compile is reported and the previous one stays active.
pub struct ScriptWatcher {
    script: PathBuf,
    provider: Arc<EditorProvider>,
}

impl ScriptWatcher {
    pub fn new(script: PathBuf, provider: Arc<EditorProvider>) -> Self {
        Self { script, provider }
    }

    /// Load the script once and keep it reloaded. The returned watcher must be kept alive.
    pub async fn watch(self, interval: Duration) -> Result<DirectoryWatcher> {
        let dir = match self.script.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if !self.script.is_file() {
            bail!("script {} does not exist", self.script.display());
        }
        DirectoryWatcher::new(dir, Arc::new(self), interval, true, true).await
    }
}

#[async_trait]
impl WatchedType for ScriptWatcher {
    fn is_relevant(&self, path: &Path) -> bool {
        path.file_name().is_some() && path.file_name() == self.script.file_name()
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        // rebuilding the editors runs script callbacks under the engine lock
        let provider = self.provider.clone();
        let script = path.to_path_buf();
        let catalog = tokio::task::spawn_blocking(move || -> Result<_> {
            let engine = RhaiEngine::from_file(&script).with_context(|| {
                format!("keeping the previous script, {} failed to load", script.display())
            })?;
            Ok(provider.reload(Box::new(engine)))
        })
        .await
        .context("script reload task failed")??;

        info!(
            script = %path.display(),
            channels = catalog.channels().len(),
            "script reloaded"
        );
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        warn!(script = %path.display(), "script removed, keeping the loaded version");
        Ok(())
    }
}
