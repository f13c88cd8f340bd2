//! Watches the drop directory for `.torrent` and `.magnet` descriptors.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify::event::{ModifyKind, RenameMode};
use tokio::sync::mpsc;

use super::descriptor::read_drop;
use super::events::{DropKind, LocalDrop};

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for path in map_event(&watch_root, event) {
                let _ = tx.send(path);
            }
        }
        Err(err) => tracing::warn!(error = %err, "drop directory watch error"),
    })?;
    watcher.watch(root, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

/// Candidate descriptor paths touched by `event`.
fn map_event(root: &Path, event: Event) -> Vec<PathBuf> {
    let paths = match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            return Vec::new();
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().skip(1).collect()
        }
        EventKind::Create(_) | EventKind::Modify(_) => event.paths,
        _ => return Vec::new(),
    };
    paths
        .into_iter()
        .filter(|path| path.parent() == Some(root) && is_descriptor(path))
        .collect()
}

pub fn is_descriptor(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| DropKind::from_extension(&ext.to_ascii_lowercase()))
        .is_some()
}

/// Descriptor files already sitting in the drop directory.
pub async fn scan_existing(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_descriptor(&path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Turns filesystem activity into [`LocalDrop`]s and deletes descriptors once submitted.
pub struct DropWatcher {
    root: PathBuf,
    seen: HashMap<PathBuf, u64>,
    drops: mpsc::UnboundedSender<LocalDrop>,
}

impl DropWatcher {
    pub fn new(root: PathBuf, drops: mpsc::UnboundedSender<LocalDrop>) -> Self {
        Self {
            root,
            seen: HashMap::new(),
            drops,
        }
    }

    /// Emits a drop for `path` unless the same file at the same size was already emitted.
    pub async fn consider(&mut self, path: &Path) -> bool {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return false,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "descriptor vanished before reading");
                return false;
            }
        };
        if self.seen.get(path) == Some(&size) {
            return false;
        }
        match read_drop(path).await {
            Ok(dropped) => {
                tracing::info!(
                    path = %path.display(),
                    hash = %dropped.hash,
                    kind = ?dropped.kind,
                    "descriptor dropped"
                );
                self.seen.insert(path.to_path_buf(), size);
                if self.drops.send(dropped).is_err() {
                    tracing::warn!("engine is gone, drop not delivered");
                }
                true
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable descriptor");
                false
            }
        }
    }

    pub async fn discard(&mut self, path: &Path) -> io::Result<()> {
        self.seen.remove(path);
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "descriptor removed");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Scans the directory once, then serves watch events and discard requests until both close.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PathBuf>,
        mut discards: mpsc::UnboundedReceiver<PathBuf>,
    ) {
        match scan_existing(&self.root).await {
            Ok(existing) => {
                for path in existing {
                    self.consider(&path).await;
                }
            }
            Err(err) => {
                tracing::error!(root = %self.root.display(), error = %err, "cannot scan drop directory")
            }
        }

        let mut events_open = true;
        let mut discards_open = true;
        while events_open || discards_open {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(path) => {
                        self.consider(&path).await;
                    }
                    None => events_open = false,
                },
                discard = discards.recv(), if discards_open => match discard {
                    Some(path) => {
                        if let Err(err) = self.discard(&path).await {
                            tracing::warn!(path = %path.display(), error = %err, "could not remove descriptor");
                        }
                    }
                    None => discards_open = false,
                },
            }
        }
    }
}
