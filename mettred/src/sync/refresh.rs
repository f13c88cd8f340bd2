//! Debounced, coalescing rebuild of the remote state snapshot.
//!
//! The first caller in a window starts a fetch immediately. Anyone calling
//! while that fetch runs awaits the same shared future, and callers arriving
//! after it finished but inside the window get its result without another
//! round-trip. Failures are handed to every caller that awaited the failed
//! fetch and are never cached.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use putio_core::{AccountInfo, PutioError, TransferRecord};
use tokio::time::Instant;

use super::remote::RemoteService;
use super::report::{StatusReport, format_bytes};
use super::transfers::TransferIndex;
use super::tree::{FileTree, FileTreeBuilder};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Remote state as seen by one completed refresh.
#[derive(Debug, Clone)]
pub struct PipelineSnapshot {
    pub files: FileTree,
    pub transfers: TransferIndex,
    pub account: AccountInfo,
}

pub type RefreshResult = Result<Arc<PipelineSnapshot>, Arc<PutioError>>;

type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

enum RefreshState {
    Idle,
    InFlight {
        generation: u64,
        started: Instant,
        future: SharedRefresh,
    },
    Cooling {
        started: Instant,
    },
}

pub struct RefreshCoordinator {
    remote: Arc<dyn RemoteService>,
    window: Duration,
    state: Mutex<RefreshState>,
    generation: Mutex<u64>,
    current: RwLock<Option<Arc<PipelineSnapshot>>>,
}

impl RefreshCoordinator {
    pub fn new(remote: Arc<dyn RemoteService>, window: Duration) -> Self {
        Self {
            remote,
            window,
            state: Mutex::new(RefreshState::Idle),
            generation: Mutex::new(0),
            current: RwLock::new(None),
        }
    }

    /// Last published snapshot, if any refresh has succeeded yet.
    pub fn latest(&self) -> Option<Arc<PipelineSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub async fn refresh(&self) -> RefreshResult {
        let (generation, future) = {
            let mut state = self.lock_state();
            let pending = match &*state {
                RefreshState::InFlight {
                    generation, future, ..
                } => Some((*generation, future.clone())),
                RefreshState::Cooling { started } if started.elapsed() < self.window => {
                    if let Some(snapshot) = self.latest() {
                        return Ok(snapshot);
                    }
                    None
                }
                _ => None,
            };
            match pending {
                Some(pending) => pending,
                None => self.start_fetch(&mut state),
            }
        };

        let result = future.await;

        let mut state = self.lock_state();
        let finished = match &*state {
            RefreshState::InFlight {
                generation: current,
                started,
                ..
            } if *current == generation => Some(*started),
            _ => None,
        };
        if let Some(started) = finished {
            *state = match &result {
                Ok(snapshot) => {
                    self.publish(Arc::clone(snapshot));
                    RefreshState::Cooling { started }
                }
                Err(_) => RefreshState::Idle,
            };
        }
        result
    }

    /// Folds a freshly fetched transfer into the published snapshot without a full rebuild.
    pub fn record_transfer(&self, record: TransferRecord) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(snapshot) = current.as_ref() {
            let mut next = PipelineSnapshot::clone(snapshot);
            next.transfers.update_one(record);
            *current = Some(Arc::new(next));
        }
    }

    fn start_fetch(&self, state: &mut RefreshState) -> (u64, SharedRefresh) {
        let generation = {
            let mut counter = self
                .generation
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *counter += 1;
            *counter
        };
        let remote = Arc::clone(&self.remote);
        let future = async move {
            fetch_snapshot(remote.as_ref())
                .await
                .map(Arc::new)
                .map_err(Arc::new)
        }
        .boxed()
        .shared();
        *state = RefreshState::InFlight {
            generation,
            started: Instant::now(),
            future: future.clone(),
        };
        (generation, future)
    }

    fn publish(&self, snapshot: Arc<PipelineSnapshot>) {
        let report = StatusReport::from(snapshot.as_ref());
        tracing::info!(
            used = %format_bytes(report.used, 1),
            available = %format_bytes(report.avail, 1),
            total = %format_bytes(report.total, 2),
            files = report.files,
            transfers = ?report.transfers,
            orphaned = snapshot.files.orphaned().len(),
            "remote state refreshed"
        );
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(snapshot);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Pulls every file page, every transfer page and the account info, then builds the snapshot.
pub async fn fetch_snapshot(remote: &dyn RemoteService) -> Result<PipelineSnapshot, PutioError> {
    let (files, transfers, account) = tokio::try_join!(
        fetch_files(remote),
        fetch_transfers(remote),
        remote.account_info()
    )?;
    Ok(PipelineSnapshot {
        files,
        transfers,
        account,
    })
}

async fn fetch_files(remote: &dyn RemoteService) -> Result<FileTree, PutioError> {
    let mut builder = FileTreeBuilder::default();
    let mut cursor: Option<String> = None;
    loop {
        let page = remote.list_files(cursor.as_deref()).await?;
        builder.ingest_page(page.files);
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(builder.finish())
}

async fn fetch_transfers(remote: &dyn RemoteService) -> Result<TransferIndex, PutioError> {
    let mut index = TransferIndex::default();
    let mut cursor: Option<String> = None;
    loop {
        let page = remote.list_transfers(cursor.as_deref()).await?;
        index.ingest_page(page.transfers);
        match page.cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(index)
}
