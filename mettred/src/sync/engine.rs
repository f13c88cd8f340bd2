//! Drives each dropped item through submit, remote completion, local download
//! and remote cleanup.
//!
//! Items are keyed by their normalized content hash. Every destructive step is
//! gated on fresh remote state: a descriptor is only discarded after the
//! transfer exists remotely, and remote data is only deleted once every leaf
//! has been reported locally complete and the transfer is fully downloaded.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use putio_core::{PutioError, TransferRecord, TransferStatus};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use super::events::{Downloadable, DropKind, LocalDrop, TransferReported};
use super::refresh::{DEFAULT_DEBOUNCE, PipelineSnapshot, RefreshCoordinator};
use super::remote::RemoteService;
use super::report::StatusReport;
use super::transfers::{TransferId, normalize_hash};
use super::tree::{FileId, TreeError};

pub const DEFAULT_FINALIZE_RETRY: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Dropped,
    Submitted,
    AwaitingRemoteCompletion,
    Downloadable,
    AwaitingLocalCompletion,
    Cleaned,
    Abandoned,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Cleaned | ItemState::Abandoned)
    }

    fn has_downloads(self) -> bool {
        matches!(
            self,
            ItemState::Downloadable | ItemState::AwaitingLocalCompletion
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote service unavailable: {0}")]
    RemoteUnavailable(Arc<PutioError>),
    #[error("consistency anomaly: {0}")]
    ConsistencyAnomaly(String),
    #[error(transparent)]
    NotFound(#[from] TreeError),
    #[error("magnet descriptor is not valid utf-8")]
    InvalidMagnet,
}

impl EngineError {
    /// True when the same remote call may succeed if tried again later.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::RemoteUnavailable(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<PutioError> for EngineError {
    fn from(err: PutioError) -> Self {
        EngineError::RemoteUnavailable(Arc::new(err))
    }
}

impl From<Arc<PutioError>> for EngineError {
    fn from(err: Arc<PutioError>) -> Self {
        EngineError::RemoteUnavailable(err)
    }
}

/// Where the engine sends work for the downloader and the drop watcher.
#[derive(Debug, Clone)]
pub struct EngineOutputs {
    pub downloads: UnboundedSender<Downloadable>,
    pub discards: UnboundedSender<PathBuf>,
}

#[derive(Debug)]
struct ItemRecord {
    state: ItemState,
    transfer_id: Option<TransferId>,
    outstanding: BTreeSet<String>,
    duplicates: Vec<PathBuf>,
    finalizing: bool,
    cleaning: bool,
}

impl ItemRecord {
    fn new(state: ItemState) -> Self {
        Self {
            state,
            transfer_id: None,
            outstanding: BTreeSet::new(),
            duplicates: Vec::new(),
            finalizing: false,
            cleaning: false,
        }
    }
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteService>,
    refresher: RefreshCoordinator,
    outputs: EngineOutputs,
    retry_delay: Duration,
    items: Mutex<HashMap<String, ItemRecord>>,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn RemoteService>, outputs: EngineOutputs) -> Self {
        Self::with_timing(remote, outputs, DEFAULT_DEBOUNCE, DEFAULT_FINALIZE_RETRY)
    }

    pub fn with_timing(
        remote: Arc<dyn RemoteService>,
        outputs: EngineOutputs,
        debounce: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            refresher: RefreshCoordinator::new(Arc::clone(&remote), debounce),
            remote,
            outputs,
            retry_delay,
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn item_state(&self, hash: &str) -> Option<ItemState> {
        self.lock_items()
            .get(&normalize_hash(hash))
            .map(|record| record.state)
    }

    pub async fn refresh(&self) -> Result<Arc<PipelineSnapshot>, EngineError> {
        Ok(self.refresher.refresh().await?)
    }

    pub async fn status_report(&self) -> Result<StatusReport, EngineError> {
        let snapshot = self.refresh().await?;
        Ok(StatusReport::from(snapshot.as_ref()))
    }

    /// Hands a new descriptor to put.io unless a transfer with the same hash already exists.
    pub async fn submit(&self, drop: LocalDrop) -> Result<ItemState, EngineError> {
        let hash = normalize_hash(&drop.hash);
        {
            let mut items = self.lock_items();
            if let Some(record) = items.get_mut(&hash)
                && !record.state.is_terminal()
            {
                tracing::info!(
                    %hash,
                    state = ?record.state,
                    path = %drop.path.display(),
                    "descriptor already tracked, skipping"
                );
                if record.state == ItemState::Dropped {
                    record.duplicates.push(drop.path.clone());
                } else {
                    self.discard(&drop.path);
                }
                return Ok(record.state);
            }
            items.insert(hash.clone(), ItemRecord::new(ItemState::Dropped));
        }

        let result = self.submit_new(&hash, &drop).await;
        // Once the descriptor is gone, copies that arrived meanwhile go too.
        let duplicates = {
            let mut items = self.lock_items();
            let still_dropped = items
                .get(&hash)
                .is_some_and(|record| record.state == ItemState::Dropped);
            if still_dropped {
                items.remove(&hash);
                Vec::new()
            } else {
                items
                    .get_mut(&hash)
                    .map(|record| std::mem::take(&mut record.duplicates))
                    .unwrap_or_default()
            }
        };
        for path in &duplicates {
            self.discard(path);
        }
        if let Err(err) = &result {
            tracing::error!(
                %hash,
                path = %drop.path.display(),
                error = %err,
                transient = err.is_transient(),
                "submission failed"
            );
        }
        result
    }

    async fn submit_new(&self, hash: &str, drop: &LocalDrop) -> Result<ItemState, EngineError> {
        let snapshot = self.refresh().await?;
        if let Some(existing) = snapshot.transfers.by_hash(hash).cloned() {
            tracing::info!(
                hash,
                transfer_id = existing.id,
                status = existing.status.as_str(),
                "transfer already exists remotely, not submitting again"
            );
            self.set_state(
                hash,
                ItemState::AwaitingRemoteCompletion,
                Some(existing.id),
            );
            self.discard(&drop.path);
            if existing.is_fully_downloaded() {
                return self.finalize(hash, Some(existing.id)).await;
            }
            return Ok(ItemState::AwaitingRemoteCompletion);
        }

        let mut transfer = match drop.kind {
            DropKind::Magnet => {
                let uri =
                    std::str::from_utf8(&drop.payload).map_err(|_| EngineError::InvalidMagnet)?;
                self.remote.submit_magnet(uri.trim()).await?
            }
            DropKind::Torrent => {
                self.remote
                    .submit_torrent(drop.payload.clone(), &drop.file_name())
                    .await?
            }
        };
        if transfer.hash.is_none() {
            transfer.hash = Some(hash.to_string());
        }
        let transfer_id = transfer.id;
        self.set_state(hash, ItemState::Submitted, Some(transfer_id));
        tracing::info!(hash, transfer_id, kind = ?drop.kind, name = %transfer.name, "transfer submitted");
        self.refresher.record_transfer(transfer);

        self.discard(&drop.path);
        self.set_state(
            hash,
            ItemState::AwaitingRemoteCompletion,
            Some(transfer_id),
        );
        Ok(ItemState::AwaitingRemoteCompletion)
    }

    /// put.io reported a transfer as finished.
    pub async fn on_transfer_reported(
        &self,
        report: TransferReported,
    ) -> Result<ItemState, EngineError> {
        let hash = normalize_hash(&report.hash);
        self.finalize(&hash, report.remote_transfer_id).await
    }

    /// Moves an item from remote completion to its downloads. Only one caller
    /// per item gets past the claim; the others get the current state back.
    async fn finalize(
        &self,
        hash: &str,
        transfer_hint: Option<TransferId>,
    ) -> Result<ItemState, EngineError> {
        let created = match self.claim_finalize(hash) {
            Ok(created) => created,
            Err(state) => {
                tracing::debug!(hash, ?state, "item already finalizing or past remote completion");
                return Ok(state);
            }
        };
        let result = self.locate_and_emit(hash, transfer_hint).await;
        self.release_finalize(hash, created && result.is_err());
        result
    }

    /// The transfer listing may lag behind the callback, so a miss is retried
    /// exactly once after the retry delay.
    async fn locate_and_emit(
        &self,
        hash: &str,
        transfer_hint: Option<TransferId>,
    ) -> Result<ItemState, EngineError> {
        let located = match self.locate(hash).await? {
            Some(found) => Some(found),
            None => {
                tracing::info!(
                    hash,
                    delay_ms = self.retry_delay.as_millis() as u64,
                    "transfer not visible yet, retrying once"
                );
                tokio::time::sleep(self.retry_delay).await;
                self.locate(hash).await?
            }
        };

        let Some((snapshot, transfer)) = located else {
            tracing::error!(
                hash,
                transfer_id = ?transfer_hint,
                "transfer or its files still missing after retry, abandoning"
            );
            self.set_state(hash, ItemState::Abandoned, transfer_hint);
            return Ok(ItemState::Abandoned);
        };
        self.emit_downloads(hash, &transfer, &snapshot).await
    }

    /// Returns whether the record was created by this claim, or the current
    /// state when the item is already claimed or past remote completion.
    fn claim_finalize(&self, hash: &str) -> Result<bool, ItemState> {
        let mut items = self.lock_items();
        match items.entry(hash.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.finalizing
                    || record.state.has_downloads()
                    || record.state == ItemState::Cleaned
                {
                    return Err(record.state);
                }
                record.finalizing = true;
                Ok(false)
            }
            Entry::Vacant(entry) => {
                let mut record = ItemRecord::new(ItemState::AwaitingRemoteCompletion);
                record.finalizing = true;
                entry.insert(record);
                Ok(true)
            }
        }
    }

    /// `forget` drops a record the claim created when nothing came of it.
    fn release_finalize(&self, hash: &str, forget: bool) {
        let mut items = self.lock_items();
        let untouched = match items.get_mut(hash) {
            Some(record) => {
                record.finalizing = false;
                record.state == ItemState::AwaitingRemoteCompletion
            }
            None => false,
        };
        if forget && untouched {
            items.remove(hash);
        }
    }

    async fn locate(
        &self,
        hash: &str,
    ) -> Result<Option<(Arc<PipelineSnapshot>, TransferRecord)>, EngineError> {
        let snapshot = self.refresh().await?;
        let found = snapshot
            .transfers
            .by_hash(hash)
            .filter(|transfer| {
                transfer
                    .file_id
                    .is_some_and(|id| snapshot.files.get(id).is_some())
            })
            .cloned();
        Ok(found.map(|transfer| (snapshot, transfer)))
    }

    async fn emit_downloads(
        &self,
        hash: &str,
        transfer: &TransferRecord,
        snapshot: &PipelineSnapshot,
    ) -> Result<ItemState, EngineError> {
        let root = transfer.file_id.ok_or_else(|| {
            EngineError::ConsistencyAnomaly(format!("transfer {} has no file yet", transfer.id))
        })?;
        let leaves = snapshot.files.leaves_under(root)?;

        let mut ready = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            match self.remote.download_url(leaf.file_id).await {
                Ok(url) => ready.push(Downloadable {
                    path: leaf.path,
                    url,
                    file_id: leaf.file_id,
                }),
                Err(err) => {
                    tracing::error!(
                        hash,
                        file_id = leaf.file_id,
                        error = %err,
                        "could not get a download url, abandoning"
                    );
                    self.set_state(hash, ItemState::Abandoned, Some(transfer.id));
                    return Err(err.into());
                }
            }
        }

        {
            let mut items = self.lock_items();
            let record = items
                .entry(hash.to_string())
                .or_insert_with(|| ItemRecord::new(ItemState::Downloadable));
            record.state = ItemState::Downloadable;
            record.transfer_id = Some(transfer.id);
            record.outstanding = ready.iter().map(|d| d.path.clone()).collect();
        }
        tracing::info!(
            hash,
            transfer_id = transfer.id,
            files = ready.len(),
            "transfer ready for download"
        );

        if ready.is_empty() {
            tracing::warn!(hash, transfer_id = transfer.id, "transfer has no files to download");
            self.set_state(hash, ItemState::AwaitingLocalCompletion, Some(transfer.id));
            return self.try_cleanup(hash, transfer.id, snapshot).await;
        }

        self.set_state(hash, ItemState::AwaitingLocalCompletion, Some(transfer.id));
        for download in ready {
            if self.outputs.downloads.send(download).is_err() {
                tracing::warn!(hash, "downloader is gone, dropping download");
            }
        }
        Ok(ItemState::AwaitingLocalCompletion)
    }

    /// One leaf landed in the complete directory. Once every leaf of its
    /// transfer has, the remote copy is removed.
    pub async fn on_local_complete(&self, path: &str) -> Result<ItemState, EngineError> {
        let path = path.trim_matches('/');
        let snapshot = match self.refresher.latest() {
            Some(snapshot) => snapshot,
            None => self.refresh().await?,
        };
        let transfer = match owning_transfer(&snapshot, path) {
            Ok(transfer) => transfer,
            Err(err) => {
                tracing::warn!(path, error = %err, "local completion does not match any remote transfer");
                return Err(err);
            }
        };
        let key = item_key(&transfer);
        let root = transfer.file_id.unwrap_or_default();
        let all_leaves: BTreeSet<String> = snapshot
            .files
            .leaves_under(root)?
            .into_iter()
            .map(|leaf| leaf.path)
            .collect();

        {
            let mut items = self.lock_items();
            let record = match items.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    entry.insert(ItemRecord::new(ItemState::AwaitingRemoteCompletion))
                }
            };
            if record.state == ItemState::Cleaned || record.cleaning {
                return Ok(record.state);
            }
            if !record.state.has_downloads() {
                record.outstanding = all_leaves;
                record.state = ItemState::AwaitingLocalCompletion;
            }
            record.transfer_id = Some(transfer.id);
            record.outstanding.remove(path);
            if !record.outstanding.is_empty() {
                tracing::debug!(
                    hash = %key,
                    path,
                    remaining = record.outstanding.len(),
                    "leaf complete, waiting for the rest"
                );
                return Ok(record.state);
            }
        }

        self.try_cleanup(&key, transfer.id, &snapshot).await
    }

    /// Emits downloads for every transfer that finished while the daemon was not running.
    pub async fn resume_completed(&self) -> Result<usize, EngineError> {
        let snapshot = self.refresh().await?;
        let completed: Vec<TransferRecord> = snapshot
            .transfers
            .with_status(TransferStatus::Completed)
            .filter(|transfer| transfer.is_fully_downloaded() && transfer.file_id.is_some())
            .cloned()
            .collect();

        let mut resumed = 0;
        for transfer in completed {
            let key = item_key(&transfer);
            if self.item_state(&key).is_some() {
                continue;
            }
            let Ok(created) = self.claim_finalize(&key) else {
                continue;
            };
            let result = self.emit_downloads(&key, &transfer, &snapshot).await;
            self.release_finalize(&key, created && result.is_err());
            match result {
                Ok(_) => resumed += 1,
                Err(err) => tracing::warn!(
                    transfer_id = transfer.id,
                    error = %err,
                    "could not resume completed transfer"
                ),
            }
        }
        Ok(resumed)
    }

    async fn try_cleanup(
        &self,
        key: &str,
        transfer_id: TransferId,
        snapshot: &PipelineSnapshot,
    ) -> Result<ItemState, EngineError> {
        {
            let mut items = self.lock_items();
            let record = items
                .entry(key.to_string())
                .or_insert_with(|| ItemRecord::new(ItemState::AwaitingLocalCompletion));
            if record.cleaning {
                return Ok(record.state);
            }
            record.cleaning = true;
        }

        let result = self.cleanup_remote(key, transfer_id, snapshot).await;

        let mut items = self.lock_items();
        if let Some(record) = items.get_mut(key) {
            record.cleaning = false;
            if let Ok(ItemState::Cleaned) = result {
                record.state = ItemState::Cleaned;
                record.outstanding.clear();
            }
        }
        if let Err(err) = &result {
            tracing::error!(
                hash = key,
                transfer_id,
                error = %err,
                transient = err.is_transient(),
                "remote cleanup failed"
            );
        }
        result
    }

    async fn cleanup_remote(
        &self,
        key: &str,
        transfer_id: TransferId,
        snapshot: &PipelineSnapshot,
    ) -> Result<ItemState, EngineError> {
        let current = self.remote.get_transfer(transfer_id).await?;
        self.refresher.record_transfer(current.clone());
        if !current.is_fully_downloaded() {
            tracing::warn!(
                hash = key,
                transfer_id,
                status = current.status.as_str(),
                downloaded = current.downloaded,
                size = current.size,
                "transfer not fully downloaded remotely, keeping remote copy"
            );
            return Ok(ItemState::AwaitingLocalCompletion);
        }

        let root = current.file_id.ok_or_else(|| {
            EngineError::ConsistencyAnomaly(format!("completed transfer {transfer_id} has no file"))
        })?;
        let leaf_ids: Vec<FileId> = snapshot
            .files
            .leaves_under(root)?
            .iter()
            .map(|leaf| leaf.file_id)
            .collect();
        if !leaf_ids.is_empty() {
            self.remote.delete_files(&leaf_ids).await?;
            tracing::info!(hash = key, files = leaf_ids.len(), "deleted remote files");
        }
        for folder in snapshot.files.folders_bottom_up(root)? {
            let remaining = self.remote.list_folder(folder).await?;
            if remaining.is_empty() {
                self.remote.delete_files(&[folder]).await?;
                tracing::info!(hash = key, folder, "deleted empty remote folder");
            } else {
                tracing::warn!(
                    hash = key,
                    folder,
                    remaining = remaining.len(),
                    "remote folder is not empty, keeping it"
                );
            }
        }

        self.remote.delete_transfer(transfer_id).await?;
        tracing::info!(hash = key, transfer_id, "transfer cleaned");
        Ok(ItemState::Cleaned)
    }

    fn set_state(&self, hash: &str, state: ItemState, transfer_id: Option<TransferId>) {
        let mut items = self.lock_items();
        let record = items
            .entry(hash.to_string())
            .or_insert_with(|| ItemRecord::new(state));
        record.state = state;
        if transfer_id.is_some() {
            record.transfer_id = transfer_id;
        }
    }

    fn discard(&self, path: &Path) {
        if self.outputs.discards.send(path.to_path_buf()).is_err() {
            tracing::warn!(path = %path.display(), "drop watcher is gone, descriptor not discarded");
        }
    }

    fn lock_items(&self) -> MutexGuard<'_, HashMap<String, ItemRecord>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Walks up from the file at `path` until a node is the root file of a known transfer.
fn owning_transfer(snapshot: &PipelineSnapshot, path: &str) -> Result<TransferRecord, EngineError> {
    let node = snapshot.files.lookup_path(path)?;
    snapshot
        .files
        .ancestry(node.id())?
        .into_iter()
        .find_map(|node| snapshot.transfers.by_file_id(node.id()))
        .cloned()
        .ok_or_else(|| EngineError::ConsistencyAnomaly(format!("no transfer owns {path}")))
}

fn item_key(transfer: &TransferRecord) -> String {
    transfer
        .hash
        .as_deref()
        .map(normalize_hash)
        .unwrap_or_else(|| format!("transfer-{}", transfer.id))
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
