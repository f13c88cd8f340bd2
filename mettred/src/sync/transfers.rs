use std::collections::{BTreeMap, HashMap};

use putio_core::{TransferRecord, TransferStatus};

use super::tree::FileId;

pub type TransferId = u64;

/// Lookup tables over one full transfer listing.
#[derive(Debug, Clone, Default)]
pub struct TransferIndex {
    by_id: HashMap<TransferId, TransferRecord>,
    by_hash: HashMap<String, TransferId>,
    by_file_id: HashMap<FileId, TransferId>,
    by_status: BTreeMap<TransferStatus, Vec<TransferId>>,
}

impl TransferIndex {
    pub fn from_pages<I>(pages: I) -> Self
    where
        I: IntoIterator<Item = Vec<TransferRecord>>,
    {
        let mut index = Self::default();
        for page in pages {
            index.ingest_page(page);
        }
        index
    }

    pub fn ingest_page(&mut self, records: Vec<TransferRecord>) {
        for record in records {
            self.insert(record);
        }
    }

    /// Replaces one transfer in place, keeping the hash and file-id entries pointing at it.
    pub fn update_one(&mut self, record: TransferRecord) {
        if let Some(previous) = self.by_id.get(&record.id).cloned() {
            if let Some(hash) = previous.hash.as_deref().map(normalize_hash)
                && self.by_hash.get(&hash) == Some(&previous.id)
            {
                self.by_hash.remove(&hash);
            }
            if let Some(file_id) = previous.file_id
                && self.by_file_id.get(&file_id) == Some(&previous.id)
            {
                self.by_file_id.remove(&file_id);
            }
            if let Some(ids) = self.by_status.get_mut(&previous.status) {
                ids.retain(|id| *id != previous.id);
                if ids.is_empty() {
                    self.by_status.remove(&previous.status);
                }
            }
        }
        self.insert(record);
    }

    fn insert(&mut self, record: TransferRecord) {
        let id = record.id;
        if let Some(hash) = record.hash.as_deref() {
            self.by_hash.insert(normalize_hash(hash), id);
        }
        if let Some(file_id) = record.file_id {
            self.by_file_id.insert(file_id, id);
        }
        let ids = self.by_status.entry(record.status).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        self.by_id.insert(id, record);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: TransferId) -> Option<&TransferRecord> {
        self.by_id.get(&id)
    }

    pub fn by_hash(&self, hash: &str) -> Option<&TransferRecord> {
        self.by_hash
            .get(&normalize_hash(hash))
            .and_then(|id| self.by_id.get(id))
    }

    pub fn by_file_id(&self, file_id: FileId) -> Option<&TransferRecord> {
        self.by_file_id
            .get(&file_id)
            .and_then(|id| self.by_id.get(id))
    }

    pub fn with_status(&self, status: TransferStatus) -> impl Iterator<Item = &TransferRecord> {
        self.by_status
            .get(&status)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
    }

    /// Transfer count per status, for the periodic report.
    pub fn status_report(&self) -> BTreeMap<&'static str, usize> {
        self.by_status
            .iter()
            .map(|(status, ids)| (status.as_str(), ids.len()))
            .collect()
    }
}

pub fn normalize_hash(hash: &str) -> String {
    hash.trim().to_ascii_lowercase()
}
