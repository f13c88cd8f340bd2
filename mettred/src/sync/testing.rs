//! In-memory remote service used by the engine and refresh tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use putio_core::{
    AccountInfo, DiskInfo, FilePage, FileRecord, FileType, PutioError, TransferPage,
    TransferRecord, TransferStatus,
};
use reqwest::StatusCode;
use url::Url;

use super::descriptor;
use super::remote::RemoteService;

#[derive(Default)]
pub struct FakeRemote {
    files: Mutex<Vec<FileRecord>>,
    transfers: Mutex<Vec<TransferRecord>>,
    page_size: Mutex<Option<usize>>,
    list_delay: Mutex<Option<Duration>>,
    url_delay: Mutex<Option<Duration>>,
    fail_listings: AtomicBool,
    hide_transfers: AtomicBool,
    broken_urls: Mutex<HashSet<u64>>,
    deleted_files: Mutex<Vec<u64>>,
    deleted_transfers: Mutex<Vec<u64>>,
    file_listings: AtomicUsize,
    transfer_listings: AtomicUsize,
    transfer_lookups: AtomicUsize,
    submissions: AtomicUsize,
}

impl FakeRemote {
    pub fn set_page_size(&self, size: usize) {
        *self.page_size.lock().unwrap() = Some(size.max(1));
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    /// Makes every `download_url` call yield for `delay` before answering.
    pub fn set_url_delay(&self, delay: Duration) {
        *self.url_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_listings(&self, fail: bool) {
        self.fail_listings.store(fail, Ordering::SeqCst);
    }

    /// Simulates the query side lagging behind: listings come back without any transfer.
    pub fn hide_transfers(&self, hide: bool) {
        self.hide_transfers.store(hide, Ordering::SeqCst);
    }

    pub fn break_url(&self, file_id: u64) {
        self.broken_urls.lock().unwrap().insert(file_id);
    }

    pub fn add_folder(&self, id: u64, parent: Option<u64>, name: &str) {
        self.files.lock().unwrap().push(FileRecord {
            id,
            parent_id: parent,
            name: name.into(),
            file_type: FileType::Folder,
            size: 0,
        });
    }

    pub fn add_file(&self, id: u64, parent: Option<u64>, name: &str, size: u64) {
        self.files.lock().unwrap().push(FileRecord {
            id,
            parent_id: parent,
            name: name.into(),
            file_type: FileType::Video,
            size,
        });
    }

    pub fn add_transfer(
        &self,
        id: u64,
        hash: &str,
        file_id: Option<u64>,
        status: TransferStatus,
        size: u64,
        downloaded: u64,
    ) {
        self.transfers.lock().unwrap().push(TransferRecord {
            id,
            hash: Some(hash.into()),
            name: format!("transfer-{id}"),
            file_id,
            status,
            size,
            downloaded,
            percent_done: None,
            created_at: None,
        });
    }

    pub fn update_transfer(&self, id: u64, update: impl FnOnce(&mut TransferRecord)) {
        if let Some(transfer) = self
            .transfers
            .lock()
            .unwrap()
            .iter_mut()
            .find(|t| t.id == id)
        {
            update(transfer);
        }
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    pub fn deleted_files(&self) -> Vec<u64> {
        self.deleted_files.lock().unwrap().clone()
    }

    pub fn deleted_transfers(&self) -> Vec<u64> {
        self.deleted_transfers.lock().unwrap().clone()
    }

    pub fn file_listings(&self) -> usize {
        self.file_listings.load(Ordering::SeqCst)
    }

    pub fn transfer_listings(&self) -> usize {
        self.transfer_listings.load(Ordering::SeqCst)
    }

    pub fn transfer_lookups(&self) -> usize {
        self.transfer_lookups.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn page<T: Clone>(&self, items: &[T], cursor: Option<&str>) -> (Vec<T>, Option<String>) {
        let start = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let size = self.page_size.lock().unwrap().unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(items.len());
        let next = (end < items.len()).then(|| end.to_string());
        (items[start.min(end)..end].to_vec(), next)
    }

    fn create_transfer(&self, hash: String) -> TransferRecord {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let mut transfers = self.transfers.lock().unwrap();
        let id = transfers.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        let record = TransferRecord {
            id,
            hash: Some(hash),
            name: format!("transfer-{id}"),
            file_id: None,
            status: TransferStatus::InQueue,
            size: 0,
            downloaded: 0,
            percent_done: None,
            created_at: None,
        };
        transfers.push(record.clone());
        record
    }
}

fn unavailable() -> PutioError {
    PutioError::Api {
        status: StatusCode::SERVICE_UNAVAILABLE,
        body: "fake outage".into(),
    }
}

fn not_found() -> PutioError {
    PutioError::Api {
        status: StatusCode::NOT_FOUND,
        body: "not found".into(),
    }
}

#[async_trait]
impl RemoteService for FakeRemote {
    async fn submit_magnet(&self, url: &str) -> Result<TransferRecord, PutioError> {
        let hash = descriptor::magnet_hash(url).unwrap_or_else(|_| url.to_string());
        Ok(self.create_transfer(hash))
    }

    async fn submit_torrent(
        &self,
        bytes: Vec<u8>,
        _filename: &str,
    ) -> Result<TransferRecord, PutioError> {
        let hash = descriptor::torrent_info_hash(&bytes)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
        Ok(self.create_transfer(hash))
    }

    async fn list_files(&self, cursor: Option<&str>) -> Result<FilePage, PutioError> {
        self.file_listings.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.fail_listings.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let files = self.files.lock().unwrap().clone();
        let (files, cursor) = self.page(&files, cursor);
        Ok(FilePage { files, cursor })
    }

    async fn list_transfers(&self, cursor: Option<&str>) -> Result<TransferPage, PutioError> {
        self.transfer_listings.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.hide_transfers.load(Ordering::SeqCst) {
            return Ok(TransferPage::default());
        }
        let transfers = self.transfers.lock().unwrap().clone();
        let (transfers, cursor) = self.page(&transfers, cursor);
        Ok(TransferPage { transfers, cursor })
    }

    async fn list_folder(&self, folder_id: u64) -> Result<Vec<FileRecord>, PutioError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.parent_id == Some(folder_id))
            .cloned()
            .collect())
    }

    async fn get_transfer(&self, id: u64) -> Result<TransferRecord, PutioError> {
        self.transfer_lookups.fetch_add(1, Ordering::SeqCst);
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn download_url(&self, file_id: u64) -> Result<Url, PutioError> {
        let delay = *self.url_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.broken_urls.lock().unwrap().contains(&file_id) {
            return Err(unavailable());
        }
        Ok(Url::parse(&format!("https://dl.example/files/{file_id}"))?)
    }

    async fn delete_files(&self, ids: &[u64]) -> Result<(), PutioError> {
        self.deleted_files.lock().unwrap().extend_from_slice(ids);
        self.files.lock().unwrap().retain(|f| !ids.contains(&f.id));
        Ok(())
    }

    async fn delete_transfer(&self, id: u64) -> Result<(), PutioError> {
        self.deleted_transfers.lock().unwrap().push(id);
        self.transfers.lock().unwrap().retain(|t| t.id != id);
        Ok(())
    }

    async fn account_info(&self) -> Result<AccountInfo, PutioError> {
        Ok(AccountInfo {
            username: "fake".into(),
            disk: DiskInfo {
                avail: 750,
                used: 250,
                size: 1000,
            },
        })
    }
}
