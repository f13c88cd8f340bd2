use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use putio_core::{
    AccountInfo, FilePage, FileRecord, PutioClient, PutioError, TransferPage, TransferRecord,
};
use url::Url;

/// Operations the pipeline needs from the remote service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn submit_magnet(&self, url: &str) -> Result<TransferRecord, PutioError>;
    async fn submit_torrent(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<TransferRecord, PutioError>;
    async fn list_files(&self, cursor: Option<&str>) -> Result<FilePage, PutioError>;
    async fn list_transfers(&self, cursor: Option<&str>) -> Result<TransferPage, PutioError>;
    async fn list_folder(&self, folder_id: u64) -> Result<Vec<FileRecord>, PutioError>;
    async fn get_transfer(&self, id: u64) -> Result<TransferRecord, PutioError>;
    async fn download_url(&self, file_id: u64) -> Result<Url, PutioError>;
    async fn delete_files(&self, ids: &[u64]) -> Result<(), PutioError>;
    async fn delete_transfer(&self, id: u64) -> Result<(), PutioError>;
    async fn account_info(&self) -> Result<AccountInfo, PutioError>;
}

pub struct PutioRemote {
    client: PutioClient,
    page_size: u32,
}

impl PutioRemote {
    pub fn new(client: PutioClient, page_size: u32) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
        }
    }
}

#[async_trait]
impl RemoteService for PutioRemote {
    async fn submit_magnet(&self, url: &str) -> Result<TransferRecord, PutioError> {
        self.client.add_transfer(url).await
    }

    async fn submit_torrent(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<TransferRecord, PutioError> {
        self.client.upload_torrent(bytes, filename).await
    }

    async fn list_files(&self, cursor: Option<&str>) -> Result<FilePage, PutioError> {
        match cursor {
            Some(cursor) => self.client.continue_files(cursor, self.page_size).await,
            None => self.client.list_files(self.page_size).await,
        }
    }

    async fn list_transfers(&self, cursor: Option<&str>) -> Result<TransferPage, PutioError> {
        match cursor {
            Some(cursor) => self.client.continue_transfers(cursor, self.page_size).await,
            None => self.client.list_transfers(self.page_size).await,
        }
    }

    async fn list_folder(&self, folder_id: u64) -> Result<Vec<FileRecord>, PutioError> {
        self.client.list_folder(folder_id).await
    }

    async fn get_transfer(&self, id: u64) -> Result<TransferRecord, PutioError> {
        self.client.get_transfer(id).await
    }

    async fn download_url(&self, file_id: u64) -> Result<Url, PutioError> {
        self.client.file_url(file_id).await
    }

    async fn delete_files(&self, ids: &[u64]) -> Result<(), PutioError> {
        self.client.delete_files(ids).await
    }

    async fn delete_transfer(&self, id: u64) -> Result<(), PutioError> {
        self.client.remove_transfers(&[id]).await
    }

    async fn account_info(&self) -> Result<AccountInfo, PutioError> {
        self.client.account_info().await
    }
}

/// Forwards every call to the wrapped service and traces its arguments and outcome.
pub struct LoggingRemote<R> {
    inner: R,
    calls: AtomicU64,
}

impl<R> LoggingRemote<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            calls: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn begin(&self, method: &'static str, args: std::fmt::Arguments<'_>) -> u64 {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(call, method, args = %args, "remote call");
        call
    }
}

fn finish<T: std::fmt::Debug>(
    call: u64,
    method: &'static str,
    result: Result<T, PutioError>,
) -> Result<T, PutioError> {
    match &result {
        Ok(value) => tracing::trace!(call, method, returned = ?value, "remote call returned"),
        Err(err) => tracing::trace!(call, method, error = %err, "remote call failed"),
    }
    result
}

#[async_trait]
impl<R: RemoteService> RemoteService for LoggingRemote<R> {
    async fn submit_magnet(&self, url: &str) -> Result<TransferRecord, PutioError> {
        let call = self.begin("submit_magnet", format_args!("{url}"));
        finish(call, "submit_magnet", self.inner.submit_magnet(url).await)
    }

    async fn submit_torrent(
        &self,
        bytes: Vec<u8>,
        filename: &str,
    ) -> Result<TransferRecord, PutioError> {
        let call = self.begin(
            "submit_torrent",
            format_args!("{filename} ({} bytes)", bytes.len()),
        );
        finish(
            call,
            "submit_torrent",
            self.inner.submit_torrent(bytes, filename).await,
        )
    }

    async fn list_files(&self, cursor: Option<&str>) -> Result<FilePage, PutioError> {
        let call = self.begin("list_files", format_args!("{cursor:?}"));
        let result = self.inner.list_files(cursor).await;
        match &result {
            Ok(page) => tracing::trace!(
                call,
                files = page.files.len(),
                more = page.cursor.is_some(),
                "remote call returned"
            ),
            Err(err) => tracing::trace!(call, error = %err, "remote call failed"),
        }
        result
    }

    async fn list_transfers(&self, cursor: Option<&str>) -> Result<TransferPage, PutioError> {
        let call = self.begin("list_transfers", format_args!("{cursor:?}"));
        let result = self.inner.list_transfers(cursor).await;
        match &result {
            Ok(page) => tracing::trace!(
                call,
                transfers = page.transfers.len(),
                more = page.cursor.is_some(),
                "remote call returned"
            ),
            Err(err) => tracing::trace!(call, error = %err, "remote call failed"),
        }
        result
    }

    async fn list_folder(&self, folder_id: u64) -> Result<Vec<FileRecord>, PutioError> {
        let call = self.begin("list_folder", format_args!("{folder_id}"));
        finish(call, "list_folder", self.inner.list_folder(folder_id).await)
    }

    async fn get_transfer(&self, id: u64) -> Result<TransferRecord, PutioError> {
        let call = self.begin("get_transfer", format_args!("{id}"));
        finish(call, "get_transfer", self.inner.get_transfer(id).await)
    }

    async fn download_url(&self, file_id: u64) -> Result<Url, PutioError> {
        let call = self.begin("download_url", format_args!("{file_id}"));
        finish(call, "download_url", self.inner.download_url(file_id).await)
    }

    async fn delete_files(&self, ids: &[u64]) -> Result<(), PutioError> {
        let call = self.begin("delete_files", format_args!("{ids:?}"));
        finish(call, "delete_files", self.inner.delete_files(ids).await)
    }

    async fn delete_transfer(&self, id: u64) -> Result<(), PutioError> {
        let call = self.begin("delete_transfer", format_args!("{id}"));
        finish(call, "delete_transfer", self.inner.delete_transfer(id).await)
    }

    async fn account_info(&self) -> Result<AccountInfo, PutioError> {
        let call = self.begin("account_info", format_args!(""));
        finish(call, "account_info", self.inner.account_info().await)
    }
}
