use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::events::{Downloadable, LocalComplete};
use super::paths::{PathError, local_path_for, partial_path};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

#[derive(Debug, Clone)]
pub struct DownloadDirs {
    pub incomplete: PathBuf,
    pub complete: PathBuf,
}

/// Fetches downloadable leaves into the incomplete directory and moves them
/// into the complete directory once every byte is on disk.
#[derive(Clone)]
pub struct Downloader {
    http: Client,
    limit: Arc<Semaphore>,
    dirs: Arc<DownloadDirs>,
    completions: mpsc::UnboundedSender<LocalComplete>,
}

impl Downloader {
    pub fn new(
        dirs: DownloadDirs,
        concurrency: usize,
        completions: mpsc::UnboundedSender<LocalComplete>,
    ) -> Self {
        Self::with_http(Client::new(), dirs, concurrency, completions)
    }

    pub fn with_http(
        http: Client,
        dirs: DownloadDirs,
        concurrency: usize,
        completions: mpsc::UnboundedSender<LocalComplete>,
    ) -> Self {
        Self {
            http,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
            dirs: Arc::new(dirs),
            completions,
        }
    }

    /// Returns the final location of the file in the complete directory.
    pub async fn fetch(&self, download: &Downloadable) -> Result<PathBuf, TransferError> {
        let target = local_path_for(&self.dirs.complete, &download.path)?;
        let staged = local_path_for(&self.dirs.incomplete, &download.path)?;
        if tokio::fs::try_exists(&target).await? {
            tracing::info!(path = %download.path, "already present locally, skipping download");
            return Ok(target);
        }

        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let response = self
            .http
            .get(download.url.clone())
            .send()
            .await?
            .error_for_status()?;

        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&staged);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(err.into());
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &staged).await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_file(&staged, &target).await?;
        tracing::debug!(path = %download.path, bytes = written, "download stored");
        Ok(target)
    }

    pub async fn handle(&self, download: Downloadable) {
        match self.fetch(&download).await {
            Ok(target) => {
                tracing::info!(path = %download.path, target = %target.display(), "download complete");
                let done = LocalComplete {
                    path: download.path,
                };
                if self.completions.send(done).is_err() {
                    tracing::warn!("engine is gone, completion not delivered");
                }
            }
            Err(err) => {
                tracing::error!(
                    path = %download.path,
                    file_id = download.file_id,
                    error = %err,
                    "download failed"
                );
            }
        }
    }

    /// Serves downloads until the channel closes, then waits for the ones in flight.
    pub async fn run(self, mut downloads: mpsc::UnboundedReceiver<Downloadable>) {
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                next = downloads.recv() => match next {
                    Some(download) => {
                        let worker = self.clone();
                        tasks.spawn(async move { worker.handle(download).await });
                    }
                    None => break,
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
        while tasks.join_next().await.is_some() {}
    }
}

async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            // Different filesystems: fall back to copy + remove.
            if tokio::fs::copy(from, to).await.is_err() {
                return Err(rename_err);
            }
            tokio::fs::remove_file(from).await
        }
    }
}
