//! Payloads exchanged between the pipeline stages.
//!
//! Each collaborator owns one end of a tokio channel; the daemon wires them
//! together at startup.

use std::path::PathBuf;

use url::Url;

use super::tree::FileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropKind {
    Torrent,
    Magnet,
}

impl DropKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "torrent" => Some(DropKind::Torrent),
            "magnet" => Some(DropKind::Magnet),
            _ => None,
        }
    }
}

/// A descriptor file found in the drop directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDrop {
    pub kind: DropKind,
    pub hash: String,
    pub payload: Vec<u8>,
    pub path: PathBuf,
    pub size: u64,
}

impl LocalDrop {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.torrent", self.hash))
    }
}

/// put.io called back about a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReported {
    pub hash: String,
    pub remote_transfer_id: Option<u64>,
}

/// One remote leaf file ready to be fetched to `path` (relative to the download roots).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloadable {
    pub path: String,
    pub url: Url,
    pub file_id: FileId,
}

/// The downloader finished moving `path` into the complete directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalComplete {
    pub path: String,
}
