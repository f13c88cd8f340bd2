use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path escapes the download directory: {0}")]
    UnsupportedComponent(String),
}

/// Maps a `/`-separated remote path ("Show/ep1.mkv") below a local directory.
pub fn local_path_for(root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    let mut out = root.to_path_buf();
    let mut pushed = false;
    for segment in remote_path.split('/').filter(|s| !s.is_empty()) {
        let mut parts = Path::new(segment).components();
        match (parts.next(), parts.next()) {
            (Some(Component::Normal(part)), None) => {
                out.push(part);
                pushed = true;
            }
            (Some(Component::CurDir), None) => continue,
            _ => return Err(PathError::UnsupportedComponent(remote_path.to_string())),
        }
    }
    if pushed { Ok(out) } else { Err(PathError::Empty) }
}

/// Sibling used while bytes are still arriving.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
