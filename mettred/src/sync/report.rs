use std::collections::BTreeMap;
use std::fmt;

use super::refresh::PipelineSnapshot;

const UNITS: [&str; 9] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// 1024-based human size with up to `decimals` fractional digits, trailing zeros dropped.
pub fn format_bytes(bytes: u64, decimals: usize) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let mut text = format!("{value:.decimals$}");
    if text.contains('.') {
        text = text.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{text} {}", UNITS[unit])
}

/// Account usage and transfer counts taken from one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub username: String,
    pub avail: u64,
    pub used: u64,
    pub total: u64,
    pub files: usize,
    pub transfers: BTreeMap<&'static str, usize>,
}

impl From<&PipelineSnapshot> for StatusReport {
    fn from(snapshot: &PipelineSnapshot) -> Self {
        let disk = snapshot.account.disk;
        Self {
            username: snapshot.account.username.clone(),
            avail: disk.avail,
            used: disk.used,
            total: disk.size,
            files: snapshot.files.len(),
            transfers: snapshot.transfers.status_report(),
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "account: {}", self.username)?;
        writeln!(
            f,
            "storage: {} used, {} available, {} total",
            format_bytes(self.used, 1),
            format_bytes(self.avail, 1),
            format_bytes(self.total, 2)
        )?;
        writeln!(f, "files: {}", self.files)?;
        let count: usize = self.transfers.values().sum();
        write!(f, "transfers: {count}")?;
        for (status, n) in &self.transfers {
            write!(f, "\n  {status}: {n}")?;
        }
        Ok(())
    }
}
