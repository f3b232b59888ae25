use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Cumulative token counters kept in a small JSON file next to the other state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub total: u64,
    #[serde(default, rename = "in")]
    pub input: u64,
    #[serde(default, rename = "out")]
    pub output: u64,
}

#[derive(Debug, Clone)]
pub struct UsageLedger {
    path: PathBuf,
}

impl UsageLedger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> TokenUsage {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// Read-modify-write without locking; only one bridge process owns the file.
    pub fn record(&self, input: u64, output: u64, total: u64) {
        let mut usage = self.load();
        usage.input += input;
        usage.output += output;
        usage.total += total;
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("create token usage dir failed: {err}");
                return;
            }
        }
        match serde_json::to_string(&usage) {
            Ok(body) => {
                if let Err(err) = fs::write(&self.path, body) {
                    warn!("token usage write failed: {err}");
                }
            }
            Err(err) => warn!("token usage encode failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_records() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().join("token_usage.json"));
        ledger.record(10, 5, 15);
        ledger.record(1, 2, 3);
        assert_eq!(
            ledger.load(),
            TokenUsage {
                total: 18,
                input: 11,
                output: 7
            }
        );
        let raw = fs::read_to_string(ledger.path()).unwrap();
        assert!(raw.contains("\"in\":11"));
    }

    #[test]
    fn unwritable_location_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let ledger = UsageLedger::new(blocker.join("state/token_usage.json"));
        ledger.record(1, 1, 2);
        assert!(!ledger.path().exists());
        assert_eq!(ledger.load(), TokenUsage::default());
    }

    #[test]
    fn corrupt_file_starts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_usage.json");
        fs::write(&path, "not json").unwrap();
        let ledger = UsageLedger::new(path);
        ledger.record(1, 1, 2);
        assert_eq!(ledger.load().total, 2);
    }
}
