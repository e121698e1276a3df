//! Persisted registry state: one JSON file listing the installed groups,
//! plus the storage-location naming scheme for cache contexts.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::Result;

/// One installed group as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupRecord {
    pub manifest_url: String,
    /// Directory name of the cache version's storage context.
    pub storage_location: String,
    pub size_kb: u64,
    /// Only written when the group's quota differs from the default.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub quota_kb: Option<u64>,
    pub master_urls: Vec<String>,
}

/// Read the record list. A missing file is an empty list.
pub fn load(path: &Path) -> Result<Vec<GroupRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read(path)?;
    let records: Vec<GroupRecord> = serde_json::from_slice(&data)?;
    debug!(path = %path.display(), groups = records.len(), "Registry state loaded");
    Ok(records)
}

/// Rewrite the record list and prune sibling storage directories no record
/// references anymore.
pub fn save(path: &Path, records: &[GroupRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(records)?;
    fs::write(path, data)?;
    debug!(path = %path.display(), groups = records.len(), "Registry state saved");

    if let Some(parent) = path.parent() {
        prune_unreferenced(parent, records);
    }
    Ok(())
}

/// Delete storage directories under `dir` that look like generated context
/// locations but are not referenced by any record.
fn prune_unreferenced(dir: &Path, records: &[GroupRecord]) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !is_storage_location(name) {
            continue;
        }
        if records.iter().any(|r| r.storage_location == name) {
            continue;
        }
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            debug!(location = name, "Pruning unreferenced storage location");
            if let Err(err) = fs::remove_dir_all(entry.path()) {
                warn!(location = name, error = %err, "Failed to prune storage location");
            }
        }
    }
}

fn is_storage_location(name: &str) -> bool {
    name.len() == 32
        && name
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Generate a fresh 32-char lowercase hex storage location name.
pub fn new_storage_location() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(count.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();

    use std::fmt::Write;
    let mut out = String::with_capacity(32);
    for byte in &digest[..16] {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
