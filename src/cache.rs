//! Selector cache for page regions discovered with `observe()`.
//!
//! Discovering the region of a page that holds the data we want costs an LLM
//! call. Once a locator is known it is stored under a stable key so later
//! fetches can scope their extraction without paying for discovery again.
//!
//! The cache never validates what it stores. A consumer that finds a cached
//! locator no longer resolves must [`SelectorCache::delete`] it.
//!
//! # Lifecycles
//!
//! - [`SelectorCache::in_memory`]: dropped with the process
//! - [`SelectorCache::persistent`]: loaded from a JSON file on construction and
//!   rewritten on every `set`/`delete`/`clear`. Each rewrite goes to a
//!   sibling `.tmp` file that is then renamed over the cache, so an
//!   interrupted write never leaves a truncated cache behind.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct SelectorCache {
    entries: Mutex<HashMap<String, String>>,
    path: Option<PathBuf>,
}

impl SelectorCache {
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// Open a disk-backed cache. A missing or unreadable file yields an empty
    /// cache; the file is created on the first write.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_entries(&path);
        if !entries.is_empty() {
            info!(path = %path.display(), count = entries.len(), "Loaded cached selectors");
        }
        Self {
            entries: Mutex::new(entries),
            path: Some(path),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, locator: &str) {
        let mut entries = self.lock();
        entries.insert(key.to_string(), locator.to_string());
        self.persist(&entries);
        info!(%key, "Cached selector");
    }

    pub fn delete(&self, key: &str) {
        let mut entries = self.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries);
            debug!(%key, "Dropped cached selector");
        }
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        self.persist(&entries);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding the lock cannot leave the map half-written.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rewrite the backing file. Runs under the entries lock so concurrent
    /// writers cannot interleave.
    fn persist(&self, entries: &HashMap<String, String>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_entries(path, entries) {
            warn!(path = %path.display(), error = %e, "Failed to persist selector cache");
        }
    }
}

fn load_entries(path: &Path) -> HashMap<String, String> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return HashMap::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Selector cache is corrupt; starting empty");
            HashMap::new()
        }
    }
}

fn write_entries(path: &Path, entries: &HashMap<String, String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(entries)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

/// `selectors.json` -> `selectors.json.tmp`, in the same directory so the
/// rename stays on one filesystem.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
