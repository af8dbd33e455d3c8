use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::CacheStoreError;
use crate::model::cache_record::CacheRecord;

/// Persistent map from chunk position to its last cached result.
///
/// Records are keyed by the string form of the chunk number. A store is
/// opened once and closed once per run.
pub trait CacheStore {
    fn open(&mut self) -> Result<(), CacheStoreError>;

    fn get(&self, number: u32) -> Option<CacheRecord>;

    fn put(&mut self, number: u32, record: CacheRecord) -> Result<(), CacheStoreError>;

    /// Delete every record positioned strictly after `number`, returning
    /// the positions removed.
    fn invalidate_after(&mut self, number: u32) -> Result<Vec<u32>, CacheStoreError>;

    /// Store `record` at `number` and delete every record after it.
    ///
    /// Nothing is written at `number` unless the later records are gone, so
    /// a failure part way never leaves a fresh record in front of stale ones.
    fn replace_from(&mut self, number: u32, record: CacheRecord) -> Result<Vec<u32>, CacheStoreError> {
        let removed = self.invalidate_after(number)?;
        self.put(number, record)?;
        Ok(removed)
    }

    fn close(&mut self) -> Result<(), CacheStoreError>;

    fn positions(&self) -> Vec<u32>;

    fn location(&self) -> String;
}

fn positions_after(records: &BTreeMap<String, CacheRecord>, number: u32) -> Vec<String> {
    records
        .keys()
        .filter(|k| k.parse::<u32>().map(|n| n > number).unwrap_or(false))
        .cloned()
        .collect()
}

fn parsed_positions(records: &BTreeMap<String, CacheRecord>) -> Vec<u32> {
    let mut positions: Vec<u32> = records.keys().filter_map(|k| k.parse().ok()).collect();
    positions.sort_unstable();
    positions
}

/* =========================
   File-backed store
   ========================= */

/// One JSON file per document. The whole file is rewritten through a
/// temporary file and a rename on every change, and a sibling `.lock` file
/// is held while the store is open.
#[derive(Debug)]
pub struct FileCacheStore {
    path: PathBuf,
    lock_path: PathBuf,
    records: BTreeMap<String, CacheRecord>,
    open: bool,
}

impl FileCacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");

        Self {
            lock_path: PathBuf::from(lock_name),
            path,
            records: BTreeMap::new(),
            open: false,
        }
    }

    /// `<cache_dir>/<basename>.json`
    pub fn for_document(cache_dir: &Path, basename: &str) -> Self {
        Self::new(cache_dir.join(format!("{}.json", basename)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> CacheStoreError {
        CacheStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn acquire_lock(&self) -> Result<(), CacheStoreError> {
        match OpenOptions::new().write(true).create_new(true).open(&self.lock_path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(CacheStoreError::Locked {
                path: self.lock_path.clone(),
            }),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn release_lock(&self) -> Result<(), CacheStoreError> {
        match fs::remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, CacheRecord>, CacheStoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        serde_json::from_str(&text).map_err(|source| CacheStoreError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn flush(&self) -> Result<(), CacheStoreError> {
        let json = serde_json::to_vec(&self.records).map_err(|source| CacheStoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }
}

impl CacheStore for FileCacheStore {
    fn open(&mut self) -> Result<(), CacheStoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        }

        self.acquire_lock()?;

        match self.load() {
            Ok(records) => {
                self.records = records;
                self.open = true;
                log::info!("Opened cache {}", self.path.display());
                Ok(())
            }
            Err(e) => {
                self.release_lock()?;
                Err(e)
            }
        }
    }

    fn get(&self, number: u32) -> Option<CacheRecord> {
        self.records.get(&number.to_string()).cloned()
    }

    fn put(&mut self, number: u32, record: CacheRecord) -> Result<(), CacheStoreError> {
        self.records.insert(number.to_string(), record);
        self.flush()
    }

    fn invalidate_after(&mut self, number: u32) -> Result<Vec<u32>, CacheStoreError> {
        let stale = positions_after(&self.records, number);
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        for key in &stale {
            self.records.remove(key);
        }
        self.flush()?;

        Ok(stale.iter().filter_map(|k| k.parse().ok()).collect())
    }

    fn replace_from(&mut self, number: u32, record: CacheRecord) -> Result<Vec<u32>, CacheStoreError> {
        let stale = positions_after(&self.records, number);
        for key in &stale {
            self.records.remove(key);
        }
        self.records.insert(number.to_string(), record);
        self.flush()?;

        Ok(stale.iter().filter_map(|k| k.parse().ok()).collect())
    }

    fn close(&mut self) -> Result<(), CacheStoreError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.release_lock()?;
        log::info!("Closed cache {}", self.path.display());
        Ok(())
    }

    fn positions(&self) -> Vec<u32> {
        parsed_positions(&self.records)
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for FileCacheStore {
    fn drop(&mut self) {
        if self.open {
            let _ = self.release_lock();
        }
    }
}

/* =========================
   In-memory store
   ========================= */

/// Keeps records for the lifetime of the value; survives close/open.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    records: BTreeMap<String, CacheRecord>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn open(&mut self) -> Result<(), CacheStoreError> {
        Ok(())
    }

    fn get(&self, number: u32) -> Option<CacheRecord> {
        self.records.get(&number.to_string()).cloned()
    }

    fn put(&mut self, number: u32, record: CacheRecord) -> Result<(), CacheStoreError> {
        self.records.insert(number.to_string(), record);
        Ok(())
    }

    fn invalidate_after(&mut self, number: u32) -> Result<Vec<u32>, CacheStoreError> {
        let stale = positions_after(&self.records, number);
        for key in &stale {
            self.records.remove(key);
        }
        Ok(stale.iter().filter_map(|k| k.parse().ok()).collect())
    }

    fn close(&mut self) -> Result<(), CacheStoreError> {
        Ok(())
    }

    fn positions(&self) -> Vec<u32> {
        parsed_positions(&self.records)
    }

    fn location(&self) -> String {
        "memory".into()
    }
}
