//! Durable storage for the mapping table.
//!
//! The table lives in one JSON file (default `file_mappings.json`). Every save
//! writes a sibling `<file>.tmp`, syncs it and renames it over the original,
//! so a crash mid-write leaves the previous table intact. A file that exists
//! but does not parse is reported as [`SyncError::MappingCorrupt`] and is never
//! overwritten by a load.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use wikirag_core::{DocumentRecord, MappingTable, SyncError};

/// The mapping table plus the file it is persisted to.
///
/// Mutating methods persist before returning; callers sharing a store across
/// tasks wrap it in a `tokio::sync::Mutex` so there is a single writer.
#[derive(Debug)]
pub struct MappingStore {
    path: PathBuf,
    table: MappingTable,
}

impl MappingStore {
    /// Load the table at `path`, or start empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let table = load(&path)?;
        Ok(Self { path, table })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// A copy of the table for read-only consumers.
    pub fn snapshot(&self) -> MappingTable {
        self.table.clone()
    }

    pub fn get(&self, local_name: &str) -> Option<&DocumentRecord> {
        self.table.get(local_name)
    }

    /// Insert or replace one record and persist.
    pub fn upsert(&mut self, record: DocumentRecord) -> Result<(), SyncError> {
        self.table.upsert(record)?;
        self.save()
    }

    /// Insert or replace several records with a single save.
    pub fn upsert_all<I>(&mut self, records: I) -> Result<(), SyncError>
    where
        I: IntoIterator<Item = DocumentRecord>,
    {
        let mut next = self.table.clone();
        for record in records {
            next.upsert(record)?;
        }
        self.table = next;
        self.save()
    }

    /// Remove one record and persist. Returns the removed record.
    pub fn remove(&mut self, local_name: &str) -> Result<Option<DocumentRecord>, SyncError> {
        let removed = self.table.remove(local_name);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    /// Bind the table to `store` and persist.
    pub fn bind_store(&mut self, store: &str) -> Result<(), SyncError> {
        if self.table.store() == Some(store) {
            return Ok(());
        }
        self.table.bind_store(store);
        self.save()
    }

    /// Drop every record and the store binding, then persist.
    pub fn clear(&mut self) -> Result<(), SyncError> {
        self.table.clear();
        self.save()
    }

    /// Write the table atomically.
    pub fn save(&self) -> Result<(), SyncError> {
        save(&self.path, &self.table)
    }
}

/// Read the table at `path`. A missing file is an empty table.
pub fn load(path: &Path) -> Result<MappingTable, SyncError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MappingTable::new()),
        Err(e) => {
            return Err(SyncError::MappingIo {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    serde_json::from_str(&content).map_err(|e| SyncError::MappingCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Serialize `table` and atomically replace the file at `path`.
pub fn save(path: &Path, table: &MappingTable) -> Result<(), SyncError> {
    let io_err = |source: std::io::Error| SyncError::MappingIo {
        path: path.to_path_buf(),
        source,
    };

    let mut json = serde_json::to_string_pretty(table)
        .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    json.push('\n');

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    sync_parent_dir(path);

    tracing::trace!(path = %path.display(), records = table.len(), "mapping table saved");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}
