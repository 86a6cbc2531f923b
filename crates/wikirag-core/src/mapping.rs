//! The mapping table: which local documents exist remotely, under which
//! safe id and handle, with which content.
//!
//! [`MappingTable`] is the in-memory form of the persisted mapping file. It
//! is keyed by `local_name` and bound to at most one store. Persistence
//! (atomic load/save) lives in the application crate; this module only
//! defines the table, its invariants and its on-disk shape:
//!
//! ```json
//! {
//!   "version": 1,
//!   "store": "fileSearchStores/wikipedia-abc123",
//!   "documents": [
//!     {
//!       "local_name": "東京.md",
//!       "safe_id": "doc~5e0c0f1b2a7d9c44.md",
//!       "remote_handle": "fileSearchStores/wikipedia-abc123/documents/doc-5e0c-x1",
//!       "content_fingerprint": "9f86d0…",
//!       "title": "東京",
//!       "size_bytes": 5120,
//!       "uploaded_at": "2026-10-17T09:12:44Z"
//!     }
//!   ]
//! }
//! ```
//!
//! Documents are written sorted by `local_name`, so equal tables serialize to
//! identical bytes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::models::{DocumentRecord, DocumentState, RemoteDocument};

/// Current on-disk format version.
pub const MAPPING_FORMAT_VERSION: u32 = 1;

/// All known documents, keyed by `local_name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "MappingFile", try_from = "MappingFile")]
pub struct MappingTable {
    store: Option<String>,
    records: BTreeMap<String, DocumentRecord>,
}

#[derive(Serialize, Deserialize)]
struct MappingFile {
    version: u32,
    #[serde(default)]
    store: Option<String>,
    #[serde(default)]
    documents: Vec<DocumentRecord>,
}

impl From<MappingTable> for MappingFile {
    fn from(table: MappingTable) -> Self {
        MappingFile {
            version: MAPPING_FORMAT_VERSION,
            store: table.store,
            documents: table.records.into_values().collect(),
        }
    }
}

impl TryFrom<MappingFile> for MappingTable {
    type Error = String;

    fn try_from(file: MappingFile) -> Result<Self, Self::Error> {
        if file.version == 0 || file.version > MAPPING_FORMAT_VERSION {
            return Err(format!("unsupported mapping format version {}", file.version));
        }
        let mut table = MappingTable {
            store: file.store,
            records: BTreeMap::new(),
        };
        for record in file.documents {
            if table.records.contains_key(&record.local_name) {
                return Err(format!("duplicate entry for '{}'", record.local_name));
            }
            table.upsert(record).map_err(|e| e.to_string())?;
        }
        Ok(table)
    }
}

/// Result of comparing a local document against its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: DocumentState,
    /// The record had a handle that the live remote listing no longer contains.
    pub drifted: bool,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store this table is bound to, if any.
    pub fn store(&self) -> Option<&str> {
        self.store.as_deref()
    }

    pub fn bind_store(&mut self, store: impl Into<String>) {
        self.store = Some(store.into());
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records that have a remote handle.
    pub fn uploaded_count(&self) -> usize {
        self.records.values().filter(|r| r.is_uploaded()).count()
    }

    pub fn get(&self, local_name: &str) -> Option<&DocumentRecord> {
        self.records.get(local_name)
    }

    /// Insert or replace the record for `record.local_name`.
    ///
    /// Fails with [`SyncError::NormalizationCollision`] if another local name
    /// already owns the same safe id. Returns the replaced record.
    pub fn upsert(&mut self, record: DocumentRecord) -> Result<Option<DocumentRecord>, SyncError> {
        self.check_safe_id(&record.local_name, &record.safe_id)?;
        Ok(self.records.insert(record.local_name.clone(), record))
    }

    /// Fails if `safe_id` is owned by a record other than `local_name`.
    pub fn check_safe_id(&self, local_name: &str, safe_id: &str) -> Result<(), SyncError> {
        match self
            .records
            .values()
            .find(|r| r.safe_id == safe_id && r.local_name != local_name)
        {
            Some(owner) => Err(SyncError::NormalizationCollision {
                safe_id: safe_id.to_string(),
                first: owner.local_name.clone(),
                second: local_name.to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn remove(&mut self, local_name: &str) -> Option<DocumentRecord> {
        self.records.remove(local_name)
    }

    /// Drop every record and the store binding.
    pub fn clear(&mut self) {
        self.records.clear();
        self.store = None;
    }

    /// Records in `local_name` order.
    pub fn records(&self) -> impl Iterator<Item = &DocumentRecord> {
        self.records.values()
    }

    /// Reverse lookup by remote handle or safe id.
    pub fn find_by_remote(&self, reference: &str) -> Option<&DocumentRecord> {
        self.records
            .values()
            .find(|r| r.remote_handle.as_deref() == Some(reference))
            .or_else(|| self.records.values().find(|r| r.safe_id == reference))
    }

    /// Every remote handle referenced by the table.
    pub fn handles(&self) -> BTreeSet<&str> {
        self.records
            .values()
            .filter_map(|r| r.remote_handle.as_deref())
            .collect()
    }

    /// Remote documents that no record references.
    pub fn orphans(&self, remote: &[RemoteDocument]) -> Vec<RemoteDocument> {
        let known = self.handles();
        remote
            .iter()
            .filter(|doc| !known.contains(doc.handle.as_str()))
            .cloned()
            .collect()
    }

    /// Decide what to do with a local document.
    ///
    /// `remote_handles` is the live listing of the store; when given, a record
    /// whose handle is missing from it is treated as pending again.
    pub fn classify(
        &self,
        local_name: &str,
        fingerprint: &str,
        remote_handles: Option<&HashSet<String>>,
    ) -> Classification {
        let state = match self.get(local_name) {
            None => DocumentState::New,
            Some(record) => match &record.remote_handle {
                None => DocumentState::PendingUpload,
                Some(handle) => {
                    if remote_handles.is_some_and(|live| !live.contains(handle)) {
                        return Classification {
                            state: DocumentState::PendingUpload,
                            drifted: true,
                        };
                    }
                    if record.content_fingerprint != fingerprint {
                        DocumentState::Stale
                    } else {
                        DocumentState::UpToDate
                    }
                }
            },
        };
        Classification {
            state,
            drifted: false,
        }
    }
}
