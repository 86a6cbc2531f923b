//! Core data models shared by the synchronizer, the gateway and the query
//! engine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// One local source document as tracked by the mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Original filename, possibly non-ASCII.
    pub local_name: String,
    /// Transport-safe identifier derived from `local_name`.
    pub safe_id: String,
    /// Handle assigned by the remote store; `None` until an upload succeeds.
    pub remote_handle: Option<String>,
    /// SHA-256 of the document content (hex).
    pub content_fingerprint: String,
    /// Human-readable title (the file stem).
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl DocumentRecord {
    /// A freshly discovered document that has not been uploaded yet.
    pub fn discovered(
        local_name: impl Into<String>,
        safe_id: impl Into<String>,
        content_fingerprint: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let local_name = local_name.into();
        let title = title_for(&local_name);
        Self {
            local_name,
            safe_id: safe_id.into(),
            remote_handle: None,
            content_fingerprint: content_fingerprint.into(),
            title,
            size_bytes,
            uploaded_at: None,
        }
    }

    /// Returns `true` once the document has a remote handle.
    pub fn is_uploaded(&self) -> bool {
        self.remote_handle.is_some()
    }
}

/// File stem used as a display title (`"東京.md"` → `"東京"`).
pub fn title_for(local_name: &str) -> String {
    match local_name.rfind('.') {
        Some(idx) if idx > 0 => local_name[..idx].to_string(),
        _ => local_name.to_string(),
    }
}

/// How a [`StoreReference`] came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOrigin {
    /// An existing store supplied by the caller.
    Reused,
    /// A store created during this run; the caller should persist its name.
    Created,
}

/// Identifies the remote store every operation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReference {
    pub name: String,
    pub origin: StoreOrigin,
}

impl StoreReference {
    pub fn reused(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: StoreOrigin::Reused,
        }
    }

    pub fn created(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: StoreOrigin::Created,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for StoreReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A document as reported by the remote store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDocument {
    pub handle: String,
    pub display_name: Option<String>,
    pub size_bytes: Option<u64>,
}

/// Per-document synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentState {
    /// No record exists yet.
    New,
    /// A record exists but no upload has completed.
    PendingUpload,
    /// Uploaded, but the local content changed since.
    Stale,
    /// Uploaded and unchanged.
    UpToDate,
}

impl DocumentState {
    pub fn needs_upload(self) -> bool {
        !matches!(self, DocumentState::UpToDate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentState::New => "NEW",
            DocumentState::PendingUpload => "PENDING_UPLOAD",
            DocumentState::Stale => "STALE",
            DocumentState::UpToDate => "UP_TO_DATE",
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Incremental,
    /// Delete every remote document and clear the table before syncing.
    Reset,
}

/// A document scheduled for upload, with the state that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedUpload {
    pub local_name: String,
    pub safe_id: String,
    pub state: DocumentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedDocument {
    pub local_name: String,
    pub safe_id: String,
    pub remote_handle: String,
    /// State the document was in before this upload.
    pub state: DocumentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub local_name: String,
    pub safe_id: String,
    pub reason: String,
}

/// Outcome of one synchronization run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub store: String,
    pub mode: SyncMode,
    pub dry_run: bool,
    /// Local documents found in the corpus directory.
    pub discovered: usize,
    /// Documents skipped because they were already up to date.
    pub up_to_date: usize,
    pub planned: Vec<PlannedUpload>,
    pub uploaded: Vec<UploadedDocument>,
    pub failures: Vec<SyncFailure>,
    /// Remote documents unknown to the mapping table. Reported, never deleted.
    pub orphaned_remote: Vec<RemoteDocument>,
    /// Records whose local file no longer exists.
    pub missing_local: Vec<String>,
    /// Corpus files that cannot be tracked because their names are not
    /// valid UTF-8.
    pub skipped_local: Vec<String>,
    /// Records whose remote document vanished and were re-uploaded.
    pub repaired: Vec<String>,
    /// Remote documents deleted by reset mode.
    pub deleted_remote: usize,
}

impl SyncReport {
    pub fn new(store: impl Into<String>, mode: SyncMode, dry_run: bool) -> Self {
        Self {
            store: store.into(),
            mode,
            dry_run,
            discovered: 0,
            up_to_date: 0,
            planned: Vec::new(),
            uploaded: Vec::new(),
            failures: Vec::new(),
            orphaned_remote: Vec::new(),
            missing_local: Vec::new(),
            skipped_local: Vec::new(),
            repaired: Vec::new(),
            deleted_remote: 0,
        }
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploaded.len()
    }

    /// Some documents failed while others may have succeeded.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Where a citation points to, after reverse lookup in the mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CitationSource {
    Resolved { local_name: String, title: String },
    /// The remote identifier has no mapping entry (drift).
    UnresolvedSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    /// Remote-side identifier as returned by the service.
    pub reference: String,
    pub excerpt: Option<String>,
    pub source: CitationSource,
}

impl Citation {
    /// The original filename, or `CitationUnresolved` if the reference is unknown.
    pub fn local_name(&self) -> Result<&str, SyncError> {
        match &self.source {
            CitationSource::Resolved { local_name, .. } => Ok(local_name),
            CitationSource::UnresolvedSource => {
                Err(SyncError::CitationUnresolved(self.reference.clone()))
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.source, CitationSource::Resolved { .. })
    }
}

/// A grounded answer with attributed citations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
}

/// One row of the file listing: a mapping record joined with the live
/// remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub local_name: String,
    pub safe_id: String,
    pub title: String,
    pub remote_handle: Option<String>,
    pub size_bytes: u64,
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Whether the handle appears in the live remote listing.
    pub remote_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StoreStatus {
    NotConfigured,
    Active,
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreInfo {
    pub store: Option<String>,
    pub display_name: Option<String>,
    pub status: StoreStatus,
    /// Records in the mapping table.
    pub tracked: usize,
    /// Records with a remote handle.
    pub uploaded: usize,
    pub remote_documents: Option<usize>,
    pub orphaned: Option<usize>,
}
