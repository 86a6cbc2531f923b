//! Error kinds raised by the synchronization and query subsystems.
//!
//! [`SyncError`] separates fatal conditions (the run cannot continue) from
//! per-document and per-citation conditions that are recorded and reported.
//! Use [`SyncError::is_fatal`] to tell them apart.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the normalizer, mapping table, gateway, synchronizer
/// and query engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Two distinct local names produced the same safe id.
    #[error("safe id collision: '{first}' and '{second}' both normalize to '{safe_id}'")]
    NormalizationCollision {
        safe_id: String,
        first: String,
        second: String,
    },

    /// The persisted mapping table exists but cannot be parsed.
    #[error("mapping file {} is corrupt: {reason}", path.display())]
    MappingCorrupt { path: PathBuf, reason: String },

    /// The mapping table file could not be read or written.
    #[error("mapping file {}: {source}", path.display())]
    MappingIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single document could not be uploaded after exhausting retries,
    /// or was permanently rejected by the service.
    #[error("upload of '{safe_id}' failed after {attempts} attempt(s): {reason}")]
    UploadFailed {
        safe_id: String,
        attempts: u32,
        reason: String,
    },

    /// The remote store cannot be created, found or listed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The mapping table belongs to a different store than the one requested.
    #[error(
        "mapping table is bound to store '{bound}', refusing to sync against '{requested}' \
         (run with --reset to rebind it)"
    )]
    StoreMismatch { bound: String, requested: String },

    /// A citation references a document the mapping table does not know.
    #[error("no mapping entry for cited document '{0}'")]
    CitationUnresolved(String),

    /// Grounded answer generation failed.
    #[error("answer generation failed: {0}")]
    GenerationFailed(String),

    /// The local corpus directory is missing or unreadable.
    #[error("corpus directory {}: {reason}", path.display())]
    Corpus { path: PathBuf, reason: String },
}

impl SyncError {
    /// Returns `true` for errors that abort a synchronization run.
    ///
    /// `UploadFailed` is recorded per document and `CitationUnresolved` is
    /// annotated on the answer; everything else stops the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SyncError::UploadFailed { .. } | SyncError::CitationUnresolved(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_and_citation_errors_are_not_fatal() {
        let upload = SyncError::UploadFailed {
            safe_id: "a.md".into(),
            attempts: 3,
            reason: "timeout".into(),
        };
        assert!(!upload.is_fatal());
        assert!(!SyncError::CitationUnresolved("x".into()).is_fatal());
    }

    #[test]
    fn collision_and_corruption_are_fatal() {
        let collision = SyncError::NormalizationCollision {
            safe_id: "doc~0000.md".into(),
            first: "a".into(),
            second: "b".into(),
        };
        assert!(collision.is_fatal());
        let corrupt = SyncError::MappingCorrupt {
            path: PathBuf::from("file_mappings.json"),
            reason: "expected value".into(),
        };
        assert!(corrupt.is_fatal());
        assert!(corrupt.to_string().contains("file_mappings.json"));
    }
}
