//! Local corpus discovery.
//!
//! Walks the corpus root, applies include/exclude globs and returns the
//! documents sorted by name. Names are paths relative to the root with `/`
//! separators; for a flat directory of articles that is just the file name
//! (`東京.md`).

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use wikirag_core::SyncError;

use crate::config::CorpusConfig;

/// A document found on disk. Content is read on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDocument {
    pub local_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl LocalDocument {
    pub fn read(&self) -> Result<Vec<u8>, SyncError> {
        std::fs::read(&self.path).map_err(|e| SyncError::Corpus {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

/// Result of a corpus scan.
#[derive(Debug, Default)]
pub struct CorpusScan {
    pub documents: Vec<LocalDocument>,
    /// Matching files whose names are not valid UTF-8, shown lossily.
    pub skipped: Vec<String>,
}

/// Scan `root` using the globs from `corpus`.
pub fn scan_corpus(root: &Path, corpus: &CorpusConfig) -> Result<CorpusScan, SyncError> {
    let corpus_err = |reason: String| SyncError::Corpus {
        path: root.to_path_buf(),
        reason,
    };

    if !root.is_dir() {
        return Err(corpus_err("directory does not exist".to_string()));
    }

    let include_set = build_globset(&corpus.include_globs).map_err(corpus_err)?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
    default_excludes.extend(corpus.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes).map_err(corpus_err)?;

    let mut docs = Vec::new();
    let mut skipped = Vec::new();

    let walker = WalkDir::new(root).follow_links(corpus.follow_symlinks);
    for entry in walker {
        let entry = entry.map_err(|e| corpus_err(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        if relative.to_str().is_none() {
            tracing::warn!(path = %path.display(), "skipping file with a non-UTF-8 name");
            skipped.push(rel_str);
            continue;
        }

        let size_bytes = entry
            .metadata()
            .map_err(|e| corpus_err(e.to_string()))?
            .len();

        docs.push(LocalDocument {
            local_name: rel_str,
            path: path.to_path_buf(),
            size_bytes,
        });
    }

    docs.sort_by(|a, b| a.local_name.cmp(&b.local_name));
    skipped.sort();
    tracing::debug!(root = %root.display(), count = docs.len(), skipped = skipped.len(), "corpus scanned");

    Ok(CorpusScan {
        documents: docs,
        skipped,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, String> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| format!("invalid glob '{}': {}", pattern, e))?);
    }
    builder.build().map_err(|e| e.to_string())
}
