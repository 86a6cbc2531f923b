//! Grounded question answering and read-only store views.
//!
//! The [`QueryEngine`] delegates generation to the remote store and then
//! maps each citation back to the local document it came from, using the
//! mapping table's reverse lookup (by remote handle, then by safe id).
//! Citations the table cannot resolve are kept and marked
//! [`CitationSource::UnresolvedSource`] rather than dropped.
//!
//! The engine only reads a snapshot of the mapping table; it never writes.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::warn;

use wikirag_core::models::{
    Answer, Citation, CitationSource, FileEntry, StoreInfo, StoreReference, StoreStatus,
};
use wikirag_core::{MappingTable, SyncError};

use crate::config::{Config, Credential};
use crate::gateway::{self, RemoteStoreGateway};
use crate::mapping_store;
use crate::service::GroundingChunk;

pub struct QueryEngine {
    gateway: Arc<RemoteStoreGateway>,
    table: MappingTable,
    max_citations: usize,
}

impl QueryEngine {
    pub fn new(gateway: Arc<RemoteStoreGateway>, table: MappingTable) -> Self {
        Self {
            gateway,
            table,
            max_citations: 5,
        }
    }

    pub fn with_max_citations(mut self, max_citations: usize) -> Self {
        self.max_citations = max_citations.max(1);
        self
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Ask `question` against `store` and attribute the answer's citations.
    pub async fn ask(&self, store: &StoreReference, question: &str) -> Result<Answer, SyncError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(SyncError::GenerationFailed("question is empty".to_string()));
        }
        let grounded = self.gateway.generate(store, question).await?;
        Ok(Answer {
            text: grounded.text,
            citations: resolve_citations(&self.table, &grounded.chunks, self.max_citations),
        })
    }

    /// Every mapping record joined with the live listing of `store`.
    pub async fn list_files_in_store(
        &self,
        store: &StoreReference,
    ) -> Result<Vec<FileEntry>, SyncError> {
        let live = self.gateway.list(store).await?;
        let handles: HashSet<&str> = live.iter().map(|d| d.handle.as_str()).collect();

        Ok(self
            .table
            .records()
            .map(|r| FileEntry {
                local_name: r.local_name.clone(),
                safe_id: r.safe_id.clone(),
                title: r.title.clone(),
                remote_handle: r.remote_handle.clone(),
                size_bytes: r.size_bytes,
                uploaded_at: r.uploaded_at,
                remote_present: r
                    .remote_handle
                    .as_deref()
                    .is_some_and(|h| handles.contains(h)),
            })
            .collect())
    }

    /// Store info when no store is configured; needs no service.
    pub fn offline_info(table: &MappingTable) -> StoreInfo {
        StoreInfo {
            store: None,
            display_name: None,
            status: StoreStatus::NotConfigured,
            tracked: table.len(),
            uploaded: table.uploaded_count(),
            remote_documents: None,
            orphaned: None,
        }
    }

    /// Summary of the store and the table. Never fails: an unreachable store
    /// is reported in the status.
    pub async fn get_store_info(&self, store: Option<&StoreReference>) -> StoreInfo {
        let mut info = Self::offline_info(&self.table);
        let Some(store) = store else {
            return info;
        };
        info.store = Some(store.name.clone());

        let summary = match self.gateway.get_store(store.as_str()).await {
            Ok(summary) => summary,
            Err(e) => {
                info.status = StoreStatus::Unreachable(e.to_string());
                return info;
            }
        };
        info.display_name = summary.display_name;

        match self.gateway.list(store).await {
            Ok(live) => {
                info.orphaned = Some(self.table.orphans(&live).len());
                info.remote_documents = Some(live.len());
                info.status = StoreStatus::Active;
            }
            Err(e) => info.status = StoreStatus::Unreachable(e.to_string()),
        }
        info
    }
}

/// Deduplicate grounding chunks by reference (first occurrence wins), keep at
/// most `max` of them and reverse-map each to its local document.
pub fn resolve_citations(
    table: &MappingTable,
    chunks: &[GroundingChunk],
    max: usize,
) -> Vec<Citation> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|chunk| seen.insert(chunk.reference.as_str()))
        .take(max)
        .map(|chunk| {
            let source = match table.find_by_remote(&chunk.reference) {
                Some(record) => CitationSource::Resolved {
                    local_name: record.local_name.clone(),
                    title: record.title.clone(),
                },
                None => {
                    warn!(reference = %chunk.reference, "citation has no mapping entry");
                    CitationSource::UnresolvedSource
                }
            };
            Citation {
                reference: chunk.reference.clone(),
                excerpt: chunk.excerpt.clone(),
                source,
            }
        })
        .collect()
}

/// The store the CLI should read from: `[store] name` / `STORE_NAME`, else
/// the store the mapping table is bound to.
pub fn configured_store(config: &Config, table: &MappingTable) -> Option<StoreReference> {
    config
        .store
        .name
        .as_deref()
        .or(table.store())
        .map(StoreReference::reused)
}

fn engine(config: &Config, table: MappingTable) -> Result<QueryEngine> {
    let credential = Credential::from_env(&config.api.api_key_env)?;
    let gateway = Arc::new(gateway::connect(config, credential)?);
    Ok(QueryEngine::new(gateway, table).with_max_citations(config.generation.max_citations))
}

// ============ CLI ============

pub async fn run_ask(config: &Config, question: &str, json: bool) -> Result<()> {
    let table = mapping_store::load(&config.corpus.mapping_file)?;
    let Some(store) = configured_store(config, &table) else {
        bail!("No store configured. Run `wikirag sync` first or set STORE_NAME.");
    };
    let engine = engine(config, table)?;
    let answer = engine.ask(&store, question).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!("{}", answer.text.trim_end());
    if !answer.citations.is_empty() {
        println!();
        println!("Sources:");
        for (i, citation) in answer.citations.iter().enumerate() {
            match &citation.source {
                CitationSource::Resolved { local_name, title } => {
                    println!("  {}. {} ({})", i + 1, title, local_name)
                }
                CitationSource::UnresolvedSource => {
                    println!("  {}. [unresolved] {}", i + 1, citation.reference)
                }
            }
        }
    }
    Ok(())
}

pub async fn run_files(config: &Config) -> Result<()> {
    let table = mapping_store::load(&config.corpus.mapping_file)?;
    if table.is_empty() {
        println!("No documents tracked in {}.", config.corpus.mapping_file.display());
        return Ok(());
    }
    let Some(store) = configured_store(config, &table) else {
        bail!("No store configured. Run `wikirag sync` first or set STORE_NAME.");
    };
    let entries = engine(config, table)?.list_files_in_store(&store).await?;

    println!(
        "{:<32} {:<40} {:>10}  {:<20} REMOTE",
        "LOCAL NAME", "SAFE ID", "SIZE", "UPLOADED"
    );
    for entry in &entries {
        let uploaded = entry
            .uploaded_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let remote = match (&entry.remote_handle, entry.remote_present) {
            (None, _) => "pending",
            (Some(_), true) => "present",
            (Some(_), false) => "missing",
        };
        println!(
            "{:<32} {:<40} {:>10}  {:<20} {}",
            entry.local_name, entry.safe_id, entry.size_bytes, uploaded, remote
        );
    }
    println!("total: {}", entries.len());
    Ok(())
}

pub async fn run_info(config: &Config) -> Result<()> {
    let table = mapping_store::load(&config.corpus.mapping_file)?;
    let store = configured_store(config, &table);

    let info = match &store {
        // No credential is needed to say nothing is configured.
        None => QueryEngine::offline_info(&table),
        Some(store) => engine(config, table)?.get_store_info(Some(store)).await,
    };

    let status = match &info.status {
        StoreStatus::NotConfigured => "not_configured".to_string(),
        StoreStatus::Active => "active".to_string(),
        StoreStatus::Unreachable(reason) => format!("unreachable ({})", reason),
    };
    println!("store: {}", info.store.as_deref().unwrap_or("-"));
    println!("  display name: {}", info.display_name.as_deref().unwrap_or("-"));
    println!("  status: {}", status);
    println!("  mapping file: {}", config.corpus.mapping_file.display());
    println!("  tracked documents: {}", info.tracked);
    println!("  uploaded documents: {}", info.uploaded);
    if let Some(n) = info.remote_documents {
        println!("  remote documents: {}", n);
    }
    if let Some(n) = info.orphaned {
        println!("  orphaned remote documents: {}", n);
    }
    println!("  model: {}", config.generation.model);
    Ok(())
}
