//! Corpus synchronization.
//!
//! Brings a remote store in line with a local directory:
//!
//! 1. Scan the corpus and assign every document a safe id. Any collision
//!    aborts the run before the remote store is touched.
//! 2. Check the mapping table is bound to the target store (reset rebinds).
//! 3. List the store. In reset mode delete every remote document and clear
//!    the table; otherwise report remote documents the table does not know
//!    as orphans (they are never deleted).
//! 4. Classify each document as `NEW`, `PENDING_UPLOAD`, `STALE` or
//!    `UP_TO_DATE` from its content fingerprint, its record and the live
//!    listing. A record whose handle vanished remotely is uploaded again.
//! 5. Persist records for new documents (without handles), then upload
//!    everything that is not up to date on a bounded worker pool. Each
//!    success is persisted before the worker releases its slot.
//!
//! A failed upload is recorded in the report and the run carries on; only
//! collisions, store problems and mapping I/O errors abort it. Because every
//! completed upload is on disk, an interrupted or partial run is safe to
//! re-run.

use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use wikirag_core::fingerprint::content_fingerprint;
use wikirag_core::models::{
    DocumentRecord, DocumentState, PlannedUpload, StoreOrigin, StoreReference, SyncFailure,
    SyncMode, SyncReport, UploadedDocument,
};
use wikirag_core::normalize::assign_safe_ids;
use wikirag_core::{MappingTable, SyncError};

use crate::config::{Config, CorpusConfig, Credential, Settings};
use crate::corpus::{self, LocalDocument};
use crate::gateway::{self, RemoteStoreGateway};
use crate::mapping_store::MappingStore;
use crate::progress::{NoProgress, ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::prompt;

/// One document scheduled for upload.
struct UploadJob {
    doc: LocalDocument,
    safe_id: String,
    state: DocumentState,
    drifted: bool,
    previous_handle: Option<String>,
}

enum Outcome {
    Uploaded {
        doc: UploadedDocument,
        drifted: bool,
    },
    Failed(SyncFailure),
}

pub struct Synchronizer {
    gateway: Arc<RemoteStoreGateway>,
    mapping: Arc<Mutex<MappingStore>>,
    corpus: CorpusConfig,
    max_parallel: usize,
    progress: Box<dyn SyncProgressReporter>,
}

impl Synchronizer {
    pub fn new(gateway: Arc<RemoteStoreGateway>, mapping: MappingStore, corpus: CorpusConfig) -> Self {
        Self {
            gateway,
            mapping: Arc::new(Mutex::new(mapping)),
            corpus,
            max_parallel: 2,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Shared handle to the mapping store.
    pub fn mapping(&self) -> Arc<Mutex<MappingStore>> {
        self.mapping.clone()
    }

    /// Pick the store to sync against: `explicit` if given, else the store the
    /// mapping table is bound to, else a newly created one.
    pub async fn resolve_store(&self, explicit: Option<&str>) -> Result<StoreReference, SyncError> {
        let recorded = self.mapping.lock().await.table().store().map(String::from);
        self.gateway
            .create_or_reuse_store(explicit.or(recorded.as_deref()))
            .await
    }

    /// Synchronize `local_directory` into `store`.
    pub async fn sync(
        &self,
        local_directory: &Path,
        store: &StoreReference,
        mode: SyncMode,
        dry_run: bool,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::new(store.as_str(), mode, dry_run);

        self.progress.report(SyncProgressEvent::Discovering {
            root: local_directory.display().to_string(),
        });
        let scan = corpus::scan_corpus(local_directory, &self.corpus)?;
        let docs = scan.documents;
        report.discovered = docs.len();
        report.skipped_local = scan.skipped;
        let safe_ids = assign_safe_ids(docs.iter().map(|d| d.local_name.as_str()))?;

        let jobs = {
            let mut mapping = self.mapping.lock().await;

            if let Some(bound) = mapping.table().store() {
                if bound != store.as_str() && mode != SyncMode::Reset {
                    return Err(SyncError::StoreMismatch {
                        bound: bound.to_string(),
                        requested: store.to_string(),
                    });
                }
            }

            let live = self.gateway.list(store).await?;

            let table = match mode {
                SyncMode::Reset => {
                    report.deleted_remote = live.len();
                    if !dry_run {
                        info!(store = %store, documents = live.len(), "reset: deleting remote documents");
                        for doc in &live {
                            self.gateway.delete(store, &doc.handle).await?;
                        }
                        mapping.clear()?;
                        mapping.bind_store(store.as_str())?;
                    }
                    MappingTable::new()
                }
                SyncMode::Incremental => {
                    for (local_name, safe_id) in &safe_ids {
                        mapping.table().check_safe_id(local_name, safe_id)?;
                    }
                    report.orphaned_remote = mapping.table().orphans(&live);
                    if !report.orphaned_remote.is_empty() {
                        warn!(
                            count = report.orphaned_remote.len(),
                            "remote documents not in the mapping table (left untouched)"
                        );
                    }
                    if !dry_run {
                        mapping.bind_store(store.as_str())?;
                    }
                    mapping.snapshot()
                }
            };

            let live_handles: HashSet<String> = live.into_iter().map(|d| d.handle).collect();
            let live_handles = (mode == SyncMode::Incremental).then_some(&live_handles);

            let local_names: HashSet<&str> = docs.iter().map(|d| d.local_name.as_str()).collect();
            report.missing_local = table
                .records()
                .filter(|r| !local_names.contains(r.local_name.as_str()))
                .map(|r| r.local_name.clone())
                .collect();

            let mut jobs = Vec::new();
            let mut new_records = Vec::new();
            for doc in &docs {
                let Some(safe_id) = safe_ids.get(&doc.local_name) else {
                    continue;
                };
                let content = match doc.read() {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(local_name = %doc.local_name, "{}", e);
                        report.failures.push(SyncFailure {
                            local_name: doc.local_name.clone(),
                            safe_id: safe_id.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };
                let fingerprint = content_fingerprint(&content);
                let class = table.classify(&doc.local_name, &fingerprint, live_handles);

                if !class.state.needs_upload() {
                    report.up_to_date += 1;
                    continue;
                }
                debug!(local_name = %doc.local_name, state = %class.state, drifted = class.drifted, "scheduled");

                if class.state == DocumentState::New {
                    new_records.push(DocumentRecord::discovered(
                        &doc.local_name,
                        safe_id,
                        fingerprint,
                        doc.size_bytes,
                    ));
                }
                report.planned.push(PlannedUpload {
                    local_name: doc.local_name.clone(),
                    safe_id: safe_id.clone(),
                    state: class.state,
                });
                jobs.push(UploadJob {
                    doc: doc.clone(),
                    safe_id: safe_id.clone(),
                    state: class.state,
                    drifted: class.drifted,
                    previous_handle: table
                        .get(&doc.local_name)
                        .and_then(|r| r.remote_handle.clone()),
                });
            }

            self.progress.report(SyncProgressEvent::Planned {
                pending: jobs.len() as u64,
                up_to_date: report.up_to_date as u64,
            });

            if dry_run {
                return Ok(report);
            }
            if !new_records.is_empty() {
                mapping.upsert_all(new_records)?;
            }
            jobs
        };

        self.upload_all(store, jobs, &mut report).await?;

        report.uploaded.sort_by(|a, b| a.local_name.cmp(&b.local_name));
        report.failures.sort_by(|a, b| a.local_name.cmp(&b.local_name));
        report.repaired.sort();

        info!(
            store = %store,
            uploaded = report.uploaded.len(),
            failed = report.failures.len(),
            up_to_date = report.up_to_date,
            "sync finished"
        );
        Ok(report)
    }

    async fn upload_all(
        &self,
        store: &StoreReference,
        jobs: Vec<UploadJob>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let total = jobs.len() as u64;
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();

        for job in jobs {
            let semaphore = semaphore.clone();
            let gateway = self.gateway.clone();
            let mapping = self.mapping.clone();
            let store = store.clone();
            tasks.spawn(async move {
                // Held until the record is persisted.
                let _permit = semaphore.acquire_owned().await;
                upload_one(&gateway, &mapping, &store, job).await
            });
        }

        let mut done = 0u64;
        while let Some(joined) = tasks.join_next().await {
            done += 1;
            self.progress
                .report(SyncProgressEvent::Uploading { n: done, total });
            match joined {
                Ok(Ok(Outcome::Uploaded { doc, drifted })) => {
                    if drifted {
                        report.repaired.push(doc.local_name.clone());
                    }
                    report.uploaded.push(doc);
                }
                Ok(Ok(Outcome::Failed(failure))) => report.failures.push(failure),
                Ok(Err(fatal)) => {
                    tasks.abort_all();
                    return Err(fatal);
                }
                Err(join_err) if join_err.is_panic() => {
                    std::panic::resume_unwind(join_err.into_panic())
                }
                Err(join_err) => debug!("upload task cancelled: {}", join_err),
            }
        }
        Ok(())
    }
}

/// Upload one document and persist its record. `Err` is reserved for errors
/// that must stop the run.
async fn upload_one(
    gateway: &RemoteStoreGateway,
    mapping: &Mutex<MappingStore>,
    store: &StoreReference,
    job: UploadJob,
) -> Result<Outcome, SyncError> {
    let failed = |reason: String| {
        Outcome::Failed(SyncFailure {
            local_name: job.doc.local_name.clone(),
            safe_id: job.safe_id.clone(),
            reason,
        })
    };

    // Fingerprint the bytes actually sent; the file may have changed since planning.
    let content = match job.doc.read() {
        Ok(content) => content,
        Err(e) => return Ok(failed(e.to_string())),
    };
    let fingerprint = content_fingerprint(&content);

    let handle = match gateway.upload(store, &job.safe_id, &content).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(local_name = %job.doc.local_name, "{}", e);
            return Ok(failed(e.to_string()));
        }
    };

    {
        let mut mapping = mapping.lock().await;
        let mut record = mapping.get(&job.doc.local_name).cloned().unwrap_or_else(|| {
            DocumentRecord::discovered(
                &job.doc.local_name,
                &job.safe_id,
                fingerprint.clone(),
                job.doc.size_bytes,
            )
        });
        record.safe_id = job.safe_id.clone();
        record.remote_handle = Some(handle.clone());
        record.content_fingerprint = fingerprint;
        record.size_bytes = content.len() as u64;
        record.uploaded_at = Some(Utc::now());
        mapping.upsert(record)?;
    }
    debug!(local_name = %job.doc.local_name, %handle, "uploaded");

    if job.state == DocumentState::Stale {
        if let Some(old) = job.previous_handle.as_deref().filter(|old| *old != handle) {
            if let Err(e) = gateway.delete(store, old).await {
                warn!(local_name = %job.doc.local_name, handle = old, "could not delete superseded document: {}", e);
            }
        }
    }

    Ok(Outcome::Uploaded {
        doc: UploadedDocument {
            local_name: job.doc.local_name.clone(),
            safe_id: job.safe_id.clone(),
            remote_handle: handle,
            state: job.state,
        },
        drifted: job.drifted,
    })
}

// ============ CLI ============


/// Options of `wikirag sync`.
pub struct SyncArgs {
    pub data_dir: Option<PathBuf>,
    pub reset: bool,
    pub yes: bool,
    pub dry_run: bool,
    pub progress: ProgressMode,
}

pub async fn run_sync(config: &Config, args: SyncArgs) -> Result<()> {
    let credential = Credential::from_env(&config.api.api_key_env)?;
    let mut settings = Settings::new(config, credential, args.reset);
    if let Some(dir) = args.data_dir {
        settings.local_directory = dir;
    }

    if settings.reset && !args.dry_run && !args.yes {
        let question = "Reset deletes every document in the store and re-uploads the corpus. Continue? (y/N)";
        if !prompt::confirm(question, &["y", "Y", "yes"])? {
            println!("cancelled");
            return Ok(());
        }
    }

    let gateway = Arc::new(
        gateway::connect(config, settings.credential.clone())?
            .with_upload_timeout(settings.upload_timeout),
    );
    let mapping = MappingStore::open(&config.corpus.mapping_file)?;
    let mapping_path = mapping.path().to_path_buf();

    if args.dry_run && settings.store_reference.is_none() && mapping.table().store().is_none() {
        bail!("No store configured yet; run without --dry-run once, or set STORE_NAME");
    }

    let synchronizer = Synchronizer::new(gateway, mapping, config.corpus.clone())
        .with_max_parallel(settings.max_parallel_uploads)
        .with_progress(args.progress.reporter());

    let store = synchronizer
        .resolve_store(settings.store_reference.as_deref())
        .await?;
    let mode = if settings.reset {
        SyncMode::Reset
    } else {
        SyncMode::Incremental
    };

    let report = tokio::select! {
        result = synchronizer.sync(&settings.local_directory, &store, mode, args.dry_run) => {
            result.with_context(|| format!("sync of {} failed", settings.local_directory.display()))?
        }
        _ = tokio::signal::ctrl_c() => {
            bail!(
                "interrupted; completed uploads are recorded in {}",
                mapping_path.display()
            );
        }
    };

    print!("{}", format_report(&report, &store));

    if report.is_partial() {
        bail!(
            "{} document(s) could not be synced; re-run sync to retry them",
            report.failures.len()
        );
    }
    Ok(())
}

fn format_report(report: &SyncReport, store: &StoreReference) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_report(&mut out, report, store);
    out
}

fn write_report(out: &mut String, report: &SyncReport, store: &StoreReference) -> fmt::Result {
    if report.dry_run {
        writeln!(out, "sync {} (dry-run)", report.store)?;
    } else {
        writeln!(out, "sync {}", report.store)?;
    }
    writeln!(out, "  mode: {}", match report.mode {
        SyncMode::Incremental => "incremental",
        SyncMode::Reset => "reset",
    })?;
    writeln!(out, "  discovered: {}", report.discovered)?;
    writeln!(out, "  up to date: {}", report.up_to_date)?;
    if report.mode == SyncMode::Reset {
        let verb = if report.dry_run { "would delete" } else { "deleted" };
        writeln!(out, "  {} remote documents: {}", verb, report.deleted_remote)?;
    }
    if report.dry_run {
        writeln!(out, "  planned uploads: {}", report.planned.len())?;
        for planned in &report.planned {
            writeln!(out, "    {:<14} {}", planned.state, planned.local_name)?;
        }
    } else {
        writeln!(out, "  uploaded: {}", report.uploaded_count())?;
        writeln!(out, "  failed: {}", report.failures.len())?;
    }
    for failure in &report.failures {
        writeln!(out, "    ✗ {} ({}): {}", failure.local_name, failure.safe_id, failure.reason)?;
    }
    if !report.repaired.is_empty() {
        writeln!(out, "  repaired: {}", report.repaired.len())?;
    }
    if !report.skipped_local.is_empty() {
        writeln!(out, "  skipped (name is not valid UTF-8): {}", report.skipped_local.len())?;
        for name in &report.skipped_local {
            writeln!(out, "    {}", name)?;
        }
    }
    if !report.missing_local.is_empty() {
        writeln!(out, "  missing locally: {}", report.missing_local.len())?;
        for name in &report.missing_local {
            writeln!(out, "    {}", name)?;
        }
    }
    if !report.orphaned_remote.is_empty() {
        writeln!(out, "  orphaned remote documents: {}", report.orphaned_remote.len())?;
        for doc in &report.orphaned_remote {
            writeln!(
                out,
                "    {} ({})",
                doc.handle,
                doc.display_name.as_deref().unwrap_or("-")
            )?;
        }
    }
    if store.origin == StoreOrigin::Created {
        writeln!(out, "  new store created; to reuse it elsewhere set:")?;
        writeln!(out, "    STORE_NAME={}", store.name)?;
    }
    if !report.is_partial() {
        writeln!(out, "ok")?;
    }
    Ok(())
}
