//! In-process [`SearchService`] for tests.
//!
//! Stores live in a `BTreeMap` behind a `std::sync::Mutex`, so listings come
//! back in a stable order and pages are cut deterministically. Faults can be
//! injected per call:
//!
//! - [`InMemoryService::fail_next_uploads`]: the next `n` uploads fail transiently.
//! - [`InMemoryService::reject`]: uploads of one safe id are rejected permanently.
//! - [`InMemoryService::stall_uploads_after`]: after `k` successful uploads,
//!   further uploads never complete.
//! - [`InMemoryService::fail_listing`]: document listings fail transiently.
//!
//! Grounded generation returns the scripted answer if one was set, otherwise
//! it cites every document whose content contains the question.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use wikirag_core::models::RemoteDocument;

use super::{
    GroundedAnswer, GroundingChunk, Page, SearchService, ServiceError, StoreSummary,
};

struct MemDocument {
    display_name: String,
    content: Vec<u8>,
}

struct MemStore {
    display_name: String,
    documents: BTreeMap<String, MemDocument>,
}

#[derive(Default)]
struct Faults {
    transient_uploads: usize,
    rejected: HashSet<String>,
    stall_after: Option<usize>,
    listing_down: bool,
}

pub struct InMemoryService {
    stores: Mutex<BTreeMap<String, MemStore>>,
    faults: Mutex<Faults>,
    answer: Mutex<Option<GroundedAnswer>>,
    page_size: usize,
    next_id: AtomicUsize,
    upload_calls: AtomicUsize,
    completed_uploads: AtomicUsize,
    delete_calls: AtomicUsize,
    stalled: Notify,
}

impl InMemoryService {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            answer: Mutex::new(None),
            page_size: 20,
            next_id: AtomicUsize::new(1),
            upload_calls: AtomicUsize::new(0),
            completed_uploads: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            stalled: Notify::new(),
        }
    }

    /// Listings return at most `page_size` items per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Create a store directly, bypassing the call counters.
    pub fn seed_store(&self, display_name: &str) -> String {
        let name = self.new_store_name(display_name);
        self.lock_stores().insert(
            name.clone(),
            MemStore {
                display_name: display_name.to_string(),
                documents: BTreeMap::new(),
            },
        );
        name
    }

    /// Insert a document directly, as if uploaded by another client.
    pub fn seed_document(&self, store: &str, display_name: &str, content: &[u8]) -> Option<String> {
        let handle = self.new_handle(store, display_name);
        let mut stores = self.lock_stores();
        let s = stores.get_mut(store)?;
        s.documents.insert(
            handle.clone(),
            MemDocument {
                display_name: display_name.to_string(),
                content: content.to_vec(),
            },
        );
        Some(handle)
    }

    /// Remove a document behind the client's back.
    pub fn drop_document(&self, store: &str, handle: &str) -> bool {
        self.lock_stores()
            .get_mut(store)
            .is_some_and(|s| s.documents.remove(handle).is_some())
    }

    pub fn fail_next_uploads(&self, n: usize) {
        self.lock_faults().transient_uploads = n;
    }

    pub fn reject(&self, safe_id: &str) {
        self.lock_faults().rejected.insert(safe_id.to_string());
    }

    pub fn stall_uploads_after(&self, completed: usize) {
        self.lock_faults().stall_after = Some(completed);
    }

    /// Lift a stall set by [`InMemoryService::stall_uploads_after`]. Uploads
    /// already stalled stay stuck.
    pub fn resume_uploads(&self) {
        self.lock_faults().stall_after = None;
    }

    pub fn fail_listing(&self, down: bool) {
        self.lock_faults().listing_down = down;
    }

    pub fn set_answer(&self, answer: GroundedAnswer) {
        *self.answer.lock().unwrap_or_else(|e| e.into_inner()) = Some(answer);
    }

    /// Resolves once an upload has stalled.
    pub async fn wait_for_stall(&self) {
        self.stalled.notified().await;
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn completed_uploads(&self) -> usize {
        self.completed_uploads.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn document_count(&self, store: &str) -> usize {
        self.lock_stores()
            .get(store)
            .map(|s| s.documents.len())
            .unwrap_or(0)
    }

    /// Content of a stored document, looked up by handle.
    pub fn document_content(&self, store: &str, handle: &str) -> Option<Vec<u8>> {
        self.lock_stores()
            .get(store)?
            .documents
            .get(handle)
            .map(|d| d.content.clone())
    }

    pub fn store_names(&self) -> Vec<String> {
        self.lock_stores().keys().cloned().collect()
    }

    fn lock_stores(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemStore>> {
        self.stores.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn new_store_name(&self, display_name: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("fileSearchStores/{}-{:04}", resource_slug(display_name), n)
    }

    fn new_handle(&self, store: &str, safe_id: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}/documents/{}-{:04}", store, resource_slug(safe_id), n)
    }

    fn page<T: Clone>(&self, items: &[T], page_token: Option<&str>) -> Result<Page<T>, ServiceError> {
        let start = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ServiceError::Permanent(format!("bad page token '{}'", token)))?,
        };
        let end = (start + self.page_size).min(items.len());
        let items_page = items.get(start..end).unwrap_or_default().to_vec();
        let next_page_token = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: items_page,
            next_page_token,
        })
    }
}

impl Default for InMemoryService {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase alphanumerics and dashes, as the real service uses in resource ids.
fn resource_slug(s: &str) -> String {
    let slug: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "doc".to_string()
    } else {
        slug.chars().take(40).collect()
    }
}

#[async_trait]
impl SearchService for InMemoryService {
    async fn create_store(&self, display_name: &str) -> Result<StoreSummary, ServiceError> {
        let name = self.seed_store(display_name);
        Ok(StoreSummary {
            display_name: Some(display_name.to_string()),
            ..StoreSummary::named(name)
        })
    }

    async fn get_store(&self, store: &str) -> Result<StoreSummary, ServiceError> {
        let stores = self.lock_stores();
        let s = stores
            .get(store)
            .ok_or_else(|| ServiceError::NotFound(store.to_string()))?;
        Ok(StoreSummary {
            display_name: Some(s.display_name.clone()),
            active_documents: Some(s.documents.len() as u64),
            size_bytes: Some(s.documents.values().map(|d| d.content.len() as u64).sum()),
            ..StoreSummary::named(store)
        })
    }

    async fn list_stores(
        &self,
        page_token: Option<&str>,
    ) -> Result<Page<StoreSummary>, ServiceError> {
        let all: Vec<StoreSummary> = self
            .lock_stores()
            .iter()
            .map(|(name, s)| StoreSummary {
                display_name: Some(s.display_name.clone()),
                active_documents: Some(s.documents.len() as u64),
                ..StoreSummary::named(name.clone())
            })
            .collect();
        self.page(&all, page_token)
    }

    async fn delete_store(&self, store: &str) -> Result<(), ServiceError> {
        self.lock_stores()
            .remove(store)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(store.to_string()))
    }

    async fn upload_document(
        &self,
        store: &str,
        safe_id: &str,
        content: &[u8],
        _timeout: Duration,
    ) -> Result<String, ServiceError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);

        let stall = {
            let mut faults = self.lock_faults();
            if faults.rejected.contains(safe_id) {
                return Err(ServiceError::Permanent(format!(
                    "document '{}' rejected",
                    safe_id
                )));
            }
            if faults.transient_uploads > 0 {
                faults.transient_uploads -= 1;
                return Err(ServiceError::Transient("503 Service Unavailable".to_string()));
            }
            faults
                .stall_after
                .is_some_and(|k| self.completed_uploads.load(Ordering::SeqCst) >= k)
        };

        if stall {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }

        let handle = self.new_handle(store, safe_id);
        let mut stores = self.lock_stores();
        let s = stores
            .get_mut(store)
            .ok_or_else(|| ServiceError::NotFound(store.to_string()))?;
        s.documents.insert(
            handle.clone(),
            MemDocument {
                display_name: safe_id.to_string(),
                content: content.to_vec(),
            },
        );
        self.completed_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn list_documents(
        &self,
        store: &str,
        page_token: Option<&str>,
    ) -> Result<Page<RemoteDocument>, ServiceError> {
        if self.lock_faults().listing_down {
            return Err(ServiceError::Transient("listing unavailable".to_string()));
        }
        let docs: Vec<RemoteDocument> = {
            let stores = self.lock_stores();
            let s = stores
                .get(store)
                .ok_or_else(|| ServiceError::NotFound(store.to_string()))?;
            s.documents
                .iter()
                .map(|(handle, d)| RemoteDocument {
                    handle: handle.clone(),
                    display_name: Some(d.display_name.clone()),
                    size_bytes: Some(d.content.len() as u64),
                })
                .collect()
        };
        self.page(&docs, page_token)
    }

    async fn delete_document(&self, store: &str, handle: &str) -> Result<(), ServiceError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut stores = self.lock_stores();
        let s = stores
            .get_mut(store)
            .ok_or_else(|| ServiceError::NotFound(store.to_string()))?;
        s.documents
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(handle.to_string()))
    }

    async fn generate_grounded_answer(
        &self,
        store: &str,
        question: &str,
    ) -> Result<GroundedAnswer, ServiceError> {
        if let Some(answer) = self.answer.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(answer);
        }
        let stores = self.lock_stores();
        let s = stores
            .get(store)
            .ok_or_else(|| ServiceError::NotFound(store.to_string()))?;

        let needle = question.trim().to_lowercase();
        let chunks: Vec<GroundingChunk> = s
            .documents
            .iter()
            .filter_map(|(handle, d)| {
                let text = String::from_utf8_lossy(&d.content);
                text.to_lowercase().contains(&needle).then(|| GroundingChunk {
                    reference: handle.clone(),
                    excerpt: Some(text.chars().take(200).collect()),
                })
            })
            .collect();

        let text = if chunks.is_empty() {
            "I could not find this in the knowledge base.".to_string()
        } else {
            format!("Found {} matching document(s).", chunks.len())
        };
        Ok(GroundedAnswer { text, chunks })
    }
}
