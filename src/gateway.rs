//! Resilience layer over a [`SearchService`].
//!
//! The gateway turns single-shot service calls into the operations the
//! synchronizer and query engine need:
//!
//! - every call is retried on transient failures according to a
//!   [`RetryPolicy`], sleeping between attempts;
//! - uploads run under a fixed per-attempt timeout;
//! - listings are exhausted across pages before returning;
//! - service errors are mapped onto [`SyncError`] kinds.
//!
//! Store creation is the one call that is never retried: a create that
//! timed out may still have succeeded, and retrying would leave a second,
//! empty store behind.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use wikirag_core::models::{RemoteDocument, StoreReference};
use wikirag_core::retry::{RetryDecision, RetryPolicy};
use wikirag_core::SyncError;

use crate::config::{Config, Credential};
use crate::service::gemini::GeminiFileSearch;
use crate::service::{GroundedAnswer, Page, SearchService, ServiceError, StoreSummary};

/// Gateway over the Gemini API, configured from `config`.
pub fn connect(config: &Config, credential: Credential) -> anyhow::Result<RemoteStoreGateway> {
    let service = Arc::new(GeminiFileSearch::new(config, credential)?);
    Ok(
        RemoteStoreGateway::new(service, config.upload.retry_policy(), config.upload.timeout())
            .with_display_name(config.store.display_name.clone()),
    )
}

/// A call that failed for good, with the number of attempts spent on it.
#[derive(Debug)]
struct Exhausted {
    error: ServiceError,
    attempts: u32,
}

pub struct RemoteStoreGateway {
    service: Arc<dyn SearchService>,
    retry: RetryPolicy,
    upload_timeout: Duration,
    display_name: String,
}

impl RemoteStoreGateway {
    pub fn new(service: Arc<dyn SearchService>, retry: RetryPolicy, upload_timeout: Duration) -> Self {
        Self {
            service,
            retry,
            upload_timeout,
            display_name: "wikipedia-knowledge-base".to_string(),
        }
    }

    /// Display name given to stores this gateway creates.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Per-attempt upload deadline, including operation polling.
    pub fn with_upload_timeout(mut self, upload_timeout: Duration) -> Self {
        self.upload_timeout = upload_timeout;
        self
    }

    pub fn service(&self) -> &Arc<dyn SearchService> {
        &self.service
    }

    /// Reuse `existing` if the service knows it, otherwise create a new store.
    ///
    /// A supplied name the service does not know is an error: silently
    /// creating a replacement would orphan every recorded handle.
    pub async fn create_or_reuse_store(
        &self,
        existing: Option<&str>,
    ) -> Result<StoreReference, SyncError> {
        match existing {
            Some(name) => {
                let store = self
                    .retrying("get store", None, || self.service.get_store(name))
                    .await
                    .map_err(|e| match e.error {
                        ServiceError::NotFound(_) => SyncError::StoreUnavailable(format!(
                            "store '{}' does not exist; unset it to create a new one",
                            name
                        )),
                        other => SyncError::StoreUnavailable(format!("{}: {}", name, other)),
                    })?;
                debug!(store = %store.name, "reusing store");
                Ok(StoreReference::reused(store.name))
            }
            None => {
                let store = self
                    .service
                    .create_store(&self.display_name)
                    .await
                    .map_err(|e| SyncError::StoreUnavailable(format!("create failed: {}", e)))?;
                info!(store = %store.name, display_name = %self.display_name, "created store");
                Ok(StoreReference::created(store.name))
            }
        }
    }

    /// Upload one document and return its remote handle.
    pub async fn upload(
        &self,
        store: &StoreReference,
        safe_id: &str,
        content: &[u8],
    ) -> Result<String, SyncError> {
        let timeout = self.upload_timeout;
        self.retrying("upload", Some(timeout), || {
            self.service
                .upload_document(store.as_str(), safe_id, content, timeout)
        })
        .await
        .map_err(|e| SyncError::UploadFailed {
            safe_id: safe_id.to_string(),
            attempts: e.attempts,
            reason: e.error.to_string(),
        })
    }

    /// Every document in the store, across all pages.
    pub async fn list(&self, store: &StoreReference) -> Result<Vec<RemoteDocument>, SyncError> {
        self.exhaust("list documents", |token| {
            let token = token.map(String::from);
            async move {
                self.service
                    .list_documents(store.as_str(), token.as_deref())
                    .await
            }
        })
        .await
        .map_err(|e| SyncError::StoreUnavailable(format!("{}: {}", store, e)))
    }

    /// Delete one document. A document that is already gone counts as deleted.
    pub async fn delete(&self, store: &StoreReference, handle: &str) -> Result<(), SyncError> {
        match self
            .retrying("delete document", None, || {
                self.service.delete_document(store.as_str(), handle)
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(Exhausted {
                error: ServiceError::NotFound(_),
                ..
            }) => {
                debug!(%handle, "document already deleted");
                Ok(())
            }
            Err(e) => Err(SyncError::StoreUnavailable(format!(
                "delete of '{}' failed: {}",
                handle, e.error
            ))),
        }
    }

    pub async fn get_store(&self, name: &str) -> Result<StoreSummary, SyncError> {
        self.retrying("get store", None, || self.service.get_store(name))
            .await
            .map_err(|e| SyncError::StoreUnavailable(format!("{}: {}", name, e.error)))
    }

    /// Every store visible to the credential.
    pub async fn list_stores(&self) -> Result<Vec<StoreSummary>, SyncError> {
        self.exhaust("list stores", |token| {
            let token = token.map(String::from);
            async move { self.service.list_stores(token.as_deref()).await }
        })
        .await
        .map_err(|e| SyncError::StoreUnavailable(e.to_string()))
    }

    /// Delete a store and all of its documents.
    pub async fn delete_store(&self, store: &StoreReference) -> Result<(), SyncError> {
        self.retrying("delete store", None, || {
            self.service.delete_store(store.as_str())
        })
        .await
        .map_err(|e| SyncError::StoreUnavailable(format!("{}: {}", store, e.error)))
    }

    /// Grounded generation against `store`.
    pub async fn generate(
        &self,
        store: &StoreReference,
        question: &str,
    ) -> Result<GroundedAnswer, SyncError> {
        self.retrying("generate", None, || {
            self.service
                .generate_grounded_answer(store.as_str(), question)
        })
        .await
        .map_err(|e| SyncError::GenerationFailed(e.error.to_string()))
    }

    /// Run `call` until it succeeds, fails permanently or the retry budget
    /// is spent. With `timeout`, each attempt is cut off after that long.
    async fn retrying<T, F, Fut>(
        &self,
        what: &str,
        timeout: Option<Duration>,
        mut call: F,
    ) -> Result<T, Exhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut state = self.retry.start();
        loop {
            let attempt = state.begin_attempt();
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call()).await {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Transient(format!(
                        "timed out after {}s",
                        limit.as_secs_f32()
                    ))),
                },
                None => call().await,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match state.on_failure(error.class()) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp { attempts, exhausted } => {
                    debug!(operation = what, attempts, exhausted, error = %error, "giving up");
                    return Err(Exhausted { error, attempts });
                }
            }
        }
    }

    /// Follow page tokens until the listing ends; each page is retried.
    async fn exhaust<T, F, Fut>(&self, what: &str, mut fetch: F) -> Result<Vec<T>, ServiceError>
    where
        F: FnMut(Option<&str>) -> Fut,
        Fut: Future<Output = Result<Page<T>, ServiceError>>,
    {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .retrying(what, None, || fetch(token.as_deref()))
                .await
                .map_err(|e| e.error)?;
            items.extend(page.items);
            match page.next_page_token {
                Some(next) if Some(&next) != token.as_ref() => token = Some(next),
                Some(next) => {
                    return Err(ServiceError::Permanent(format!(
                        "listing repeated page token '{}'",
                        next
                    )))
                }
                None => return Ok(items),
            }
        }
    }
}
