//! Contract of the hosted File Search service.
//!
//! The [`SearchService`] trait is the only seam between wikirag and the
//! remote system. It is deliberately thin: one call per remote operation,
//! one page per listing call, no retries. Resilience (retry, backoff,
//! timeouts, pagination) lives in [`crate::gateway`].
//!
//! Implementations:
//! - [`gemini::GeminiFileSearch`]: the Gemini API `v1beta` REST endpoints.
//! - [`memory::InMemoryService`]: deterministic in-process store with fault
//!   injection, for tests.

pub mod gemini;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use wikirag_core::models::RemoteDocument;
use wikirag_core::retry::ErrorClass;

/// Errors reported by a [`SearchService`] call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// Timeout, rate limit, 5xx or network failure. Worth retrying.
    #[error("transient service error: {0}")]
    Transient(String),
    /// The request was rejected and will be rejected again.
    #[error("request rejected: {0}")]
    Permanent(String),
    /// The named store, document or operation does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ServiceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ServiceError::Transient(_) => ErrorClass::Transient,
            ServiceError::Permanent(_) | ServiceError::NotFound(_) => ErrorClass::Permanent,
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }
}

/// A store as described by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreSummary {
    /// Resource name, e.g. `fileSearchStores/wikipedia-knowledge-base-abc123`.
    pub name: String,
    pub display_name: Option<String>,
    pub create_time: Option<String>,
    pub active_documents: Option<u64>,
    pub size_bytes: Option<u64>,
}

impl StoreSummary {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            create_time: None,
            active_documents: None,
            size_bytes: None,
        }
    }
}

/// A passage the answer was grounded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundingChunk {
    /// Remote identifier of the source document: its handle, or the display
    /// name it was uploaded under.
    pub reference: String,
    pub excerpt: Option<String>,
}

/// Raw grounded generation result, before citation resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundedAnswer {
    pub text: String,
    pub chunks: Vec<GroundingChunk>,
}

#[async_trait]
pub trait SearchService: Send + Sync {
    async fn create_store(&self, display_name: &str) -> Result<StoreSummary, ServiceError>;

    async fn get_store(&self, store: &str) -> Result<StoreSummary, ServiceError>;

    async fn list_stores(
        &self,
        page_token: Option<&str>,
    ) -> Result<Page<StoreSummary>, ServiceError>;

    /// Delete a store together with its documents.
    async fn delete_store(&self, store: &str) -> Result<(), ServiceError>;

    /// Upload `content` under the display name `safe_id` and wait until the
    /// service has indexed it. Returns the document handle.
    async fn upload_document(
        &self,
        store: &str,
        safe_id: &str,
        content: &[u8],
        timeout: Duration,
    ) -> Result<String, ServiceError>;

    async fn list_documents(
        &self,
        store: &str,
        page_token: Option<&str>,
    ) -> Result<Page<RemoteDocument>, ServiceError>;

    async fn delete_document(&self, store: &str, handle: &str) -> Result<(), ServiceError>;

    async fn generate_grounded_answer(
        &self,
        store: &str,
        question: &str,
    ) -> Result<GroundedAnswer, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_retried() {
        assert_eq!(
            ServiceError::Transient("503".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ServiceError::NotFound("stores/x".into()).class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            ServiceError::Permanent("400".into()).class(),
            ErrorClass::Permanent
        );
    }
}
