#![allow(dead_code)]

pub mod mock_gemini;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use wikirag::config::CorpusConfig;
use wikirag::gateway::RemoteStoreGateway;
use wikirag::mapping_store::{self, MappingStore};
use wikirag::service::memory::InMemoryService;
use wikirag::sync::Synchronizer;
use wikirag_core::models::StoreReference;
use wikirag_core::retry::RetryPolicy;
use wikirag_core::MappingTable;

/// A corpus directory, a mapping file and an in-memory store.
pub struct Harness {
    pub svc: Arc<InMemoryService>,
    pub tmp: TempDir,
    pub corpus: PathBuf,
    pub mapping_path: PathBuf,
    pub retries: u32,
    pub upload_timeout: Duration,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_service(InMemoryService::new())
    }

    pub fn with_service(svc: InMemoryService) -> Self {
        let tmp = TempDir::new().unwrap();
        let corpus = tmp.path().join("wikipedia");
        fs::create_dir_all(&corpus).unwrap();
        let mapping_path = tmp.path().join("file_mappings.json");
        Self {
            svc: Arc::new(svc),
            tmp,
            corpus,
            mapping_path,
            retries: 2,
            upload_timeout: Duration::from_secs(5),
        }
    }

    pub fn write(&self, name: &str, content: &str) {
        fs::write(self.corpus.join(name), content).unwrap();
    }

    pub fn remove(&self, name: &str) {
        fs::remove_file(self.corpus.join(name)).unwrap();
    }

    pub fn gateway(&self) -> Arc<RemoteStoreGateway> {
        Arc::new(RemoteStoreGateway::new(
            self.svc.clone(),
            RetryPolicy::immediate(self.retries),
            self.upload_timeout,
        ))
    }

    /// A synchronizer over a freshly opened mapping store, as a new process
    /// would see it.
    pub fn synchronizer(&self) -> Synchronizer {
        let mapping = MappingStore::open(&self.mapping_path).unwrap();
        Synchronizer::new(self.gateway(), mapping, CorpusConfig::default())
    }

    pub fn table(&self) -> MappingTable {
        mapping_store::load(&self.mapping_path).unwrap()
    }

    pub fn mapping_bytes(&self) -> Vec<u8> {
        fs::read(&self.mapping_path).unwrap()
    }

    pub fn seed_store(&self) -> StoreReference {
        StoreReference::reused(self.svc.seed_store("wikipedia-knowledge-base"))
    }
}
