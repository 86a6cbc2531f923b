//! The Gemini REST client against a local mock of the File Search API.

mod common;

use std::sync::Arc;

use common::mock_gemini::{MockGemini, API_KEY};
use tempfile::TempDir;

use wikirag::config::Credential;
use wikirag::gateway::{self, RemoteStoreGateway};
use wikirag::mapping_store::{self, MappingStore};
use wikirag::query::QueryEngine;
use wikirag::sync::Synchronizer;
use wikirag_core::models::{StoreOrigin, StoreReference, SyncMode};
use wikirag_core::SyncError;

fn connect(mock: &MockGemini) -> RemoteStoreGateway {
    gateway::connect(&mock.config(), Credential::new(API_KEY)).unwrap()
}

#[tokio::test]
async fn creates_a_store_and_then_reuses_it() {
    let mock = MockGemini::start().await;
    let gw = connect(&mock);

    let created = gw.create_or_reuse_store(None).await.unwrap();
    assert_eq!(created.origin, StoreOrigin::Created);
    assert_eq!(mock.store_names(), vec![created.name.clone()]);

    let reused = gw.create_or_reuse_store(Some(&created.name)).await.unwrap();
    assert_eq!(reused.origin, StoreOrigin::Reused);

    let summary = gw.get_store(&created.name).await.unwrap();
    assert_eq!(summary.display_name.as_deref(), Some("wikipedia-knowledge-base"));
    assert_eq!(summary.active_documents, Some(0));
}

#[tokio::test]
async fn unknown_store_is_unavailable() {
    let mock = MockGemini::start().await;
    let err = connect(&mock)
        .create_or_reuse_store(Some("fileSearchStores/missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::StoreUnavailable(_)));
    assert!(mock.store_names().is_empty());
}

#[tokio::test]
async fn upload_uses_the_resumable_protocol_and_lists_across_pages() {
    let mock = MockGemini::start().await;
    let store = StoreReference::reused(mock.seed_store("wiki"));
    let gw = connect(&mock);

    let mut handles = Vec::new();
    for name in ["a.md", "b.md", "c.md"] {
        handles.push(gw.upload(&store, name, name.as_bytes()).await.unwrap());
    }
    assert!(handles.iter().all(|h| h.starts_with(&format!("{}/documents/", store))));
    assert_eq!(mock.display_names(store.as_str()), vec!["a.md", "b.md", "c.md"]);

    let listed = gw.list(&store).await.unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].size_bytes, Some(4));
    let pages = mock
        .requests()
        .iter()
        .filter(|r| r.starts_with("GET") && r.contains("/documents?"))
        .count();
    assert_eq!(pages, 2);
}

#[tokio::test]
async fn unfinished_upload_operation_is_polled() {
    let mock = MockGemini::start().await;
    let store = StoreReference::reused(mock.seed_store("wiki"));
    mock.defer_operations();

    let handle = connect(&mock).upload(&store, "osaka.md", b"Osaka").await.unwrap();
    assert!(handle.starts_with(store.as_str()));
    assert!(mock
        .requests()
        .iter()
        .any(|r| r.starts_with("GET") && r.contains("/upload/operations/")));
}

#[tokio::test]
async fn service_unavailable_is_retried() {
    let mock = MockGemini::start().await;
    let store = StoreReference::reused(mock.seed_store("wiki"));
    mock.fail_next_starts(2);

    connect(&mock).upload(&store, "osaka.md", b"Osaka").await.unwrap();
    let starts = mock
        .requests()
        .iter()
        .filter(|r| r.contains(":uploadToFileSearchStore"))
        .count();
    assert_eq!(starts, 3);
}

#[tokio::test]
async fn rejected_api_key_is_not_retried() {
    let mock = MockGemini::start().await;
    let store = StoreReference::reused(mock.seed_store("wiki"));
    let gw = gateway::connect(&mock.config(), Credential::new("wrong")).unwrap();

    match gw.upload(&store, "osaka.md", b"Osaka").await {
        Err(SyncError::UploadFailed {
            attempts, reason, ..
        }) => {
            assert_eq!(attempts, 1);
            assert!(reason.contains("API key not valid"), "reason: {}", reason);
        }
        other => panic!("expected UploadFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn deleting_documents_and_stores() {
    let mock = MockGemini::start().await;
    let store = StoreReference::reused(mock.seed_store("wiki"));
    let gw = connect(&mock);
    let handle = gw.upload(&store, "a.md", b"a").await.unwrap();

    gw.delete(&store, &handle).await.unwrap();
    // Already gone.
    gw.delete(&store, &handle).await.unwrap();
    assert!(gw.list(&store).await.unwrap().is_empty());
    assert!(mock
        .requests()
        .iter()
        .any(|r| r.starts_with("DELETE") && r.contains("force=true")));

    gw.delete_store(&store).await.unwrap();
    assert!(mock.store_names().is_empty());
}

#[tokio::test]
async fn sync_and_ask_over_http() {
    let mock = MockGemini::start().await;
    let tmp = TempDir::new().unwrap();
    let corpus = tmp.path().join("wikipedia");
    std::fs::create_dir_all(&corpus).unwrap();
    std::fs::write(corpus.join("東京.md"), "東京は日本の首都である。").unwrap();
    std::fs::write(corpus.join("osaka.md"), "Osaka is known for takoyaki.").unwrap();
    let mapping_path = tmp.path().join("file_mappings.json");

    let config = mock.config();
    let gw = Arc::new(connect(&mock));
    let sync = Synchronizer::new(
        gw.clone(),
        MappingStore::open(&mapping_path).unwrap(),
        config.corpus.clone(),
    );
    let store = sync.resolve_store(None).await.unwrap();
    let report = sync
        .sync(&corpus, &store, SyncMode::Incremental, false)
        .await
        .unwrap();
    assert_eq!(report.uploaded_count(), 2);

    let table = mapping_store::load(&mapping_path).unwrap();
    let tokyo_safe_id = table.get("東京.md").unwrap().safe_id.clone();
    let mut remote = mock.display_names(store.as_str());
    remote.sort();
    let mut expected = vec!["osaka.md".to_string(), tokyo_safe_id];
    expected.sort();
    assert_eq!(remote, expected);

    let answer = QueryEngine::new(gw, table)
        .ask(&store, "首都")
        .await
        .unwrap();
    assert_eq!(answer.text, "Answer from the knowledge base.");
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].local_name().unwrap(), "東京.md");
}
