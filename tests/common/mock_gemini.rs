//! A small stand-in for the Gemini File Search REST API, served by axum on a
//! random local port.
//!
//! Listings are cut into pages of two so pagination is exercised with a
//! handful of documents.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::{json, Value};

use wikirag::config::Config;

pub const API_KEY: &str = "test-key";
const PAGE: usize = 2;

pub struct MockDocument {
    pub store: String,
    pub name: String,
    pub display_name: String,
    pub content: Vec<u8>,
}

#[derive(Default)]
pub struct MockState {
    base_url: String,
    stores: BTreeMap<String, String>,
    documents: Vec<MockDocument>,
    sessions: BTreeMap<String, (String, String)>,
    operations: BTreeMap<String, String>,
    next_id: usize,
    fail_next_starts: usize,
    defer_operations: bool,
    requests: Vec<String>,
}

type Shared = Arc<Mutex<MockState>>;

pub struct MockGemini {
    pub base_url: String,
    state: Shared,
}

impl MockGemini {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let state: Shared = Arc::new(Mutex::new(MockState {
            base_url: base_url.clone(),
            ..MockState::default()
        }));
        let app = Router::new().fallback(handle).with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { base_url, state }
    }

    /// Defaults pointed at this server, with fast retries.
    pub fn config(&self) -> Config {
        let mut config = Config::minimal();
        config.api.base_url = self.base_url.clone();
        config.upload.poll_interval_secs = 1;
        config.upload.timeout_secs = 10;
        config.upload.max_retries = 2;
        config.upload.backoff_base_ms = 1;
        config.upload.backoff_max_secs = 1;
        config
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn seed_store(&self, display_name: &str) -> String {
        let mut s = self.lock();
        let name = new_name(&mut s, "fileSearchStores/store");
        s.stores.insert(name.clone(), display_name.to_string());
        name
    }

    pub fn fail_next_starts(&self, n: usize) {
        self.lock().fail_next_starts = n;
    }

    /// Upload operations come back unfinished and must be polled once.
    pub fn defer_operations(&self) {
        self.lock().defer_operations = true;
    }

    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    pub fn display_names(&self, store: &str) -> Vec<String> {
        self.lock()
            .documents
            .iter()
            .filter(|d| d.store == store)
            .map(|d| d.display_name.clone())
            .collect()
    }

    pub fn store_names(&self) -> Vec<String> {
        self.lock().stores.keys().cloned().collect()
    }
}

fn new_name(s: &mut MockState, prefix: &str) -> String {
    s.next_id += 1;
    format!("{}-{:04}", prefix, s.next_id)
}

fn error(status: StatusCode, message: &str) -> Response {
    let body = json!({ "error": { "code": status.as_u16(), "message": message } });
    (status, Json(body)).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}

async fn handle(
    State(state): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    route(&state, method, uri, headers, body)
}

fn route(state: &Shared, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let mut s = state.lock().unwrap();
    s.requests.push(format!("{} {}", method, uri));

    if header(&headers, "x-goog-api-key") != Some(API_KEY) {
        return error(StatusCode::FORBIDDEN, "API key not valid. Please pass a valid API key.");
    }

    let path = uri.path().to_string();

    if let Some(session) = path.strip_prefix("/upload-session/") {
        return finalize_upload(&mut s, session, &headers, body);
    }
    if let Some(rest) = path.strip_prefix("/upload/v1beta/") {
        if let (&Method::POST, Some(store)) = (&method, rest.strip_suffix(":uploadToFileSearchStore")) {
            return start_upload(&mut s, store, &headers, &body);
        }
    }
    let Some(rest) = path.strip_prefix("/v1beta/") else {
        return error(StatusCode::NOT_FOUND, "unknown path");
    };

    match method {
        Method::POST if rest == "fileSearchStores" => {
            let request: Value = serde_json::from_slice(&body).unwrap_or_default();
            let display_name = request["displayName"].as_str().unwrap_or("").to_string();
            let name = new_name(&mut s, "fileSearchStores/store");
            s.stores.insert(name.clone(), display_name.clone());
            Json(json!({ "name": name, "displayName": display_name })).into_response()
        }
        Method::GET if rest == "fileSearchStores" => {
            let stores: Vec<Value> = s
                .stores
                .iter()
                .map(|(name, display)| json!({ "name": name, "displayName": display }))
                .collect();
            Json(json!({ "fileSearchStores": stores })).into_response()
        }
        Method::POST if rest.ends_with(":generateContent") => generate(&s, &body),
        Method::GET if rest.contains("/operations/") => match s.operations.get(rest) {
            Some(document) => Json(json!({
                "name": rest,
                "done": true,
                "response": { "documentName": document },
            }))
            .into_response(),
            None => error(StatusCode::NOT_FOUND, "operation not found"),
        },
        Method::GET if rest.ends_with("/documents") => {
            let store = rest.trim_end_matches("/documents");
            if !s.stores.contains_key(store) {
                return error(StatusCode::NOT_FOUND, "store not found");
            }
            let start: usize = query_param(&uri, "pageToken")
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);
            let all: Vec<&MockDocument> = s.documents.iter().filter(|d| d.store == store).collect();
            let end = (start + PAGE).min(all.len());
            let documents: Vec<Value> = all[start.min(end)..end]
                .iter()
                .map(|d| {
                    json!({
                        "name": d.name,
                        "displayName": d.display_name,
                        "sizeBytes": d.content.len().to_string(),
                    })
                })
                .collect();
            let mut page = json!({ "documents": documents });
            if end < all.len() {
                page["nextPageToken"] = json!(end.to_string());
            }
            Json(page).into_response()
        }
        Method::GET => match s.stores.get(rest) {
            Some(display) => {
                let count = s.documents.iter().filter(|d| d.store == rest).count();
                Json(json!({
                    "name": rest,
                    "displayName": display,
                    "activeDocumentsCount": count.to_string(),
                }))
                .into_response()
            }
            None => error(StatusCode::NOT_FOUND, "store not found"),
        },
        Method::DELETE => {
            if query_param(&uri, "force").as_deref() != Some("true") {
                return error(StatusCode::BAD_REQUEST, "resource is not empty; use force");
            }
            if rest.contains("/documents/") {
                let before = s.documents.len();
                s.documents.retain(|d| d.name != rest);
                if s.documents.len() == before {
                    return error(StatusCode::NOT_FOUND, "document not found");
                }
            } else if s.stores.remove(rest).is_some() {
                s.documents.retain(|d| d.store != rest);
            } else {
                return error(StatusCode::NOT_FOUND, "store not found");
            }
            Json(json!({})).into_response()
        }
        _ => error(StatusCode::NOT_FOUND, "unknown path"),
    }
}

fn start_upload(s: &mut MockState, store: &str, headers: &HeaderMap, body: &[u8]) -> Response {
    if header(headers, "x-goog-upload-protocol") != Some("resumable")
        || header(headers, "x-goog-upload-command") != Some("start")
    {
        return error(StatusCode::BAD_REQUEST, "expected a resumable start request");
    }
    if !s.stores.contains_key(store) {
        return error(StatusCode::NOT_FOUND, "store not found");
    }
    if s.fail_next_starts > 0 {
        s.fail_next_starts -= 1;
        return error(StatusCode::SERVICE_UNAVAILABLE, "The service is currently unavailable.");
    }
    let request: Value = serde_json::from_slice(body).unwrap_or_default();
    let display_name = request["displayName"].as_str().unwrap_or("").to_string();

    s.next_id += 1;
    let session = s.next_id.to_string();
    s.sessions
        .insert(session.clone(), (store.to_string(), display_name));
    let url = format!("{}/upload-session/{}", s.base_url, session);
    (StatusCode::OK, [("x-goog-upload-url", url)], "").into_response()
}

fn finalize_upload(s: &mut MockState, session: &str, headers: &HeaderMap, body: Bytes) -> Response {
    if header(headers, "x-goog-upload-command") != Some("upload, finalize") {
        return error(StatusCode::BAD_REQUEST, "expected upload, finalize");
    }
    let Some((store, display_name)) = s.sessions.remove(session) else {
        return error(StatusCode::NOT_FOUND, "unknown upload session");
    };
    let document = new_name(s, &format!("{}/documents/doc", store));
    s.documents.push(MockDocument {
        store: store.clone(),
        name: document.clone(),
        display_name,
        content: body.to_vec(),
    });

    let operation = new_name(s, &format!("{}/upload/operations/op", store));
    s.operations.insert(operation.clone(), document.clone());
    if s.defer_operations {
        Json(json!({ "name": operation, "done": false })).into_response()
    } else {
        Json(json!({
            "name": operation,
            "done": true,
            "response": { "documentName": document },
        }))
        .into_response()
    }
}

fn generate(s: &MockState, body: &[u8]) -> Response {
    let request: Value = serde_json::from_slice(body).unwrap_or_default();
    let store = request["tools"][0]["fileSearch"]["fileSearchStoreNames"][0]
        .as_str()
        .unwrap_or("");
    let question = request["contents"][0]["parts"][0]["text"]
        .as_str()
        .unwrap_or("")
        .to_lowercase();

    let chunks: Vec<Value> = s
        .documents
        .iter()
        .filter(|d| d.store == store)
        .filter_map(|d| {
            let text = String::from_utf8_lossy(&d.content).to_string();
            text.to_lowercase().contains(&question).then(|| {
                json!({ "retrievedContext": { "title": d.display_name, "text": text } })
            })
        })
        .collect();

    Json(json!({
        "candidates": [{
            "content": { "role": "model", "parts": [{ "text": "Answer from the knowledge base." }] },
            "groundingMetadata": { "groundingChunks": chunks },
        }]
    }))
    .into_response()
}
