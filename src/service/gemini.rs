//! Gemini API File Search client.
//!
//! Talks to the `v1beta` REST surface directly with `reqwest`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | create store | `POST /v1beta/fileSearchStores` |
//! | get store | `GET /v1beta/{store}` |
//! | list stores | `GET /v1beta/fileSearchStores?pageSize&pageToken` |
//! | delete store | `DELETE /v1beta/{store}?force=true` |
//! | upload | resumable `POST /upload/v1beta/{store}:uploadToFileSearchStore`, then poll `GET /v1beta/{operation}` |
//! | list documents | `GET /v1beta/{store}/documents?pageSize&pageToken` |
//! | delete document | `DELETE /v1beta/{document}?force=true` |
//! | generate | `POST /v1beta/{model}:generateContent` with the `fileSearch` tool |
//!
//! # Error mapping
//!
//! - HTTP 429, 5xx, connection failures and timeouts → [`ServiceError::Transient`]
//! - HTTP 404 → [`ServiceError::NotFound`]
//! - any other 4xx → [`ServiceError::Permanent`]
//! - a finished upload operation carrying an error is transient for gRPC
//!   codes 4, 8 and 14 (deadline exceeded, resource exhausted, unavailable)
//!   and permanent otherwise.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

use wikirag_core::models::RemoteDocument;

use super::{GroundedAnswer, GroundingChunk, Page, SearchService, ServiceError, StoreSummary};
use crate::config::{Config, Credential};

const PAGE_SIZE: u32 = 20;
const API_KEY_HEADER: &str = "x-goog-api-key";
const UPLOAD_URL_HEADER: &str = "x-goog-upload-url";

/// Gemini File Search over HTTP.
pub struct GeminiFileSearch {
    client: reqwest::Client,
    base_url: String,
    credential: Credential,
    model: String,
    temperature: f64,
    poll_interval: Duration,
}

impl GeminiFileSearch {
    pub fn new(config: &Config, credential: Credential) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.api.request_timeout_secs))
            .build()?;

        let model = if config.generation.model.starts_with("models/") {
            config.generation.model.clone()
        } else {
            format!("models/{}", config.generation.model)
        };

        Ok(Self {
            client,
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            credential,
            model,
            temperature: config.generation.temperature,
            poll_interval: config.upload.poll_interval(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/v1beta/{}", self.base_url, path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header(API_KEY_HEADER, self.credential.expose())
    }

    /// Send a request and decode a successful JSON body.
    async fn send_json<T>(&self, req: RequestBuilder) -> Result<T, ServiceError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = self.authed(req).send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::Permanent(format!("unexpected response body: {}", e)))
    }

    async fn send_empty(&self, req: RequestBuilder) -> Result<(), ServiceError> {
        let response = self.authed(req).send().await.map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    /// Start a resumable upload and return the session URL.
    async fn start_upload(
        &self,
        store: &str,
        safe_id: &str,
        size: usize,
        mime_type: &str,
        timeout: Duration,
    ) -> Result<String, ServiceError> {
        let url = format!(
            "{}/upload/v1beta/{}:uploadToFileSearchStore",
            self.base_url, store
        );
        let req = self
            .client
            .post(url)
            .timeout(timeout)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "displayName": safe_id, "mimeType": mime_type }));

        let response = self.authed(req).send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .headers()
            .get(UPLOAD_URL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| ServiceError::Transient("upload session URL missing".to_string()))
    }

    async fn wait_for_operation(
        &self,
        mut op: Operation,
        deadline: Instant,
    ) -> Result<String, ServiceError> {
        loop {
            if op.done {
                return op.into_document_name();
            }
            let name = op.name.clone().ok_or_else(|| {
                ServiceError::Permanent("pending operation has no name".to_string())
            })?;
            let now = Instant::now();
            if now >= deadline {
                return Err(ServiceError::Transient(format!(
                    "operation {} did not finish before the upload timeout",
                    name
                )));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            tracing::debug!(operation = %name, "polling upload operation");
            op = self.send_json(self.client.get(self.api_url(&name))).await?;
        }
    }
}

#[async_trait]
impl SearchService for GeminiFileSearch {
    async fn create_store(&self, display_name: &str) -> Result<StoreSummary, ServiceError> {
        let req = self
            .client
            .post(self.api_url("fileSearchStores"))
            .json(&json!({ "displayName": display_name }));
        let store: StoreResource = self.send_json(req).await?;
        Ok(store.into())
    }

    async fn get_store(&self, store: &str) -> Result<StoreSummary, ServiceError> {
        let store: StoreResource = self.send_json(self.client.get(self.api_url(store))).await?;
        Ok(store.into())
    }

    async fn list_stores(
        &self,
        page_token: Option<&str>,
    ) -> Result<Page<StoreSummary>, ServiceError> {
        let req = self
            .client
            .get(self.api_url("fileSearchStores"))
            .query(&page_query(page_token));
        let page: StoreList = self.send_json(req).await?;
        Ok(Page {
            items: page.file_search_stores.into_iter().map(Into::into).collect(),
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn delete_store(&self, store: &str) -> Result<(), ServiceError> {
        let req = self
            .client
            .delete(self.api_url(store))
            .query(&[("force", "true")]);
        self.send_empty(req).await
    }

    async fn upload_document(
        &self,
        store: &str,
        safe_id: &str,
        content: &[u8],
        timeout: Duration,
    ) -> Result<String, ServiceError> {
        let deadline = Instant::now() + timeout;
        let mime_type = mime_type_for(safe_id);

        let session_url = self
            .start_upload(store, safe_id, content.len(), mime_type, timeout)
            .await?;

        let req = self
            .client
            .post(session_url)
            .timeout(timeout)
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header("X-Goog-Upload-Offset", "0")
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(content.to_vec());
        let op: Operation = self.send_json(req).await?;

        self.wait_for_operation(op, deadline).await
    }

    async fn list_documents(
        &self,
        store: &str,
        page_token: Option<&str>,
    ) -> Result<Page<RemoteDocument>, ServiceError> {
        let req = self
            .client
            .get(self.api_url(&format!("{}/documents", store)))
            .query(&page_query(page_token));
        let page: DocumentList = self.send_json(req).await?;
        Ok(Page {
            items: page
                .documents
                .into_iter()
                .map(|d| RemoteDocument {
                    handle: d.name,
                    display_name: d.display_name,
                    size_bytes: d.size_bytes,
                })
                .collect(),
            next_page_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn delete_document(&self, _store: &str, handle: &str) -> Result<(), ServiceError> {
        let req = self
            .client
            .delete(self.api_url(handle))
            .query(&[("force", "true")]);
        self.send_empty(req).await
    }

    async fn generate_grounded_answer(
        &self,
        store: &str,
        question: &str,
    ) -> Result<GroundedAnswer, ServiceError> {
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": question }] }],
            "tools": [{ "fileSearch": { "fileSearchStoreNames": [store] } }],
            "generationConfig": { "temperature": self.temperature },
        });
        let req = self
            .client
            .post(self.api_url(&format!("{}:generateContent", self.model)))
            .json(&body);
        let json: Value = self.send_json(req).await?;
        parse_generate_response(&json)
    }
}

/// Map a non-success status to a [`ServiceError`]; pass successes through.
async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn classify_status(status: StatusCode, body: &str) -> ServiceError {
    let message = format!("HTTP {}: {}", status.as_u16(), error_message(body));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ServiceError::Transient(message)
    } else if status == StatusCode::NOT_FOUND {
        ServiceError::NotFound(message)
    } else {
        ServiceError::Permanent(message)
    }
}

/// The `error.message` of a Google API error body, or the raw body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.chars().take(300).collect())
}

fn transport_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Transient(format!("request timed out: {}", e))
    } else if e.is_builder() {
        ServiceError::Permanent(format!("invalid request: {}", e))
    } else {
        ServiceError::Transient(format!("network error: {}", e))
    }
}

fn page_query(page_token: Option<&str>) -> Vec<(&'static str, String)> {
    let mut query = vec![("pageSize", PAGE_SIZE.to_string())];
    if let Some(token) = page_token {
        query.push(("pageToken", token.to_string()));
    }
    query
}

fn mime_type_for(safe_id: &str) -> &'static str {
    let ext = safe_id
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        _ => "text/plain",
    }
}

fn parse_generate_response(json: &Value) -> Result<GroundedAnswer, ServiceError> {
    let Some(candidate) = json["candidates"].get(0) else {
        let reason = json["promptFeedback"]["blockReason"]
            .as_str()
            .unwrap_or("no candidates returned");
        return Err(ServiceError::Permanent(format!("no answer: {}", reason)));
    };

    let text = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let chunks = candidate["groundingMetadata"]["groundingChunks"]
        .as_array()
        .map(|chunks| {
            chunks
                .iter()
                .filter_map(|chunk| {
                    let ctx = &chunk["retrievedContext"];
                    let reference = ctx["title"]
                        .as_str()
                        .or_else(|| ctx["uri"].as_str())?
                        .to_string();
                    Some(GroundingChunk {
                        reference,
                        excerpt: ctx["text"].as_str().map(String::from),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(GroundedAnswer { text, chunks })
}

// ============ Wire types ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreResource {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    create_time: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    active_documents_count: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    size_bytes: Option<u64>,
}

impl From<StoreResource> for StoreSummary {
    fn from(s: StoreResource) -> Self {
        StoreSummary {
            name: s.name,
            display_name: s.display_name,
            create_time: s.create_time,
            active_documents: s.active_documents_count,
            size_bytes: s.size_bytes,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreList {
    #[serde(default)]
    file_search_stores: Vec<StoreResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResource {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    size_bytes: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentList {
    #[serde(default)]
    documents: Vec<DocumentResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// A long-running operation as returned by the upload endpoints.
#[derive(Debug, Deserialize)]
struct Operation {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<OperationError>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl Operation {
    fn into_document_name(self) -> Result<String, ServiceError> {
        if let Some(err) = self.error {
            let message = format!("operation failed (code {}): {}", err.code, err.message);
            return Err(match err.code {
                4 | 8 | 14 => ServiceError::Transient(message),
                _ => ServiceError::Permanent(message),
            });
        }
        self.response
            .as_ref()
            .and_then(|r| r["documentName"].as_str())
            .map(String::from)
            .ok_or_else(|| {
                ServiceError::Permanent("operation finished without a document name".to_string())
            })
    }
}

/// int64 fields arrive as JSON strings; accept numbers as well.
fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match Option::<NumOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ServiceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            ServiceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            ServiceError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            ServiceError::Permanent(_)
        ));
    }

    #[test]
    fn error_message_prefers_google_error_body() {
        let body = r#"{"error":{"code":400,"message":"Invalid display name","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(error_message(body), "Invalid display name");
        assert_eq!(error_message("plain text"), "plain text");
    }

    #[test]
    fn operation_errors_are_classified_by_code() {
        let op: Operation = serde_json::from_value(json!({
            "name": "fileSearchStores/s/operations/1",
            "done": true,
            "error": { "code": 14, "message": "unavailable" }
        }))
        .unwrap();
        assert!(matches!(
            op.into_document_name(),
            Err(ServiceError::Transient(_))
        ));

        let op: Operation = serde_json::from_value(json!({
            "done": true,
            "error": { "code": 3, "message": "unsupported file" }
        }))
        .unwrap();
        assert!(matches!(
            op.into_document_name(),
            Err(ServiceError::Permanent(_))
        ));

        let op: Operation = serde_json::from_value(json!({
            "done": true,
            "response": { "documentName": "fileSearchStores/s/documents/d1" }
        }))
        .unwrap();
        assert_eq!(op.into_document_name().unwrap(), "fileSearchStores/s/documents/d1");
    }

    #[test]
    fn int64_fields_accept_strings() {
        let doc: DocumentResource = serde_json::from_value(json!({
            "name": "fileSearchStores/s/documents/d1",
            "displayName": "osaka.md",
            "sizeBytes": "5120"
        }))
        .unwrap();
        assert_eq!(doc.size_bytes, Some(5120));
    }

    #[test]
    fn generate_response_collects_text_and_chunks() {
        let json = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Tokyo is " }, { "text": "the capital." }] },
                "groundingMetadata": {
                    "groundingChunks": [
                        { "retrievedContext": { "title": "doc~5e0c.md", "text": "東京は日本の首都" } },
                        { "web": { "uri": "https://example.com" } }
                    ]
                }
            }]
        });
        let answer = parse_generate_response(&json).unwrap();
        assert_eq!(answer.text, "Tokyo is the capital.");
        assert_eq!(answer.chunks.len(), 1);
        assert_eq!(answer.chunks[0].reference, "doc~5e0c.md");
    }

    #[test]
    fn blocked_prompt_is_permanent() {
        let json = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        match parse_generate_response(&json) {
            Err(ServiceError::Permanent(msg)) => assert!(msg.contains("SAFETY")),
            other => panic!("expected permanent error, got {:?}", other),
        }
    }

    #[test]
    fn mime_types_follow_extension() {
        assert_eq!(mime_type_for("osaka.md"), "text/markdown");
        assert_eq!(mime_type_for("doc~abc.MD"), "text/markdown");
        assert_eq!(mime_type_for("doc~abc"), "text/plain");
    }
}
