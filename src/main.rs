//! Document Extractor - upload a document image, get structured fields back.

mod caller;
mod config;
mod error;
mod image_input;
mod normalizer;
mod schema;
mod store;
mod vision;

use std::any::Any;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use caller::CallerId;
use chrono::{DateTime, Utc};
use config::AppConfig;
use error::ApiError;
use image_input::ImagePayload;
use schema::{ExtractionResult, FieldMap, NewDocument, StoredDocument};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use store::{DocumentStore, MemoryStore, SupabaseStore, HISTORY_LIMIT};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vision::{MistralClient, VisionProvider};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    provider: Arc<dyn VisionProvider>,
    store: Arc<dyn DocumentStore>,
    config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "document_extractor=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let provider = MistralClient::new(&config.provider)?;
    info!(
        "Vision provider initialized: {} (model {}, timeout {:?})",
        provider.name(),
        provider.model(),
        config.provider.timeout
    );

    let store: Arc<dyn DocumentStore> = match &config.storage {
        Some(storage) => {
            info!("Saving documents to Supabase table '{}'", storage.table);
            Arc::new(SupabaseStore::new(storage))
        }
        None => {
            warn!("SUPABASE_URL / SUPABASE_ANON_KEY not set, documents are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    info!("Document store: {}", store.name());

    let bind_addr = config.server.bind_addr.clone();
    let state = AppState {
        provider: Arc::new(provider),
        store,
        config: Arc::new(config),
    };

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let body_limit = state.config.server.max_body_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/api/process-document", post(process_document))
        .route("/api/process-upload", post(process_upload))
        .route("/api/save-data", post(save_data))
        .route("/api/history", get(history))
        .route("/api/documents", post(process_and_save))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    #[serde(default)]
    image: Option<String>,
}

/// Extract fields from a base64 / data-URI image.
async fn process_document(
    State(state): State<AppState>,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<ExtractionResult>, ApiError> {
    let Json(request) = body.map_err(invalid_body)?;
    let image = ImagePayload::parse(request.image.as_deref().unwrap_or_default())?;

    let result = run_extraction(&state, &image).await?;
    Ok(Json(result))
}

/// Extract fields from a multipart `file` upload.
async fn process_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ExtractionResult>, ApiError> {
    let mut content_type = None;
    let mut file_data = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request("Invalid upload", format!("Multipart error: {}", e)))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("document").to_string();
            content_type = field.content_type().map(str::to_string);
            file_data = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request("Invalid upload", format!("Failed to read file: {}", e)))?
                .to_vec();
            info!("Received file: {} ({} bytes)", filename, file_data.len());
            break;
        }
    }

    let image = ImagePayload::from_bytes(file_data, content_type.as_deref())?;
    let result = run_extraction(&state, &image).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveRequest {
    fields: FieldMap,
    /// Scores may arrive as numbers or strings like `"92%"`.
    #[serde(default)]
    confidence: Option<Map<String, Value>>,
    #[serde(default)]
    raw_text: String,
    #[serde(default)]
    processed_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "document_name", alias = "documentName")]
    document_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct SaveResponse {
    success: bool,
    id: String,
}

/// Persist a previously extracted result under the caller's history.
async fn save_data(
    State(state): State<AppState>,
    caller: CallerId,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<SaveResponse>, ApiError> {
    let Json(value) = body.map_err(invalid_body)?;

    if !value.get("fields").map_or(false, Value::is_object) {
        return Err(ApiError::bad_request(
            "Invalid data format",
            "Missing or invalid 'fields' property",
        ));
    }

    let request: SaveRequest = serde_json::from_value(value)
        .map_err(|e| ApiError::bad_request("Invalid data format", e.to_string()))?;

    let confidence = request
        .confidence
        .map(normalizer::confidence_from_json)
        .unwrap_or_default();
    let confidence = normalizer::backfill(&request.fields, confidence);
    let result = ExtractionResult {
        fields: request.fields,
        confidence,
        raw_text: request.raw_text,
        processed_at: request.processed_at.unwrap_or_else(Utc::now),
    };
    let doc = NewDocument::from_result(result, caller.0, request.document_name.as_deref());

    let id = state.store.save(doc).await.map_err(|e| ApiError::Storage {
        message: "Database insert failed",
        details: format!("{:#}", e),
    })?;

    Ok(Json(SaveResponse { success: true, id }))
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    history: Vec<StoredDocument>,
}

/// The caller's most recent documents, newest first.
async fn history(
    State(state): State<AppState>,
    caller: CallerId,
) -> Result<Json<HistoryResponse>, ApiError> {
    let history = state
        .store
        .history(caller.as_str(), HISTORY_LIMIT)
        .await
        .map_err(|e| ApiError::Storage {
            message: "Failed to fetch history",
            details: format!("{:#}", e),
        })?;

    debug!("History for {}: {} documents", caller.as_str(), history.len());
    Ok(Json(HistoryResponse { history }))
}

#[derive(Debug, Deserialize)]
struct ProcessAndSaveRequest {
    #[serde(default)]
    image: Option<String>,
    #[serde(default, alias = "documentName")]
    document_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessedDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    document_name: String,
    #[serde(flatten)]
    result: ExtractionResult,
    /// Set when extraction worked but saving did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

/// Extract and save in one call. A storage failure still returns the
/// extracted data, with a warning instead of an id.
async fn process_and_save(
    State(state): State<AppState>,
    caller: CallerId,
    body: Result<Json<ProcessAndSaveRequest>, JsonRejection>,
) -> Result<Json<ProcessedDocument>, ApiError> {
    let Json(request) = body.map_err(invalid_body)?;
    let image = ImagePayload::parse(request.image.as_deref().unwrap_or_default())?;

    let result = run_extraction(&state, &image).await?;

    let doc = NewDocument::from_result(result.clone(), caller.0, request.document_name.as_deref());
    let document_name = doc.document_name.clone();

    let (id, warning) = match state.store.save(doc).await {
        Ok(id) => (Some(id), None),
        Err(e) => {
            warn!("Document processed but failed to save: {:#}", e);
            (None, Some(format!("Document processed but failed to save: {}", e)))
        }
    };

    Ok(Json(ProcessedDocument {
        id,
        document_name,
        result,
        warning,
    }))
}

// ============================================================================
// Helper functions
// ============================================================================

/// Send the image to the vision provider and normalize whatever comes back.
async fn run_extraction(
    state: &AppState,
    image: &ImagePayload,
) -> Result<ExtractionResult, ApiError> {
    info!(
        "Processing {} image ({} bytes) with {}",
        image.mime_type,
        image.data.len(),
        state.provider.name()
    );

    let response = state
        .provider
        .describe(image, &state.config.provider.prompt)
        .await
        .map_err(|e| {
            if vision::is_timeout(&e) {
                ApiError::Timeout(format!("{:#}", e))
            } else {
                ApiError::Processing(format!("{:#}", e))
            }
        })?;

    debug!("Raw model response length: {} chars", response.len());

    let result = normalizer::normalize(&response);
    info!("Extraction complete: {} fields", result.fields.len());
    Ok(result)
}

fn invalid_body(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request("Invalid request data", rejection.body_text())
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    };
    ApiError::Internal(details).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use crate::schema::FieldValue;
    use serde_json::json;

    struct StubProvider {
        reply: Result<&'static str, &'static str>,
    }

    #[async_trait::async_trait]
    impl VisionProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn describe(&self, _image: &ImagePayload, _prompt: &str) -> anyhow::Result<String> {
            self.reply.map(str::to_string).map_err(|e| anyhow::anyhow!(e))
        }
    }

    struct FailingStore;

    #[async_trait::async_trait]
    impl DocumentStore for FailingStore {
        fn name(&self) -> &str {
            "failing"
        }

        async fn save(&self, _doc: NewDocument) -> anyhow::Result<String> {
            anyhow::bail!("connection refused")
        }

        async fn history(&self, _caller_id: &str, _limit: usize) -> anyhow::Result<Vec<StoredDocument>> {
            anyhow::bail!("connection refused")
        }
    }

    const REPLY: &str = "```json\n{\"fields\":{\"name\":\"John\",\"total\":12.5},\"confidence\":{\"name\":90},\"rawText\":\"John\\nTotal 12.50\"}\n```";

    fn state_with(reply: Result<&'static str, &'static str>, store: Arc<dyn DocumentStore>) -> AppState {
        let config = AppConfig::from_lookup(|key| {
            (key == "MISTRAL_API_KEY").then(|| "test-key".to_string())
        })
        .unwrap();

        AppState {
            provider: Arc::new(StubProvider { reply }),
            store,
            config: Arc::new(config),
        }
    }

    fn image_base64() -> String {
        BASE64.encode([0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10])
    }

    #[tokio::test]
    async fn test_process_document_normalizes_reply() {
        let state = state_with(Ok(REPLY), Arc::new(MemoryStore::new()));
        let request = ProcessRequest {
            image: Some(image_base64()),
        };

        let Json(result) = process_document(State(state), Ok(Json(request))).await.unwrap();
        assert_eq!(result.fields["name"], FieldValue::from("John"));
        assert_eq!(result.fields["total"].to_string(), "12.5");
        assert_eq!(result.confidence["name"], 90.0);
        assert_eq!(result.confidence["total"], normalizer::DEFAULT_CONFIDENCE);
        assert_eq!(result.raw_text, "John\nTotal 12.50");
    }

    #[tokio::test]
    async fn test_process_document_requires_image() {
        let state = state_with(Ok(REPLY), Arc::new(MemoryStore::new()));

        let err = process_document(State(state), Ok(Json(ProcessRequest { image: None })))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "No image provided");
    }

    #[tokio::test]
    async fn test_provider_failure_is_server_error() {
        let state = state_with(Err("upstream 503"), Arc::new(MemoryStore::new()));
        let request = ProcessRequest {
            image: Some(image_base64()),
        };

        let err = process_document(State(state), Ok(Json(request))).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Failed to process document");
        assert_eq!(err.details(), Some("upstream 503"));
    }

    #[tokio::test]
    async fn test_unstructured_reply_still_succeeds() {
        let state = state_with(Ok("I could not find any fields."), Arc::new(MemoryStore::new()));
        let request = ProcessRequest {
            image: Some(image_base64()),
        };

        let Json(result) = process_document(State(state), Ok(Json(request))).await.unwrap();
        assert_eq!(
            result.fields[normalizer::FALLBACK_FIELD],
            FieldValue::from("I could not find any fields.")
        );
        assert_eq!(
            result.confidence[normalizer::FALLBACK_FIELD],
            normalizer::FALLBACK_CONFIDENCE
        );
    }

    #[tokio::test]
    async fn test_save_then_history_is_scoped() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(Ok(REPLY), store.clone());

        for (caller, name) in [("alice", "Receipt"), ("bob", "Invoice"), ("alice", "Passport")] {
            let body = json!({
                "fields": {"name": name},
                "confidence": {},
                "rawText": name,
                "processedAt": "2025-02-01T12:00:00Z",
                "document_name": name,
            });
            let Json(saved) = save_data(
                State(state.clone()),
                CallerId(caller.to_string()),
                Ok(Json(body)),
            )
            .await
            .unwrap();
            assert!(saved.success);
        }

        let Json(response) = history(State(state), CallerId("alice".to_string())).await.unwrap();
        assert_eq!(response.history.len(), 2);
        assert!(response.history.iter().all(|d| d.caller_id == "alice"));
        assert_eq!(response.history[0].confidence["name"], normalizer::DEFAULT_CONFIDENCE);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_save_data_coerces_loose_values() {
        let state = state_with(Ok(REPLY), Arc::new(MemoryStore::new()));
        let body = json!({
            "fields": {"paid": true, "note": null, "total": 12.5},
            "confidence": {"paid": "92%", "total": null},
        });

        save_data(State(state.clone()), CallerId("erin".into()), Ok(Json(body)))
            .await
            .unwrap();

        let Json(response) = history(State(state), CallerId("erin".into())).await.unwrap();
        let doc = &response.history[0];
        assert_eq!(doc.fields["paid"], FieldValue::from("true"));
        assert_eq!(doc.fields["note"], FieldValue::from(""));
        assert_eq!(doc.fields["total"].to_string(), "12.5");
        assert_eq!(doc.confidence["paid"], 92.0);
        assert_eq!(doc.confidence["note"], normalizer::DEFAULT_CONFIDENCE);
        assert_eq!(doc.confidence["total"], normalizer::DEFAULT_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_save_data_rejects_invalid_fields() {
        let state = state_with(Ok(REPLY), Arc::new(MemoryStore::new()));

        for body in [json!({"fields": ["a"]}), json!({"rawText": "x"})] {
            let err = save_data(State(state.clone()), CallerId("x".into()), Ok(Json(body)))
                .await
                .unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
            assert_eq!(err.to_string(), "Invalid data format");
        }
    }

    #[tokio::test]
    async fn test_save_data_reports_storage_failure() {
        let state = state_with(Ok(REPLY), Arc::new(FailingStore));

        let err = save_data(
            State(state),
            CallerId("x".into()),
            Ok(Json(json!({"fields": {"a": "1"}}))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Database insert failed");
        assert_eq!(err.details(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_history_reports_storage_failure() {
        let state = state_with(Ok(REPLY), Arc::new(FailingStore));

        let err = history(State(state), CallerId("x".into())).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to fetch history");
    }

    #[tokio::test]
    async fn test_process_and_save_returns_id() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(Ok(REPLY), store.clone());
        let request = ProcessAndSaveRequest {
            image: Some(format!("data:image/jpeg;base64,{}", image_base64())),
            document_name: Some("Lunch receipt".to_string()),
        };

        let Json(doc) = process_and_save(State(state), CallerId("carol".into()), Ok(Json(request)))
            .await
            .unwrap();
        assert!(doc.id.is_some());
        assert!(doc.warning.is_none());
        assert_eq!(doc.document_name, "Lunch receipt");

        let history = store.history("carol", HISTORY_LIMIT).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(Some(&history[0].id), doc.id.as_ref());
    }

    #[tokio::test]
    async fn test_process_and_save_partial_success() {
        let state = state_with(Ok(REPLY), Arc::new(FailingStore));
        let request = ProcessAndSaveRequest {
            image: Some(image_base64()),
            document_name: None,
        };

        let Json(doc) = process_and_save(State(state), CallerId("dave".into()), Ok(Json(request)))
            .await
            .unwrap();
        assert!(doc.id.is_none());
        assert!(doc.warning.as_deref().unwrap().contains("failed to save"));
        assert_eq!(doc.result.fields["name"], FieldValue::from("John"));

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["documentName"], json!(schema::UNTITLED_DOCUMENT));
        assert_eq!(value["rawText"], json!("John\nTotal 12.50"));
        assert!(value.get("id").is_none());
    }

    #[tokio::test]
    async fn test_provider_timeout_is_gateway_timeout() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let base_url = format!("http://{}/v1", addr);
        let config = AppConfig::from_lookup(|key| match key {
            "MISTRAL_API_KEY" => Some("test-key".to_string()),
            "MISTRAL_API_URL" => Some(base_url.clone()),
            "AI_TIMEOUT_SECS" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();
        let state = AppState {
            provider: Arc::new(MistralClient::new(&config.provider).unwrap()),
            store: Arc::new(MemoryStore::new()),
            config: Arc::new(config),
        };
        let request = ProcessRequest {
            image: Some(image_base64()),
        };

        let err = process_document(State(state), Ok(Json(request))).await.unwrap_err();
        assert!(matches!(err, ApiError::Timeout(_)));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let response = handle_panic(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
