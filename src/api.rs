use std::convert::Infallible;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    middleware,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures::{stream, Stream, StreamExt};
use serde_json::{json, Value};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error};

use crate::{
    app_state::AppState,
    auth,
    errors::{RagError, Result},
    llm::ChunkStream,
    models::{ChatCompletionChunk, ChatCompletionRequest},
};

// --- Router ---

pub fn create_router(app_state: AppState, max_concurrency: usize) -> Router {
    let v1 = Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(models_handler))
        .route_layer(middleware::from_fn_with_state(
            app_state.auth.clone(),
            auth::require_secret,
        ));

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .merge(v1)
        .with_state(app_state)
        .layer(GlobalConcurrencyLimitLayer::new(max_concurrency.max(1)))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

// --- Handlers ---

#[axum::debug_handler]
async fn root_handler() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/v1/chat/completions", "/v1/models"],
    }))
}

/// Sólo indica que el proceso responde; no consulta el índice ni los backends.
#[axum::debug_handler]
async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[axum::debug_handler]
async fn models_handler(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .gateway
        .model()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "rag" }))
        .into_iter()
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

#[axum::debug_handler]
async fn chat_completions_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(mut request) = payload.map_err(|e| RagError::InvalidRequest(e.body_text()))?;
    if request.messages.is_empty() {
        return Err(RagError::InvalidRequest(
            "'messages' debe contener al menos un mensaje".to_string(),
        ));
    }

    let query = request.last_user_message().unwrap_or_default().to_string();
    let retrieved = state.retriever.retrieve(&query, state.top_k).await?;
    debug!(
        retrieved = retrieved.len(),
        stream = request.stream,
        "Consulta RAG preparada"
    );
    request.messages = state.composer.compose(&request.messages, &retrieved);

    if request.stream {
        let upstream = state.gateway.stream(request).await?;
        Ok(Sse::new(sse_events(upstream))
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        let completion = state.gateway.complete(request).await?;
        Ok(Json(completion).into_response())
    }
}

// --- Streaming ---

/// Convierte el stream de la pasarela en eventos SSE: un evento por delta y
/// `[DONE]` al final. Un error a mitad de stream se envía como evento
/// `{"error": ...}` y cierra la respuesta sin `[DONE]`.
fn sse_events(upstream: ChunkStream) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold(Some(upstream), |state| async move {
        let mut upstream = state?;
        let (event, next) = match upstream.next().await {
            Some(Ok(chunk)) => (chunk_event(&chunk), Some(upstream)),
            Some(Err(err)) => {
                error!("El stream del LLM se interrumpió: {err}");
                (error_event(&err), None)
            }
            None => (Event::default().data("[DONE]"), None),
        };
        Some((Ok(event), next))
    })
}

fn chunk_event(chunk: &ChatCompletionChunk) -> Event {
    match serde_json::to_string(chunk) {
        Ok(data) => Event::default().data(data),
        Err(e) => error_event(&RagError::Json(e)),
    }
}

fn error_event(err: &RagError) -> Event {
    Event::default().data(err.to_protocol_body().to_string())
}
