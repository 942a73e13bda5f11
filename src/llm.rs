//! Pasarela de completions hacia un backend compatible con
//! `POST /chat/completions`, con y sin streaming.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::{
    config::{self, ApiKey, LlmConfig},
    errors::{retry_after_secs, truncate_for_log, RagError, Result, Upstream},
    models::{
        new_completion_id, ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest,
        ChatCompletionResponse, ChatMessage, Role, Usage,
    },
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_BUFFER: usize = 32;

/// Secuencia de eventos de un stream. Un `Err` es terminal.
pub type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk>>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse>;

    async fn stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream>;
}

// ---------------------------------------------------------------------
// BACKEND HTTP (OpenAI, Ollama, vLLM...)
// ---------------------------------------------------------------------

pub struct OpenAiChatBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<ApiKey>,
    timeout: Duration,
}

impl OpenAiChatBackend {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        // Sin timeout global: un stream largo no debe cortarse. El timeout de
        // petición se aplica sólo a las llamadas sin streaming.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                RagError::Configuration(format!("no se pudo crear el cliente HTTP: {e}"))
            })?;

        Ok(Self {
            client,
            url: config::endpoint(&cfg.base_url, "chat/completions"),
            api_key: cfg.api_key.clone(),
            timeout: cfg.timeout,
        })
    }

    async fn send(&self, request: &ChatCompletionRequest, stream: bool) -> Result<reqwest::Response> {
        let mut body = request.clone();
        body.stream = stream;

        let mut builder = self.client.post(&self.url).json(&body);
        if !stream {
            builder = builder.timeout(self.timeout);
        }
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RagError::from_transport(Upstream::Llm, &e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after_secs(response.headers());
        let text = response.text().await.unwrap_or_default();
        warn!(
            status = status.as_u16(),
            body = %truncate_for_log(&text),
            "El backend LLM devolvió un error"
        );
        Err(RagError::from_upstream_status(
            Upstream::Llm,
            status,
            retry_after,
        ))
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatBackend {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let response = self.send(request, false).await?;
        let upstream: UpstreamCompletion = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RagError::from_transport(Upstream::Llm, &e)
            } else {
                RagError::Service {
                    upstream: Upstream::Llm,
                    message: format!("respuesta de completion no válida: {e}"),
                }
            }
        })?;
        Ok(upstream.normalize(&request.model))
    }

    async fn stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream> {
        let response = self.send(request, true).await?;

        let events = response
            .bytes_stream()
            .eventsource()
            .map(|event| match event {
                Ok(event) => Ok(event.data),
                Err(e) => Err(RagError::Service {
                    upstream: Upstream::Llm,
                    message: format!("stream SSE interrumpido: {e}"),
                }),
            })
            .boxed();

        Ok(relay_until_done(events))
    }
}

/// Convierte los `data` SSE en chunks hasta `[DONE]`. Si el backend cierra la
/// conexión sin enviarlo, el stream termina con un error: la respuesta quedó
/// incompleta.
fn relay_until_done(events: BoxStream<'static, Result<String>>) -> ChunkStream {
    stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        loop {
            let item = match events.next().await {
                Some(Ok(data)) => {
                    let data = data.trim();
                    if data == "[DONE]" {
                        return None;
                    }
                    if data.is_empty() {
                        continue;
                    }
                    parse_chunk(data)
                }
                Some(Err(err)) => Err(err),
                None => {
                    warn!("El stream del LLM terminó sin [DONE]");
                    Err(RagError::Service {
                        upstream: Upstream::Llm,
                        message: "el stream terminó antes de completarse".to_string(),
                    })
                }
            };
            let next = if item.is_ok() { Some(events) } else { None };
            return Some((item, next));
        }
    })
    .boxed()
}

/// Interpreta el `data` de un evento SSE. Algunos backends envían un objeto
/// `{"error": ...}` a mitad de stream.
fn parse_chunk(data: &str) -> Result<ChatCompletionChunk> {
    let value: Value = serde_json::from_str(data).map_err(|e| RagError::Service {
        upstream: Upstream::Llm,
        message: format!("evento de stream no válido: {e}"),
    })?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("error sin descripción");
        warn!(error = %truncate_for_log(&error.to_string()), "Error del LLM a mitad de stream");
        return Err(RagError::Service {
            upstream: Upstream::Llm,
            message: message.to_string(),
        });
    }

    serde_json::from_value(value).map_err(|e| RagError::Service {
        upstream: Upstream::Llm,
        message: format!("evento de stream no válido: {e}"),
    })
}

// --- Respuesta tolerante del backend ---

#[derive(Debug, Deserialize)]
struct UpstreamCompletion {
    id: Option<String>,
    created: Option<i64>,
    model: Option<String>,
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    index: Option<u32>,
    message: UpstreamMessage,
    finish_reason: Option<String>,
    #[serde(default)]
    logprobs: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    role: Option<Role>,
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl UpstreamCompletion {
    /// Rellena los campos que el backend omita: id, `created`, modelo,
    /// `finish_reason` y `usage`.
    fn normalize(self, requested_model: &str) -> ChatCompletionResponse {
        let usage = self.usage.unwrap_or_default();
        let prompt_tokens = usage.prompt_tokens.unwrap_or(0);
        let completion_tokens = usage.completion_tokens.unwrap_or(0);

        let choices = self
            .choices
            .into_iter()
            .enumerate()
            .map(|(position, choice)| ChatCompletionChoice {
                index: choice.index.unwrap_or(position as u32),
                message: ChatMessage::new(
                    choice.message.role.unwrap_or(Role::Assistant),
                    choice.message.content.unwrap_or_default(),
                ),
                finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
                logprobs: choice.logprobs,
            })
            .collect();

        ChatCompletionResponse {
            id: self.id.filter(|id| !id.is_empty()).unwrap_or_else(new_completion_id),
            object: "chat.completion".to_string(),
            created: self.created.unwrap_or_else(|| Utc::now().timestamp()),
            model: self
                .model
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| requested_model.to_string()),
            choices,
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: usage
                    .total_tokens
                    .unwrap_or(prompt_tokens.saturating_add(completion_tokens)),
            },
        }
    }
}

// ---------------------------------------------------------------------
// PASARELA
// ---------------------------------------------------------------------

/// Resuelve el modelo, limita la concurrencia hacia el backend y adapta el
/// stream para que se cancele cuando el cliente se desconecta.
#[derive(Clone)]
pub struct CompletionGateway {
    backend: Arc<dyn ChatBackend>,
    model_override: Option<String>,
    permits: Arc<Semaphore>,
}

impl CompletionGateway {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        model_override: Option<String>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            backend,
            model_override: model_override.filter(|m| !m.trim().is_empty()),
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.model_override.as_deref()
    }

    /// El modelo configurado tiene prioridad sobre el que pide el cliente.
    fn resolve_model(&self, mut request: ChatCompletionRequest) -> Result<ChatCompletionRequest> {
        if let Some(model) = &self.model_override {
            request.model = model.clone();
        }
        if request.model.trim().is_empty() {
            return Err(RagError::InvalidRequest(
                "falta el campo 'model' y el servidor no tiene un modelo configurado".to_string(),
            ));
        }
        Ok(request)
    }

    pub async fn complete(&self, request: ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let request = self.resolve_model(request)?;
        let _permit = self.acquire().await?;
        debug!(model = %request.model, messages = request.messages.len(), "Completion sin streaming");
        self.backend.complete(&request).await
    }

    /// Abre el stream del backend. Un error antes del primer evento se devuelve
    /// aquí, para poder responder con un código HTTP de error; después, el
    /// error viaja como último elemento del stream.
    pub async fn stream(&self, request: ChatCompletionRequest) -> Result<ChunkStream> {
        let request = self.resolve_model(request)?;
        let permit = self.acquire().await?;
        debug!(model = %request.model, messages = request.messages.len(), "Completion con streaming");

        let mut upstream = self.backend.stream(&request).await?;
        let first = match upstream.next().await {
            Some(Err(err)) => return Err(err),
            first => first,
        };

        let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let _permit = permit;
            let Some(first) = first else { return };
            if tx.send(first).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        debug!("Cliente desconectado; se cancela el stream del LLM");
                        break;
                    }
                    next = upstream.next() => match next {
                        Some(item) => {
                            let terminal = item.is_err();
                            if tx.send(item).await.is_err() || terminal {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RagError::Unavailable {
                upstream: Upstream::Llm,
                message: "la pasarela se está cerrando".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    use serde_json::{json, Map};

    use super::*;
    use crate::models::{ChatCompletionChunkChoice, ChatDelta};

    fn request(model: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::new(Role::User, "hola")],
            stream: false,
            temperature: None,
            top_p: None,
            max_tokens: None,
            extra: Map::new(),
        }
    }

    fn delta(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "chatcmpl-test".into(),
            object: "chat.completion.chunk".into(),
            created: 0,
            model: "m".into(),
            choices: vec![ChatCompletionChunkChoice {
                index: 0,
                delta: ChatDelta {
                    role: None,
                    content: Some(text.into()),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// Backend de pruebas: guarda el último modelo pedido y reproduce un guion.
    struct Scripted {
        seen_model: Mutex<Option<String>>,
        script: Vec<std::result::Result<&'static str, ()>>,
    }

    #[async_trait]
    impl ChatBackend for Scripted {
        async fn complete(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
            *self.seen_model.lock().unwrap() = Some(request.model.clone());
            let upstream: UpstreamCompletion = serde_json::from_value(json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}}]
            }))
            .unwrap();
            Ok(upstream.normalize(&request.model))
        }

        async fn stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream> {
            *self.seen_model.lock().unwrap() = Some(request.model.clone());
            let items: Vec<Result<ChatCompletionChunk>> = self
                .script
                .iter()
                .map(|step| match step {
                    Ok(text) => Ok(delta(text)),
                    Err(()) => Err(RagError::Service {
                        upstream: Upstream::Llm,
                        message: "roto".into(),
                    }),
                })
                .collect();
            Ok(futures::stream::iter(items).boxed())
        }
    }

    /// Marca el flag al soltarse: indica que el stream del backend se liberó.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Backend que genera deltas sin fin hasta que alguien suelta el stream.
    struct Endless {
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ChatBackend for Endless {
        async fn complete(&self, _: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
            Err(RagError::InvalidRequest("sólo streaming".into()))
        }

        async fn stream(&self, _: &ChatCompletionRequest) -> Result<ChunkStream> {
            let guard = DropFlag(self.dropped.clone());
            Ok(stream::unfold(guard, |guard| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some((Ok(delta("bla")), guard))
            })
            .boxed())
        }
    }

    fn gateway(
        script: Vec<std::result::Result<&'static str, ()>>,
        model: Option<&str>,
    ) -> (CompletionGateway, Arc<Scripted>) {
        let backend = Arc::new(Scripted {
            seen_model: Mutex::new(None),
            script,
        });
        (
            CompletionGateway::new(backend.clone(), model.map(str::to_string), 4),
            backend,
        )
    }

    #[test]
    fn normalization_fills_missing_fields() {
        let upstream: UpstreamCompletion = serde_json::from_value(json!({
            "choices": [{
                "message": {"content": "El cielo es azul."},
                "logprobs": {"content": []}
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5}
        }))
        .unwrap();
        let response = upstream.normalize("gpt-4o-mini");

        assert!(response.id.starts_with("chatcmpl-"));
        assert_eq!(response.object, "chat.completion");
        assert!(response.created > 0);
        assert_eq!(response.model, "gpt-4o-mini");
        assert_eq!(response.choices[0].message.role, Role::Assistant);
        assert_eq!(response.choices[0].finish_reason, "stop");
        assert_eq!(response.choices[0].logprobs, Some(json!({"content": []})));
        assert_eq!(response.usage.total_tokens, 17);
    }

    #[test]
    fn mid_stream_error_object_is_an_error() {
        assert!(parse_chunk(r#"{"error": {"message": "overloaded"}}"#).is_err());
        assert!(parse_chunk("no es json").is_err());
        let chunk = parse_chunk(r#"{"id":"x","choices":[{"index":0,"delta":{"content":"Hola"}}]}"#)
            .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hola"));
        assert_eq!(chunk.object, "chat.completion.chunk");
    }

    #[tokio::test]
    async fn events_stop_at_done_marker() {
        let events = stream::iter(vec![
            Ok(r#"{"id":"x","choices":[{"index":0,"delta":{"content":"Hola"}}]}"#.to_string()),
            Ok(String::new()),
            Ok("[DONE]".to_string()),
            Ok("no debería leerse".to_string()),
        ])
        .boxed();
        let items: Vec<_> = relay_until_done(events).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[tokio::test]
    async fn events_without_done_end_with_an_error() {
        let events = stream::iter(vec![Ok(
            r#"{"id":"x","choices":[{"index":0,"delta":{"content":"Hola"}}]}"#.to_string(),
        )])
        .boxed();
        let items: Vec<_> = relay_until_done(events).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(RagError::Service { .. })));
    }

    #[tokio::test]
    async fn configured_model_overrides_the_caller() {
        let (gateway, backend) = gateway(vec![], Some("servidor"));
        gateway.complete(request("cliente")).await.unwrap();
        assert_eq!(backend.seen_model.lock().unwrap().as_deref(), Some("servidor"));
    }

    #[tokio::test]
    async fn missing_model_is_rejected() {
        let (gateway, _) = gateway(vec![], None);
        assert!(matches!(
            gateway.complete(request("")).await,
            Err(RagError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn error_before_first_delta_fails_the_call() {
        let (gateway, _) = gateway(vec![Err(())], Some("m"));
        assert!(matches!(
            gateway.stream(request("m")).await,
            Err(RagError::Service { .. })
        ));
    }

    #[tokio::test]
    async fn error_after_first_delta_ends_the_stream() {
        let (gateway, _) = gateway(vec![Ok("Hola"), Ok(" mundo"), Err(()), Ok("nunca")], Some("m"));
        let items: Vec<_> = gateway.stream(request("m")).await.unwrap().collect().await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].is_ok());
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn dropped_stream_cancels_upstream_and_frees_permit() {
        let dropped = Arc::new(AtomicBool::new(false));
        let backend = Arc::new(Endless {
            dropped: dropped.clone(),
        });
        let gateway = CompletionGateway::new(backend, Some("m".into()), 1);

        let mut first = gateway.stream(request("m")).await.unwrap();
        assert!(first.next().await.unwrap().is_ok());
        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(2), gateway.stream(request("m"))).await;
        assert!(matches!(second, Ok(Ok(_))), "el permiso no se liberó");
        assert!(dropped.load(Ordering::SeqCst));
    }
}
