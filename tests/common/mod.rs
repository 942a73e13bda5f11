#![allow(dead_code)]

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Map;

use rag_chat_gateway::{
    app_state::AppState,
    auth::AuthGate,
    config::ApiKey,
    embeddings::Embedder,
    errors::{RagError, Result, Upstream},
    llm::{ChatBackend, ChunkStream, CompletionGateway},
    models::{
        ChatCompletionChoice, ChatCompletionChunk, ChatCompletionChunkChoice,
        ChatCompletionRequest, ChatCompletionResponse, ChatDelta, ChatMessage, Embedding, Role,
        Usage,
    },
    prompt::PromptComposer,
    rag::Retriever,
    vector_store::VectorIndex,
};

pub const SECRET: &str = "s3cret";
const HASH_DIMENSIONS: usize = 1024;

/// Embedder determinista de bolsa de palabras: textos que comparten palabras
/// quedan cerca en el espacio vectorial.
#[derive(Default)]
pub struct HashingEmbedder {
    pub calls: AtomicUsize,
}

impl HashingEmbedder {
    pub fn vector(text: &str) -> Embedding {
        let mut vector = vec![0.0f32; HASH_DIMENSIONS];
        for word in text.split_whitespace() {
            let word: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(char::to_lowercase)
                .collect();
            if word.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            vector[(hasher.finish() as usize) % HASH_DIMENSIONS] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model(&self) -> &str {
        "hashing-test"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Embedder que falla con un error transitorio las primeras `failures` veces.
pub struct FlakyEmbedder {
    pub inner: HashingEmbedder,
    pub failures: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: HashingEmbedder::default(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RagError::Unavailable {
                upstream: Upstream::Embeddings,
                message: "HTTP 503".into(),
            });
        }
        self.inner.embed(texts).await
    }
}

/// Paso de un stream guionizado.
#[derive(Clone, Debug)]
pub enum Step {
    Delta(&'static str),
    Fail,
}

/// Backend de chat que guarda la última petición y responde con un guion.
pub struct ScriptedBackend {
    pub answer: String,
    pub script: Vec<Step>,
    pub last_request: Mutex<Option<ChatCompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(answer: &str, script: Vec<Step>) -> Self {
        Self {
            answer: answer.to_string(),
            script,
            last_request: Mutex::new(None),
        }
    }

    pub fn last_request(&self) -> ChatCompletionRequest {
        self.last_request
            .lock()
            .unwrap()
            .clone()
            .expect("el backend no recibió ninguna petición")
    }
}

fn delta_chunk(text: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: "chatcmpl-scripted".into(),
        object: "chat.completion.chunk".into(),
        created: 1_700_000_000,
        model: "scripted".into(),
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

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        *self.last_request.lock().unwrap() = Some(request.clone());
        Ok(ChatCompletionResponse {
            id: "chatcmpl-scripted".into(),
            object: "chat.completion".into(),
            created: 1_700_000_000,
            model: request.model.clone(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: ChatMessage::new(Role::Assistant, self.answer.clone()),
                finish_reason: "stop".into(),
                logprobs: None,
            }],
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 4,
                total_tokens: 14,
            },
        })
    }

    async fn stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream> {
        *self.last_request.lock().unwrap() = Some(request.clone());
        let items: Vec<Result<ChatCompletionChunk>> = self
            .script
            .iter()
            .map(|step| match step {
                Step::Delta(text) => Ok(delta_chunk(text)),
                Step::Fail => Err(RagError::Service {
                    upstream: Upstream::Llm,
                    message: "conexión cortada".into(),
                }),
            })
            .collect();
        Ok(futures::stream::iter(items).boxed())
    }
}

pub fn chat_request(question: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: "gpt-4o-mini".into(),
        messages: vec![ChatMessage::new(Role::User, question)],
        stream: false,
        temperature: None,
        top_p: None,
        max_tokens: None,
        extra: Map::new(),
    }
}

pub fn write_file(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

/// Estado de la aplicación con dobles de prueba y secreto `SECRET`.
pub fn app_state(index: Arc<dyn VectorIndex>, backend: Arc<ScriptedBackend>) -> AppState {
    AppState::new(
        Retriever::new(Arc::new(HashingEmbedder::default()), index),
        PromptComposer::new(2000),
        CompletionGateway::new(backend, None, 8),
        AuthGate::new(Some(&ApiKey::new(SECRET))),
        1,
    )
}
