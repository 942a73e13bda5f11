//! Cliente de embeddings para endpoints compatibles con `POST /embeddings`
//! (OpenAI, Ollama, vLLM...).
//!
//! Es un adaptador puro: no reintenta. Los reintentos acotados los decide
//! quien lo llama (la ingesta), y sólo ante errores transitorios.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::{self, ApiKey, EmbeddingConfig},
    errors::{retry_after_secs, truncate_for_log, RagError, Result, Upstream},
    models::Embedding,
};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Nombre del modelo; se guarda en la colección para no mezclar linajes.
    fn model(&self) -> &str;

    /// Devuelve un vector por texto, en el mismo orden.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>>;
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<ApiKey>,
    dimensions: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(cfg: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| {
                RagError::Configuration(format!("no se pudo crear el cliente HTTP: {e}"))
            })?;

        Ok(Self {
            client,
            url: config::endpoint(&cfg.base_url, "embeddings"),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
            dimensions: cfg.dimensions,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(RagError::InvalidRequest(
                "no se pueden calcular embeddings de textos vacíos".to_string(),
            ));
        }

        let mut request = self.client.post(&self.url).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|e| RagError::from_transport(Upstream::Embeddings, &e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_secs(response.headers());
            let body = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                body = %truncate_for_log(&body),
                "El servicio de embeddings devolvió un error"
            );
            return Err(RagError::from_upstream_status(
                Upstream::Embeddings,
                status,
                retry_after,
            ));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| RagError::Service {
            upstream: Upstream::Embeddings,
            message: format!("respuesta de embeddings no válida: {e}"),
        })?;

        if parsed.data.len() != texts.len() {
            return Err(RagError::Service {
                upstream: Upstream::Embeddings,
                message: format!(
                    "número de embeddings ({}) distinto al número de textos ({})",
                    parsed.data.len(),
                    texts.len()
                ),
            });
        }

        let mut data = parsed.data;
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }
        let vectors: Vec<Embedding> = data.into_iter().map(|d| d.embedding).collect();

        let dimension = check_dimensions(&vectors, self.dimensions)?;
        debug!(count = vectors.len(), dimension, model = %self.model, "Embeddings calculados");
        Ok(vectors)
    }
}

/// Comprueba que todos los vectores comparten dimensión (y que coincide con
/// la esperada, si se conoce). Devuelve la dimensión común.
pub fn check_dimensions(vectors: &[Embedding], expected: Option<usize>) -> Result<usize> {
    let Some(first) = vectors.first() else {
        return Ok(expected.unwrap_or(0));
    };
    let expected = expected.unwrap_or(first.len());
    if expected == 0 {
        return Err(RagError::Service {
            upstream: Upstream::Embeddings,
            message: "el servicio devolvió un vector vacío".to_string(),
        });
    }
    for vector in vectors {
        if vector.len() != expected {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
    }
    Ok(expected)
}
