//! Carga y validación de la configuración (CLI + variables de entorno).
//!
//! `clap` resuelve cada opción desde la línea de comandos o, en su defecto,
//! desde el entorno (con `.env` cargado previamente por `dotenvy`). Después se
//! valida todo una sola vez y se congela en `IngestConfig` / `ServeConfig`.

use std::{env, fmt, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use url::{Host, Url};

use crate::{
    chunker::Chunker,
    errors::{RagError, Result},
};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_EMBEDDING_BATCH: usize = 2048;
const INGEST_EMBEDDING_TIMEOUT_SECS: u64 = 60;

#[derive(Parser, Debug)]
#[command(
    name = "rag_chat_gateway",
    version,
    about = "Ingesta de documentos y pasarela RAG compatible con chat completions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Indexa los ficheros de texto en el índice vectorial local.
    Ingest(IngestArgs),
    /// Arranca el servidor HTTP con `/v1/chat/completions`.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct EmbeddingArgs {
    #[arg(long, env = "EMBEDDING_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub embedding_base_url: String,

    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// Si no se indica se usa `OPENAI_API_KEY`.
    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    pub embedding_api_key: Option<String>,

    /// Dimensión esperada de los vectores; se comprueba en cada respuesta.
    #[arg(long, env = "EMBEDDING_DIMENSIONS")]
    pub embedding_dimensions: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, env = "RAG_DOCUMENTS_ROOT", default_value = "./documents")]
    pub documents_root: PathBuf,

    #[arg(long, env = "RAG_DOCUMENTS_GLOB", default_value = "**/*.txt")]
    pub glob: String,

    #[arg(long, env = "RAG_INDEX_PATH", default_value = "./rag_index.json")]
    pub index_path: PathBuf,

    #[arg(long, env = "RAG_COLLECTION", default_value = "documents")]
    pub collection: String,

    /// Tamaño máximo de cada chunk, en caracteres.
    #[arg(long, env = "RAG_CHUNK_SIZE", default_value_t = 1000)]
    pub chunk_size: usize,

    /// Caracteres compartidos entre chunks consecutivos.
    #[arg(long, env = "RAG_CHUNK_OVERLAP", default_value_t = 200)]
    pub chunk_overlap: usize,

    #[arg(long, env = "RAG_BATCH_SIZE", default_value_t = 64)]
    pub batch_size: usize,

    /// Reintentos ante errores transitorios (rate limit, timeouts).
    #[arg(long, env = "RAG_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Borra y reconstruye la colección antes de indexar.
    #[arg(long)]
    pub recreate: bool,

    #[command(flatten)]
    pub embedding: EmbeddingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "RAG_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "RAG_PORT", default_value_t = 3322)]
    pub port: u16,

    #[arg(long, env = "RAG_INDEX_PATH", default_value = "./rag_index.json")]
    pub index_path: PathBuf,

    #[arg(long, env = "RAG_COLLECTION", default_value = "documents")]
    pub collection: String,

    #[arg(long, env = "LLM_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub llm_base_url: String,

    /// Si se indica, sustituye al `model` que envía el cliente.
    #[arg(long, env = "LLM_MODEL")]
    pub llm_model: Option<String>,

    /// Si no se indica se usa `OPENAI_API_KEY`.
    #[arg(long, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Secreto compartido exigido a los clientes (opcional).
    #[arg(long, env = "RAG_API_SECRET", hide_env_values = true)]
    pub api_secret: Option<String>,

    #[arg(long, env = "RAG_TOP_K", default_value_t = 4)]
    pub top_k: usize,

    /// Presupuesto de caracteres del bloque de contexto.
    #[arg(long, env = "RAG_MAX_CONTEXT_CHARS", default_value_t = 6000)]
    pub max_context_chars: usize,

    #[arg(long, env = "RAG_MAX_CONCURRENCY", default_value_t = 64)]
    pub max_concurrency: usize,

    #[arg(long, env = "RAG_REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    pub request_timeout_secs: u64,

    #[command(flatten)]
    pub embedding: EmbeddingArgs,
}

/// Credencial que nunca aparece en los logs.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub base_url: Url,
    pub model: String,
    pub api_key: Option<ApiKey>,
    pub dimensions: Option<usize>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub base_url: Url,
    pub model: Option<String>,
    pub api_key: Option<ApiKey>,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub documents_root: PathBuf,
    pub glob: String,
    pub index_path: PathBuf,
    pub collection: String,
    pub chunker: Chunker,
    pub batch_size: usize,
    pub max_retries: u32,
    pub recreate: bool,
    pub embedding: EmbeddingConfig,
}

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub index_path: PathBuf,
    pub collection: String,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub max_concurrency: usize,
    pub api_secret: Option<ApiKey>,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

impl EmbeddingArgs {
    fn resolve(self, fallback_key: Option<String>, timeout: Duration) -> Result<EmbeddingConfig> {
        let base_url = parse_endpoint("embeddings", &self.embedding_base_url)?;
        let api_key = require_key(
            "embeddings",
            &base_url,
            self.embedding_api_key.or(fallback_key),
        )?;
        if self.embedding_model.trim().is_empty() {
            return Err(RagError::Configuration(
                "falta el modelo de embeddings".to_string(),
            ));
        }
        if self.embedding_dimensions == Some(0) {
            return Err(RagError::Configuration(
                "la dimensión de embedding debe ser mayor que cero".to_string(),
            ));
        }
        Ok(EmbeddingConfig {
            base_url,
            model: self.embedding_model,
            api_key,
            dimensions: self.embedding_dimensions,
            timeout,
        })
    }
}

impl IngestArgs {
    pub fn into_config(self) -> Result<IngestConfig> {
        let fallback = env::var("OPENAI_API_KEY").ok();
        self.into_config_with_fallback(fallback)
    }

    fn into_config_with_fallback(self, fallback_key: Option<String>) -> Result<IngestConfig> {
        let chunker = Chunker::new(self.chunk_size, self.chunk_overlap)?;
        if self.batch_size == 0 || self.batch_size > MAX_EMBEDDING_BATCH {
            return Err(RagError::Configuration(format!(
                "el tamaño de lote debe estar entre 1 y {MAX_EMBEDDING_BATCH}"
            )));
        }
        glob::Pattern::new(&self.glob).map_err(|e| {
            RagError::Configuration(format!("patrón glob inválido '{}': {e}", self.glob))
        })?;
        validate_collection(&self.collection)?;

        let embedding = self.embedding.resolve(
            fallback_key,
            Duration::from_secs(INGEST_EMBEDDING_TIMEOUT_SECS),
        )?;

        Ok(IngestConfig {
            documents_root: self.documents_root,
            glob: self.glob,
            index_path: self.index_path,
            collection: self.collection,
            chunker,
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            recreate: self.recreate,
            embedding,
        })
    }
}

impl ServeArgs {
    pub fn into_config(self) -> Result<ServeConfig> {
        let fallback = env::var("OPENAI_API_KEY").ok();
        self.into_config_with_fallback(fallback)
    }

    fn into_config_with_fallback(self, fallback_key: Option<String>) -> Result<ServeConfig> {
        if self.host.trim().is_empty() {
            return Err(RagError::Configuration(
                "falta el host de escucha".to_string(),
            ));
        }

        for (name, value) in [
            ("top-k", self.top_k),
            ("max-context-chars", self.max_context_chars),
            ("max-concurrency", self.max_concurrency),
        ] {
            if value == 0 {
                return Err(RagError::Configuration(format!(
                    "{name} debe ser mayor que cero"
                )));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(RagError::Configuration(
                "request-timeout-secs debe ser mayor que cero".to_string(),
            ));
        }
        validate_collection(&self.collection)?;

        let timeout = Duration::from_secs(self.request_timeout_secs);
        let embedding = self.embedding.resolve(fallback_key.clone(), timeout)?;

        let llm_base_url = parse_endpoint("LLM", &self.llm_base_url)?;
        let llm_api_key = require_key("LLM", &llm_base_url, self.llm_api_key.or(fallback_key))?;
        let llm = LlmConfig {
            base_url: llm_base_url,
            model: self.llm_model.filter(|m| !m.trim().is_empty()),
            api_key: llm_api_key,
            timeout,
        };

        let api_secret = self
            .api_secret
            .filter(|s| !s.is_empty())
            .map(ApiKey::new);

        Ok(ServeConfig {
            host: self.host,
            port: self.port,
            index_path: self.index_path,
            collection: self.collection,
            top_k: self.top_k,
            max_context_chars: self.max_context_chars,
            max_concurrency: self.max_concurrency,
            api_secret,
            embedding,
            llm,
        })
    }
}

fn parse_endpoint(name: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| RagError::Configuration(format!("URL de {name} inválida '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RagError::Configuration(format!(
            "la URL de {name} debe usar http o https: {raw}"
        )));
    }
    Ok(url)
}

/// Los endpoints locales (p. ej. Ollama) pueden funcionar sin credenciales.
fn require_key(name: &str, url: &Url, key: Option<String>) -> Result<Option<ApiKey>> {
    match key.filter(|k| !k.trim().is_empty()) {
        Some(key) => Ok(Some(ApiKey::new(key))),
        None if is_loopback(url) => Ok(None),
        None => Err(RagError::Configuration(format!(
            "falta la API key del servicio de {name} ({url})"
        ))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn validate_collection(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(RagError::Configuration(
            "el nombre de la colección no puede estar vacío".to_string(),
        ));
    }
    Ok(())
}

/// Une la URL base de un proveedor con la ruta de un endpoint, conservando
/// cualquier prefijo (`/v1`, `/api/v1`...).
pub fn endpoint(base: &Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path.trim_start_matches('/'))
}
