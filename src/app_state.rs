use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    auth::AuthGate,
    config::ServeConfig,
    embeddings::OpenAiEmbedder,
    errors::Result,
    llm::{CompletionGateway, OpenAiChatBackend},
    prompt::PromptComposer,
    rag::Retriever,
    vector_store::{LocalVectorIndex, VectorIndex},
};

/// Estado compartido por los handlers. Es inmutable tras el arranque.
#[derive(Clone)]
pub struct AppState {
    pub retriever: Retriever,
    pub composer: PromptComposer,
    pub gateway: CompletionGateway,
    pub auth: AuthGate,
    pub top_k: usize,
}

impl AppState {
    pub fn new(
        retriever: Retriever,
        composer: PromptComposer,
        gateway: CompletionGateway,
        auth: AuthGate,
        top_k: usize,
    ) -> Self {
        Self {
            retriever,
            composer,
            gateway,
            auth,
            top_k,
        }
    }

    /// Abre el índice en sólo lectura y construye los clientes. Falla antes de
    /// escuchar en el puerto si el índice no existe.
    pub fn initialize(cfg: &ServeConfig) -> Result<Self> {
        let index = LocalVectorIndex::open_read_only(&cfg.index_path, &cfg.collection)?;
        info!(
            "Índice cargado: {} (colección '{}', {} entradas)",
            cfg.index_path.display(),
            cfg.collection,
            index.len()
        );

        if let Some(indexed_with) = index.embedding_model() {
            if indexed_with != cfg.embedding.model {
                warn!(
                    "El índice se generó con '{indexed_with}' pero se consultará con '{}'",
                    cfg.embedding.model
                );
            }
        }

        let embedder = OpenAiEmbedder::new(&cfg.embedding)?;
        let backend = OpenAiChatBackend::new(&cfg.llm)?;
        let auth = AuthGate::new(cfg.api_secret.as_ref());
        if !auth.is_enabled() {
            warn!("Sin RAG_API_SECRET: las rutas /v1 quedan abiertas");
        }

        Ok(Self::new(
            Retriever::new(Arc::new(embedder), Arc::new(index)),
            PromptComposer::new(cfg.max_context_chars),
            CompletionGateway::new(Arc::new(backend), cfg.llm.model.clone(), cfg.max_concurrency),
            auth,
            cfg.top_k,
        ))
    }
}
