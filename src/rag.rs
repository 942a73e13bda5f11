//! Recuperación: embebe la consulta y devuelve los `k` chunks más similares.

use std::sync::Arc;

use tracing::debug;

use crate::{
    embeddings::{check_dimensions, Embedder},
    errors::{RagError, Result, Upstream},
    models::ScoredChunk,
    vector_store::VectorIndex,
};

#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedder, index }
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// Devuelve como mucho `k` chunks ordenados por similitud descendente.
    ///
    /// Con el índice vacío, `k = 0` o una consulta en blanco no se llama al
    /// servicio de embeddings.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        if k == 0 || self.index.is_empty() || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = self.embedder.embed(&[query.to_string()]).await?;
        check_dimensions(&vectors, self.index.dimension())?;
        let query_vector = vectors.pop().ok_or_else(|| RagError::Service {
            upstream: Upstream::Embeddings,
            message: "no se recibió el embedding de la consulta".to_string(),
        })?;

        let results = self.index.search(&query_vector, k)?;
        debug!(
            k,
            found = results.len(),
            top_score = results.first().map(|r| r.score),
            "Chunks recuperados"
        );
        Ok(results)
    }
}
