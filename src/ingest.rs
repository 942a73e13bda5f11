//! Ingesta offline: ficheros de texto → chunks → embeddings → índice vectorial.
//!
//! Etapas: `Loading → Chunking → Embedding → Upserting → Done`, con `Failed`
//! alcanzable desde cualquiera. Un fallo de embeddings o de escritura aborta la
//! ejecución completa; el índice queda como lo dejó el último `upsert` correcto.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use mime_guess::MimeGuess;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{
    chunker::Chunker,
    config::IngestConfig,
    embeddings::{Embedder, OpenAiEmbedder},
    errors::{RagError, Result},
    models::{Chunk, Document, DocumentMetadata, Embedding, IndexEntry},
    vector_store::{LocalVectorIndex, VectorIndex},
};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Loading,
    Chunking,
    Embedding,
    Upserting,
    Done,
    Failed,
}

/// Resumen de los resultados de una operación de ingesta.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestionSummary {
    pub documents_found: usize,
    pub documents_ingested: usize,
    pub documents_skipped: usize,
    pub chunks_indexed: usize,
    pub entries_inserted: usize,
    pub entries_updated: usize,
    pub batches: usize,
}

/// Implementa cómo se mostrará el resumen como texto.
impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} documentos encontrados, {} ingeridos, {} omitidos. {} chunks indexados \
             ({} nuevos, {} actualizados) en {} lotes.",
            self.documents_found,
            self.documents_ingested,
            self.documents_skipped,
            self.chunks_indexed,
            self.entries_inserted,
            self.entries_updated,
            self.batches
        )
    }
}

/// Punto de entrada del subcomando `ingest`.
pub async fn run_ingestion(cfg: &IngestConfig) -> Result<IngestionSummary> {
    let embedder = OpenAiEmbedder::new(&cfg.embedding)?;
    let mut index =
        LocalVectorIndex::open_for_ingest(&cfg.index_path, &cfg.collection, embedder.model())?;

    IngestionPipeline::new(cfg.chunker, &embedder, &mut index, cfg.batch_size)
        .with_max_retries(cfg.max_retries)
        .run(&cfg.documents_root, &cfg.glob, cfg.recreate)
        .await
}

pub struct IngestionPipeline<'a> {
    chunker: Chunker,
    embedder: &'a dyn Embedder,
    index: &'a mut dyn VectorIndex,
    batch_size: usize,
    max_retries: u32,
    retry_base_delay: Duration,
    stage: IngestStage,
}

struct PendingChunk {
    chunk: Chunk,
    metadata: DocumentMetadata,
}

impl<'a> IngestionPipeline<'a> {
    pub fn new(
        chunker: Chunker,
        embedder: &'a dyn Embedder,
        index: &'a mut dyn VectorIndex,
        batch_size: usize,
    ) -> Self {
        Self {
            chunker,
            embedder,
            index,
            batch_size: batch_size.max(1),
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
            stage: IngestStage::Loading,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn stage(&self) -> IngestStage {
        self.stage
    }

    pub async fn run(
        &mut self,
        root: &Path,
        pattern: &str,
        recreate: bool,
    ) -> Result<IngestionSummary> {
        match self.run_stages(root, pattern, recreate).await {
            Ok(summary) => {
                self.enter(IngestStage::Done);
                info!("✅ Ingesta completada. {summary}");
                Ok(summary)
            }
            Err(err) => {
                let failed_in = self.stage;
                self.enter(IngestStage::Failed);
                error!(stage = ?failed_in, "Ingesta abortada: {err}");
                Err(err)
            }
        }
    }

    fn enter(&mut self, stage: IngestStage) {
        if self.stage != stage {
            debug!(from = ?self.stage, to = ?stage, "Cambio de etapa de ingesta");
            self.stage = stage;
        }
    }

    async fn run_stages(
        &mut self,
        root: &Path,
        pattern: &str,
        recreate: bool,
    ) -> Result<IngestionSummary> {
        self.enter(IngestStage::Loading);
        let paths = discover_documents(root, pattern)?;
        info!(
            "{} documentos encontrados en {} con el patrón '{pattern}'",
            paths.len(),
            root.display()
        );

        let mut summary = IngestionSummary {
            documents_found: paths.len(),
            ..IngestionSummary::default()
        };

        if recreate {
            self.index.recreate()?;
        }

        let mut pending: Vec<PendingChunk> = Vec::with_capacity(self.batch_size);

        for (position, path) in paths.iter().enumerate() {
            self.enter(IngestStage::Loading);
            let Some(document) = load_document(root, path)? else {
                summary.documents_skipped += 1;
                continue;
            };

            self.enter(IngestStage::Chunking);
            let mut produced = 0;
            for chunk in self.chunker.chunks(&document.id, &document.text) {
                if chunk.text.trim().is_empty() {
                    continue;
                }
                produced += 1;
                pending.push(PendingChunk {
                    chunk,
                    metadata: document.metadata.clone(),
                });
                if pending.len() == self.batch_size {
                    self.flush(&mut pending, &mut summary).await?;
                    self.enter(IngestStage::Chunking);
                }
            }

            if produced == 0 {
                warn!("Fichero vacío o sin texto útil: {}", path.display());
                summary.documents_skipped += 1;
            } else {
                summary.documents_ingested += 1;
                info!(
                    "[{}/{}] {} → {} chunks",
                    position + 1,
                    paths.len(),
                    document.id,
                    produced
                );
            }
        }

        self.flush(&mut pending, &mut summary).await?;
        Ok(summary)
    }

    async fn flush(
        &mut self,
        pending: &mut Vec<PendingChunk>,
        summary: &mut IngestionSummary,
    ) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }

        self.enter(IngestStage::Embedding);
        let texts: Vec<String> = pending.iter().map(|p| p.chunk.text.clone()).collect();
        let vectors = self.embed_with_retry(&texts).await?;
        if vectors.len() != pending.len() {
            return Err(RagError::Index(format!(
                "se esperaban {} embeddings y se recibieron {}",
                pending.len(),
                vectors.len()
            )));
        }

        self.enter(IngestStage::Upserting);
        let entries: Vec<IndexEntry> = pending
            .drain(..)
            .zip(vectors)
            .map(|(p, vector)| IndexEntry {
                id: p.chunk.entry_id(),
                chunk: p.chunk,
                vector,
                metadata: p.metadata,
            })
            .collect();
        let count = entries.len();
        let outcome = self.index.upsert(entries)?;

        summary.batches += 1;
        summary.chunks_indexed += count;
        summary.entries_inserted += outcome.inserted;
        summary.entries_updated += outcome.updated;
        debug!(
            batch = summary.batches,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "Lote indexado"
        );
        Ok(())
    }

    /// Reintento acotado con backoff exponencial, sólo para errores transitorios.
    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut attempt = 0;
        loop {
            match self.embedder.embed(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = match &err {
                        RagError::RateLimit {
                            retry_after_secs: Some(secs),
                            ..
                        } => Duration::from_secs(*secs),
                        _ => self.retry_base_delay.saturating_mul(2u32.saturating_pow(attempt)),
                    }
                    .min(MAX_RETRY_DELAY);
                    attempt += 1;
                    warn!(
                        attempt,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Error transitorio de embeddings ({err}); reintentando"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Enumera los ficheros bajo `root` que cumplen el patrón glob, ordenados.
///
/// Un patrón sin `/` se compara con el nombre del fichero a cualquier
/// profundidad; uno con `/` se compara con la ruta relativa a `root`.
pub fn discover_documents(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let no_documents = || RagError::NoDocumentsFound {
        root: root.to_path_buf(),
        pattern: pattern.to_string(),
    };

    if !root.is_dir() {
        warn!("La ruta no es un directorio: {}", root.display());
        return Err(no_documents());
    }

    let glob = Pattern::new(pattern)
        .map_err(|e| RagError::Configuration(format!("patrón glob inválido '{pattern}': {e}")))?;
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let by_name = !pattern.contains('/');

    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            if by_name {
                glob.matches_with(&e.file_name().to_string_lossy(), options)
            } else {
                e.path()
                    .strip_prefix(root)
                    .map(|rel| glob.matches_path_with(rel, options))
                    .unwrap_or(false)
            }
        })
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(no_documents());
    }
    Ok(paths)
}

/// Lee un fichero como texto UTF-8. Devuelve `None` (y lo registra) si no es
/// texto válido.
pub fn load_document(root: &Path, path: &Path) -> Result<Option<Document>> {
    let metadata = fs::metadata(path)?;
    let bytes = fs::read(path)?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => {
            warn!("Saltando fichero no-texto o no-UTF8: {}", path.display());
            return Ok(None);
        }
    };

    let id = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
    let mime_type = MimeGuess::from_path(path).first().map(|m| m.to_string());

    Ok(Some(Document {
        id,
        path: path.to_path_buf(),
        text,
        metadata: DocumentMetadata {
            source_path: path.to_string_lossy().to_string(),
            modified_at,
            mime_type,
            size_bytes: metadata.len(),
        },
    }))
}
