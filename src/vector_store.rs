//! Índice vectorial local persistido en un único fichero JSON.
//!
//! API pública:
//!   - `VectorIndex` (upsert / search / recreate), implementado por `LocalVectorIndex`.
//!   - `LocalVectorIndex::open_for_ingest` (lectura/escritura, crea el fichero si falta).
//!   - `LocalVectorIndex::open_read_only` (servidor; falla si el fichero no existe).
//!
//! El fichero puede contener varias colecciones; cada una registra el modelo de
//! embeddings y la dimensión con que se construyó.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    errors::{RagError, Result},
    models::{IndexEntry, ScoredChunk},
};

const FORMAT_VERSION: u32 = 1;

pub trait VectorIndex: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimensión de los vectores almacenados (`None` si la colección está vacía).
    fn dimension(&self) -> Option<usize>;

    /// Inserta o sustituye entradas por identificador.
    fn upsert(&mut self, entries: Vec<IndexEntry>) -> Result<UpsertOutcome>;

    /// Como mucho `k` resultados por similitud coseno descendente; los empates
    /// conservan el orden de inserción.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>>;

    /// Destruye y reinicializa la colección.
    fn recreate(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    format_version: u32,
    collections: BTreeMap<String, Collection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Collection {
    #[serde(default)]
    embedding_model: Option<String>,
    #[serde(default)]
    dimension: Option<usize>,
    #[serde(default)]
    entries: Vec<IndexEntry>,
}

pub struct LocalVectorIndex {
    path: Option<PathBuf>,
    collection: String,
    writer_model: Option<String>,
    file: IndexFile,
    positions: HashMap<String, usize>,
}

impl LocalVectorIndex {
    /// Índice sin fichero, útil en tests y herramientas.
    pub fn in_memory(collection: &str, embedding_model: Option<&str>) -> Self {
        let mut file = IndexFile {
            format_version: FORMAT_VERSION,
            ..IndexFile::default()
        };
        file.collections
            .insert(collection.to_string(), Collection::default());
        Self {
            path: None,
            collection: collection.to_string(),
            writer_model: embedding_model.map(str::to_string),
            file,
            positions: HashMap::new(),
        }
    }

    /// Abre (o prepara) el índice para la ingesta. El fichero se escribe en el
    /// primer `upsert` o `recreate`.
    pub fn open_for_ingest(path: &Path, collection: &str, embedding_model: &str) -> Result<Self> {
        let mut file = if path.exists() {
            read_index_file(path)?
        } else {
            info!("El índice {} no existe; se creará.", path.display());
            IndexFile {
                format_version: FORMAT_VERSION,
                ..IndexFile::default()
            }
        };
        file.collections.entry(collection.to_string()).or_default();

        let mut index = Self {
            path: Some(path.to_path_buf()),
            collection: collection.to_string(),
            writer_model: Some(embedding_model.to_string()),
            file,
            positions: HashMap::new(),
        };
        index.rebuild_positions();
        Ok(index)
    }

    /// Abre el índice para consultas. No crea nada: si el fichero o la
    /// colección no existen devuelve `IndexNotFound`.
    pub fn open_read_only(path: &Path, collection: &str) -> Result<Self> {
        if !path.is_file() {
            return Err(RagError::IndexNotFound(path.to_path_buf()));
        }
        let file = read_index_file(path)?;
        if !file.collections.contains_key(collection) {
            warn!(
                "La colección '{collection}' no existe en {}",
                path.display()
            );
            return Err(RagError::IndexNotFound(path.to_path_buf()));
        }

        let mut index = Self {
            path: Some(path.to_path_buf()),
            collection: collection.to_string(),
            writer_model: None,
            file,
            positions: HashMap::new(),
        };
        index.rebuild_positions();
        info!(
            "Índice {} abierto: colección '{}' con {} entradas (modelo {:?}).",
            path.display(),
            collection,
            index.len(),
            index.embedding_model()
        );
        Ok(index)
    }

    /// Modelo de embeddings con que se construyó la colección.
    pub fn embedding_model(&self) -> Option<&str> {
        self.current().embedding_model.as_deref()
    }

    fn current(&self) -> &Collection {
        &self.file.collections[&self.collection]
    }

    fn current_mut(&mut self) -> &mut Collection {
        self.file
            .collections
            .entry(self.collection.clone())
            .or_default()
    }

    fn rebuild_positions(&mut self) {
        self.positions = self
            .current()
            .entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| (entry.id.clone(), pos))
            .collect();
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        {
            let mut writer = BufWriter::new(fs::File::create(&tmp_path)?);
            serde_json::to_writer(&mut writer, &self.file)?;
            writer.flush()?;
        }
        fs::rename(&tmp_path, path)?;
        debug!("Índice guardado en {}", path.display());
        Ok(())
    }
}

impl VectorIndex for LocalVectorIndex {
    fn len(&self) -> usize {
        self.current().entries.len()
    }

    fn dimension(&self) -> Option<usize> {
        self.current().dimension
    }

    fn upsert(&mut self, entries: Vec<IndexEntry>) -> Result<UpsertOutcome> {
        if entries.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let writer_model = self.writer_model.clone();
        let collection_name = self.collection.clone();
        let collection = self.current_mut();

        if let (Some(stored), Some(writer)) = (&collection.embedding_model, &writer_model) {
            if stored != writer && !collection.entries.is_empty() {
                return Err(RagError::Index(format!(
                    "la colección '{collection_name}' se construyó con el modelo '{stored}' y no admite \
                     vectores de '{writer}' (use --recreate)"
                )));
            }
        }

        let dimension = collection
            .dimension
            .filter(|_| !collection.entries.is_empty())
            .unwrap_or(entries[0].vector.len());
        if dimension == 0 {
            return Err(RagError::Index("no se admiten vectores vacíos".to_string()));
        }
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != dimension) {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: bad.vector.len(),
            });
        }

        collection.dimension = Some(dimension);
        if writer_model.is_some() {
            collection.embedding_model = writer_model;
        }

        let mut outcome = UpsertOutcome::default();
        for entry in entries {
            let existing = self.positions.get(&entry.id).copied();
            match existing {
                Some(pos) => {
                    self.current_mut().entries[pos] = entry;
                    outcome.updated += 1;
                }
                None => {
                    let id = entry.id.clone();
                    let collection = self.current_mut();
                    collection.entries.push(entry);
                    let pos = collection.entries.len() - 1;
                    self.positions.insert(id, pos);
                    outcome.inserted += 1;
                }
            }
        }

        self.persist()?;
        Ok(outcome)
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>> {
        let collection = self.current();
        if k == 0 || collection.entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dimension) = collection.dimension {
            if query.len() != dimension {
                return Err(RagError::DimensionMismatch {
                    expected: dimension,
                    actual: query.len(),
                });
            }
        }

        let query_norm = norm(query);
        let mut scored: Vec<(usize, f32)> = collection
            .entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| (pos, cosine(query, query_norm, &entry.vector)))
            .collect();

        // sort_by es estable: a igual puntuación se mantiene el orden de inserción
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(pos, score)| ScoredChunk {
                chunk: collection.entries[pos].chunk.clone(),
                score,
            })
            .collect())
    }

    fn recreate(&mut self) -> Result<()> {
        info!("Recreando la colección '{}'", self.collection);
        *self.current_mut() = Collection::default();
        self.positions.clear();
        self.persist()
    }
}

fn read_index_file(path: &Path) -> Result<IndexFile> {
    let reader = BufReader::new(fs::File::open(path)?);
    let file: IndexFile = serde_json::from_reader(reader).map_err(|e| {
        RagError::Index(format!("fichero de índice corrupto {}: {e}", path.display()))
    })?;
    if file.format_version > FORMAT_VERSION {
        return Err(RagError::Index(format!(
            "versión de formato {} no soportada (máximo {FORMAT_VERSION})",
            file.format_version
        )));
    }
    Ok(file)
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(query: &[f32], query_norm: f32, vector: &[f32]) -> f32 {
    let denom = query_norm * norm(vector);
    if denom == 0.0 {
        return 0.0;
    }
    let dot: f32 = query.iter().zip(vector).map(|(a, b)| a * b).sum();
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, DocumentMetadata};

    fn entry(doc: &str, index: usize, vector: Vec<f32>) -> IndexEntry {
        let chunk = Chunk {
            document_id: doc.to_string(),
            index,
            text: format!("{doc}-{index}"),
            start: 0,
            end: 1,
        };
        IndexEntry {
            id: chunk.entry_id(),
            chunk,
            vector,
            metadata: DocumentMetadata {
                source_path: doc.to_string(),
                ..DocumentMetadata::default()
            },
        }
    }

    fn texts(results: &[ScoredChunk]) -> Vec<&str> {
        results.iter().map(|r| r.chunk.text.as_str()).collect()
    }

    #[test]
    fn search_orders_by_similarity_and_keeps_insertion_order_on_ties() {
        let mut index = LocalVectorIndex::in_memory("docs", Some("m"));
        index
            .upsert(vec![
                entry("a", 0, vec![0.0, 1.0]),
                entry("b", 0, vec![1.0, 0.0]),
                entry("c", 0, vec![2.0, 0.0]),
                entry("d", 0, vec![1.0, 1.0]),
            ])
            .unwrap();

        let results = index.search(&[1.0, 0.0], 10).unwrap();
        assert_eq!(texts(&results), vec!["b-0", "c-0", "d-0", "a-0"]);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }

        let top = index.search(&[1.0, 0.0], 1).unwrap();
        assert_eq!(texts(&top), vec!["b-0"]);
        assert!(index.search(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn upsert_is_idempotent_by_id() {
        let mut index = LocalVectorIndex::in_memory("docs", Some("m"));
        let first = index
            .upsert(vec![entry("a", 0, vec![1.0, 0.0]), entry("a", 1, vec![0.0, 1.0])])
            .unwrap();
        assert_eq!(first, UpsertOutcome { inserted: 2, updated: 0 });

        let again = index
            .upsert(vec![entry("a", 0, vec![1.0, 0.0]), entry("a", 1, vec![0.0, 1.0])])
            .unwrap();
        assert_eq!(again, UpsertOutcome { inserted: 0, updated: 2 });
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn empty_index_returns_no_results() {
        let index = LocalVectorIndex::in_memory("docs", None);
        assert!(index.is_empty());
        assert!(index.search(&[0.3, 0.4, 0.5], 5).unwrap().is_empty());
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let mut index = LocalVectorIndex::in_memory("docs", Some("m"));
        index.upsert(vec![entry("a", 0, vec![1.0, 0.0, 0.0])]).unwrap();

        assert!(matches!(
            index.search(&[1.0, 0.0], 3),
            Err(RagError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert!(matches!(
            index.upsert(vec![entry("b", 0, vec![1.0])]),
            Err(RagError::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn persists_and_reopens_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.json");

        let mut index = LocalVectorIndex::open_for_ingest(&path, "docs", "model-a").unwrap();
        index
            .upsert(vec![entry("a", 0, vec![0.6, 0.8]), entry("b", 0, vec![0.8, 0.6])])
            .unwrap();
        assert!(path.is_file());

        let reopened = LocalVectorIndex::open_read_only(&path, "docs").unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.dimension(), Some(2));
        assert_eq!(reopened.embedding_model(), Some("model-a"));
        let results = reopened.search(&[0.6, 0.8], 1).unwrap();
        assert_eq!(texts(&results), vec!["a-0"]);
    }

    #[test]
    fn read_only_open_of_missing_index_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        assert!(matches!(
            LocalVectorIndex::open_read_only(&path, "docs"),
            Err(RagError::IndexNotFound(_))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn model_change_requires_recreate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let mut index = LocalVectorIndex::open_for_ingest(&path, "docs", "model-a").unwrap();
        index.upsert(vec![entry("a", 0, vec![1.0, 0.0])]).unwrap();

        let mut other = LocalVectorIndex::open_for_ingest(&path, "docs", "model-b").unwrap();
        assert!(matches!(
            other.upsert(vec![entry("a", 0, vec![1.0, 0.0, 0.0])]),
            Err(RagError::Index(_))
        ));

        other.recreate().unwrap();
        assert!(other.is_empty());
        other.upsert(vec![entry("a", 0, vec![1.0, 0.0, 0.0])]).unwrap();
        assert_eq!(other.dimension(), Some(3));
        assert_eq!(other.embedding_model(), Some("model-b"));
    }

    #[test]
    fn collections_in_the_same_file_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");

        let mut first = LocalVectorIndex::open_for_ingest(&path, "uno", "m").unwrap();
        first.upsert(vec![entry("a", 0, vec![1.0, 0.0])]).unwrap();
        let mut second = LocalVectorIndex::open_for_ingest(&path, "dos", "m").unwrap();
        second.recreate().unwrap();

        assert_eq!(LocalVectorIndex::open_read_only(&path, "uno").unwrap().len(), 1);
        assert!(LocalVectorIndex::open_read_only(&path, "dos").unwrap().is_empty());
    }
}
