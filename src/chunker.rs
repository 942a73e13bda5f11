//! División de documentos en trozos solapados de tamaño acotado.
//!
//! El tamaño y el solape se miden en caracteres. Dentro de cada ventana se
//! corta preferentemente en un límite de párrafo (`\n\n`), después en un fin
//! de frase (`.`, `?`, `!` seguidos de espacio, o un salto de línea) y, si no
//! hay ninguno, a tamaño fijo.

use crate::{
    errors::{RagError, Result},
    models::Chunk,
};

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::Configuration(
                "el tamaño de chunk debe ser mayor que cero".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(RagError::Configuration(format!(
                "el solape ({overlap}) debe ser menor que el tamaño de chunk ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Secuencia perezosa de chunks. Cada llamada empieza desde el principio
    /// del texto; el iterador también es `Clone`.
    pub fn chunks<'a>(&self, document_id: &'a str, text: &'a str) -> Chunks<'a> {
        Chunks {
            document_id,
            text,
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            byte_pos: 0,
            char_pos: 0,
            index: 0,
            finished: text.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    document_id: &'a str,
    text: &'a str,
    chunk_size: usize,
    overlap: usize,
    byte_pos: usize,
    char_pos: usize,
    index: usize,
    finished: bool,
}

impl Chunks<'_> {
    /// Un límite sólo cuenta si deja avanzar más allá del solape y no produce
    /// un chunk demasiado pequeño.
    fn min_boundary(&self) -> usize {
        (self.overlap + 1).max(self.chunk_size / 2)
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.finished {
            return None;
        }

        let min_boundary = self.min_boundary();
        let rest = &self.text[self.byte_pos..];

        // bounds[n] = offset en bytes tras consumir n caracteres de la ventana
        let mut bounds = Vec::with_capacity(self.chunk_size.min(rest.len()) + 1);
        bounds.push(self.byte_pos);

        let mut last_paragraph = None;
        let mut last_sentence = None;
        let mut previous: Option<char> = None;
        let mut exceeds_window = false;

        for (i, (offset, ch)) in rest.char_indices().enumerate() {
            if i == self.chunk_size {
                exceeds_window = true;
                break;
            }
            bounds.push(self.byte_pos + offset + ch.len_utf8());

            let count = i + 1;
            if count >= min_boundary {
                if ch == '\n' && previous == Some('\n') {
                    last_paragraph = Some(count);
                }
                if ch == '\n' || (ch.is_whitespace() && matches!(previous, Some('.' | '?' | '!'))) {
                    last_sentence = Some(count);
                }
            }
            previous = Some(ch);
        }

        let window = bounds.len() - 1;
        let end = if exceeds_window {
            last_paragraph.or(last_sentence).unwrap_or(window)
        } else {
            window
        };

        let chunk = Chunk {
            document_id: self.document_id.to_string(),
            index: self.index,
            text: self.text[self.byte_pos..bounds[end]].to_string(),
            start: self.char_pos,
            end: self.char_pos + end,
        };
        self.index += 1;

        if exceeds_window {
            let advance = end - self.overlap;
            self.byte_pos = bounds[advance];
            self.char_pos += advance;
        } else {
            self.finished = true;
        }

        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reconstruye el texto concatenando los chunks sin repetir el solape.
    fn reassemble(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        let mut covered = 0;
        for chunk in chunks {
            let skip = covered - chunk.start;
            out.extend(chunk.text.chars().skip(skip));
            covered = chunk.end;
        }
        out
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunker = Chunker::new(100, 10).unwrap();
        let chunks: Vec<_> = chunker.chunks("a.txt", "The sky is blue.").collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "The sky is blue.");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 16));
        assert_eq!(chunks[0].document_id, "a.txt");
    }

    #[test]
    fn empty_and_blank_text_yield_nothing() {
        let chunker = Chunker::new(100, 10).unwrap();
        assert_eq!(chunker.chunks("a", "").count(), 0);
        assert_eq!(chunker.chunks("a", " \n\t ").count(), 0);
    }

    #[test]
    fn overlap_not_smaller_than_size_is_rejected() {
        assert!(matches!(Chunker::new(10, 10), Err(RagError::Configuration(_))));
        assert!(matches!(Chunker::new(10, 25), Err(RagError::Configuration(_))));
        assert!(matches!(Chunker::new(0, 0), Err(RagError::Configuration(_))));
        assert!(Chunker::new(10, 9).is_ok());
    }

    #[test]
    fn chunks_respect_size_and_reassemble() {
        let text = "Primera frase del documento. Segunda frase algo más larga que la anterior.\n\n\
                    Otro párrafo con acentos: canción, pingüino, año. ¿Funciona? ¡Sí!\n\
                    Línea final sin punto"
            .repeat(7);
        for (size, overlap) in [(40, 0), (40, 10), (64, 20), (17, 16), (200, 50)] {
            let chunker = Chunker::new(size, overlap).unwrap();
            let chunks: Vec<_> = chunker.chunks("doc", &text).collect();

            assert!(chunks.len() > 1);
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.index, i);
                assert!(chunk.text.chars().count() <= size);
                assert_eq!(chunk.text.chars().count(), chunk.end - chunk.start);
            }
            for pair in chunks.windows(2) {
                assert!(pair[1].start > pair[0].start);
                assert!(pair[0].end - pair[1].start <= overlap);
            }
            assert_eq!(reassemble(&chunks), text, "size={size} overlap={overlap}");
        }
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let chunker = Chunker::new(40, 5).unwrap();
        let chunks: Vec<_> = chunker.chunks("doc", &text).collect();
        assert!(chunks[0].text.ends_with("\n\n"));
        assert_eq!(chunks[0].end, 32);
    }

    #[test]
    fn uses_sentence_end_without_paragraphs() {
        let text = format!("{}. {}", "a".repeat(25), "b".repeat(30));
        let chunker = Chunker::new(40, 5).unwrap();
        let chunks: Vec<_> = chunker.chunks("doc", &text).collect();
        assert_eq!(chunks[0].text, format!("{}. ", "a".repeat(25)));
        assert_eq!(chunks[0].end, 27);
        assert_eq!(chunks[1].start, 22);
    }

    #[test]
    fn falls_back_to_hard_split_without_boundaries() {
        let text = "x".repeat(95);
        let chunker = Chunker::new(30, 5).unwrap();
        let chunks: Vec<_> = chunker.chunks("doc", &text).collect();
        let spans: Vec<_> = chunks.iter().map(|c| (c.start, c.end)).collect();
        assert_eq!(spans, vec![(0, 30), (25, 55), (50, 80), (75, 95)]);
    }

    #[test]
    fn iteration_is_restartable() {
        let text = "uno dos tres. ".repeat(20);
        let chunker = Chunker::new(50, 10).unwrap();
        let mut first = chunker.chunks("doc", &text);
        let copy = first.clone();
        first.next();
        assert_eq!(copy.count(), chunker.chunks("doc", &text).count());
    }
}
