//! Composición del prompt: inserta el contexto recuperado como mensaje de
//! sistema justo antes del último turno del usuario.

use crate::models::{ChatMessage, Role, ScoredChunk};

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

const CONTEXT_PREAMBLE: &str = "Usa el siguiente contexto, extraído de los documentos indexados, \
para responder a la última pregunta del usuario. Si el contexto no contiene la respuesta, \
dilo explícitamente.\n\nContexto:\n";

#[derive(Debug, Clone, Copy)]
pub struct PromptComposer {
    max_context_chars: usize,
}

impl PromptComposer {
    pub fn new(max_context_chars: usize) -> Self {
        Self { max_context_chars }
    }

    pub fn max_context_chars(&self) -> usize {
        self.max_context_chars
    }

    /// Devuelve la conversación con el contexto añadido. Los mensajes del
    /// llamante no se modifican ni se reordenan; sin chunks recuperados la
    /// conversación sale tal cual.
    pub fn compose(&self, messages: &[ChatMessage], retrieved: &[ScoredChunk]) -> Vec<ChatMessage> {
        let Some(context) = self.build_context(retrieved) else {
            return messages.to_vec();
        };

        let position = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);

        let mut composed = Vec::with_capacity(messages.len() + 1);
        composed.extend_from_slice(&messages[..position]);
        composed.push(ChatMessage::new(
            Role::System,
            format!("{CONTEXT_PREAMBLE}{context}"),
        ));
        composed.extend_from_slice(&messages[position..]);
        composed
    }

    /// Concatena los chunks por rango hasta agotar el presupuesto.
    ///
    /// Se descartan primero los de menor similitud. Si el primero no cabe por
    /// sí solo, se recorta a `max_context_chars` caracteres.
    pub fn build_context(&self, retrieved: &[ScoredChunk]) -> Option<String> {
        let budget = self.max_context_chars;
        let mut context = String::new();
        let mut used = 0;

        for (rank, scored) in retrieved.iter().enumerate() {
            let text = scored.chunk.text.trim();
            if text.is_empty() {
                continue;
            }
            let len = text.chars().count();

            if context.is_empty() {
                if rank == 0 && len > budget {
                    context.extend(text.chars().take(budget));
                    break;
                }
                if len > budget {
                    continue;
                }
                context.push_str(text);
                used = len;
                continue;
            }

            let separator = CONTEXT_SEPARATOR.chars().count();
            if used + separator + len > budget {
                break;
            }
            context.push_str(CONTEXT_SEPARATOR);
            context.push_str(text);
            used += separator + len;
        }

        (!context.is_empty()).then_some(context)
    }
}
