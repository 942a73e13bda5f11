//! Pasarela RAG: ingesta de documentos de texto en un índice vectorial local
//! y servidor HTTP compatible con `/v1/chat/completions` que añade el
//! contexto recuperado antes de llamar al LLM.

pub mod api;
pub mod app_state;
pub mod auth;
pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod rag;
pub mod vector_store;
