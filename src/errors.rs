//! Taxonomía de errores del sistema RAG y su traducción a respuestas HTTP
//! con la forma de error del protocolo de chat completions.

use std::path::PathBuf;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagError>;

/// Servicio externo que originó un error de red.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    Embeddings,
    Llm,
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Upstream::Embeddings => f.write_str("embeddings"),
            Upstream::Llm => f.write_str("LLM"),
        }
    }
}

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Configuración inválida: {0}")]
    Configuration(String),

    #[error("No se encontraron documentos en {} con el patrón '{pattern}'", .root.display())]
    NoDocumentsFound { root: PathBuf, pattern: String },

    #[error("El servicio de {0} rechazó las credenciales")]
    Authentication(Upstream),

    #[error("El servicio de {upstream} ha limitado las peticiones")]
    RateLimit {
        upstream: Upstream,
        retry_after_secs: Option<u64>,
    },

    #[error("Petición inválida: {0}")]
    InvalidRequest(String),

    #[error("Error del servicio de {upstream}: {message}")]
    Service { upstream: Upstream, message: String },

    #[error("Servicio de {upstream} no disponible: {message}")]
    Unavailable { upstream: Upstream, message: String },

    #[error("No existe el índice vectorial {}", .0.display())]
    IndexNotFound(PathBuf),

    #[error("Error del índice vectorial: {0}")]
    Index(String),

    #[error("Dimensión de embedding incompatible: se esperaba {expected} y se obtuvo {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("No autorizado")]
    Unauthorized,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RagError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Authentication(_) | Self::Service { .. } => StatusCode::BAD_GATEWAY,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration(_)
            | Self::NoDocumentsFound { .. }
            | Self::IndexNotFound(_)
            | Self::Index(_)
            | Self::DimensionMismatch { .. }
            | Self::Io(_)
            | Self::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Campo `type` del objeto de error del protocolo.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized => "authentication_error",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::RateLimit { .. } => "rate_limit_error",
            Self::Authentication(_) | Self::Service { .. } | Self::Unavailable { .. } => {
                "upstream_error"
            }
            _ => "server_error",
        }
    }

    /// Campo `code` del objeto de error del protocolo.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "invalid_api_secret",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimit { .. } => "rate_limit_exceeded",
            Self::Authentication(_) => "upstream_authentication_failed",
            Self::Service { .. } => "upstream_error",
            Self::Unavailable { .. } => "upstream_unavailable",
            Self::DimensionMismatch { .. } => "embedding_dimension_mismatch",
            _ => "internal_error",
        }
    }

    /// Mensaje apto para el cliente: nunca incluye rutas internas ni el
    /// cuerpo devuelto por el backend.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthorized => "Falta el secreto compartido o no es válido.".to_string(),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::RateLimit { upstream, .. } => {
                format!("El servicio de {upstream} está limitando las peticiones; reintente más tarde.")
            }
            Self::Authentication(upstream) => {
                format!("El servicio de {upstream} rechazó las credenciales configuradas en la pasarela.")
            }
            Self::Service { upstream, .. } => {
                format!("El servicio de {upstream} devolvió un error.")
            }
            Self::Unavailable { upstream, .. } => {
                format!("El servicio de {upstream} no está disponible en este momento.")
            }
            _ => "Error interno del servidor.".to_string(),
        }
    }

    /// Errores transitorios que admiten un reintento acotado.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::Unavailable { .. })
    }

    /// Cuerpo JSON con la forma de error del protocolo. También se usa como
    /// evento terminal en los streams.
    pub fn to_protocol_body(&self) -> Value {
        json!({
            "error": {
                "message": self.public_message(),
                "type": self.error_type(),
                "param": Value::Null,
                "code": self.error_code(),
            }
        })
    }

    /// Construye el error adecuado a partir del estado HTTP de un backend.
    pub fn from_upstream_status(
        upstream: Upstream,
        status: reqwest::StatusCode,
        retry_after_secs: Option<u64>,
    ) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Authentication(upstream),
            429 => Self::RateLimit {
                upstream,
                retry_after_secs,
            },
            400 | 404 | 413 | 422 => Self::InvalidRequest(format!(
                "El servicio de {upstream} rechazó la petición (HTTP {})",
                status.as_u16()
            )),
            502..=504 => Self::Unavailable {
                upstream,
                message: format!("HTTP {}", status.as_u16()),
            },
            code => Self::Service {
                upstream,
                message: format!("HTTP {code}"),
            },
        }
    }

    /// Traduce errores de transporte de `reqwest` (conexión, timeouts).
    pub fn from_transport(upstream: Upstream, err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Unavailable {
                upstream,
                message: err.to_string(),
            }
        } else {
            Self::Service {
                upstream,
                message: err.to_string(),
            }
        }
    }
}

/// Segundos indicados en la cabecera `Retry-After` de un backend, si los hay.
pub(crate) fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Recorta el cuerpo de error de un backend antes de registrarlo.
pub(crate) fn truncate_for_log(body: &str) -> String {
    const MAX_LOGGED_CHARS: usize = 500;
    body.chars().take(MAX_LOGGED_CHARS).collect()
}

impl IntoResponse for RagError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            Self::Unauthorized | Self::InvalidRequest(_) => {
                tracing::debug!(status = status.as_u16(), error = %self, "Error del cliente");
            }
            Self::RateLimit { .. }
            | Self::Authentication(_)
            | Self::Service { .. }
            | Self::Unavailable { .. } => {
                tracing::warn!(status = status.as_u16(), error = %self, "Error del backend");
            }
            _ => {
                tracing::error!(status = status.as_u16(), error = ?self, "Error interno");
            }
        }

        let mut response = (status, Json(self.to_protocol_body())).into_response();
        match &self {
            Self::RateLimit {
                retry_after_secs: Some(secs),
                ..
            } => {
                if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            Self::Unauthorized => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }
        response
    }
}
