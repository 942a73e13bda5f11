//! Control de acceso por secreto compartido para las rutas `/v1`.
//!
//! Se acepta `Authorization: Bearer <secreto>` o la cabecera `x-api-secret`.
//! Sólo se guarda el hash SHA-256 del secreto.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    config::ApiKey,
    errors::{RagError, Result},
};

pub const API_SECRET_HEADER: &str = "x-api-secret";

#[derive(Clone, Default)]
pub struct AuthGate {
    digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl AuthGate {
    /// Sin secreto configurado, todas las peticiones pasan.
    pub fn new(secret: Option<&ApiKey>) -> Self {
        Self {
            digest: secret.map(|s| hash_secret(s.expose())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.digest.is_some()
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = &self.digest else {
            return Ok(());
        };

        let provided = presented_secret(headers).ok_or(RagError::Unauthorized)?;
        if constant_time_eq(&hash_secret(provided), expected) {
            Ok(())
        } else {
            Err(RagError::Unauthorized)
        }
    }
}

/// Middleware de axum. Se monta con `route_layer` para que se ejecute antes
/// de leer el cuerpo.
pub async fn require_secret(
    State(gate): State<AuthGate>,
    request: Request,
    next: Next,
) -> std::result::Result<Response, RagError> {
    if let Err(err) = gate.check(request.headers()) {
        debug!(path = %request.uri().path(), "Petición rechazada por el control de acceso");
        return Err(err);
    }
    Ok(next.run(request).await)
}

fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty());

    bearer.or_else(|| {
        headers
            .get(API_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    })
}

fn hash_secret(secret: &str) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(secret.as_bytes()));
    digest
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
