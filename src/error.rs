use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bollard::errors::Error as DockerError;

/// Top-level error kind, mirrored across every component-local error so the
/// supervisor and the status API can report a coarse category without
/// matching on each component's own enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigParse,
    ConfigValidate,
    EngineTransient,
    EngineGone,
    ProbeFailure,
    RegistryWrite,
    ReplicaChurn,
    Internal,
}

impl ErrorKind {
    fn status_code(self) -> StatusCode {
        match self {
            ErrorKind::ConfigParse | ErrorKind::ConfigValidate => StatusCode::BAD_REQUEST,
            ErrorKind::EngineGone => StatusCode::NOT_FOUND,
            ErrorKind::EngineTransient
            | ErrorKind::ProbeFailure
            | ErrorKind::RegistryWrite
            | ErrorKind::ReplicaChurn
            | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConfigParse => "config parse error",
            ErrorKind::ConfigValidate => "config validation error",
            ErrorKind::EngineTransient => "engine error",
            ErrorKind::EngineGone => "container not found",
            ErrorKind::ProbeFailure => "health probe failure",
            ErrorKind::RegistryWrite => "registry write failure",
            ErrorKind::ReplicaChurn => "replica restarted too many times",
            ErrorKind::Internal => "internal error",
        };
        write!(f, "{s}")
    }
}

/// Crate-wide error type: a kind plus an optional boxed source, rather
/// than one giant enum.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn custom<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            source: Some(msg.into().into()),
        }
    }

    pub fn source<E: Into<Box<dyn std::error::Error + Send + Sync>>>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(err.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}: {}", self.kind, source),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<DockerError> for Error {
    fn from(err: DockerError) -> Self {
        let kind = if is_not_found(&err) {
            ErrorKind::EngineGone
        } else {
            ErrorKind::EngineTransient
        };
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }
}

/// Decodes bollard's "container/image not found" responses
/// (`DockerResponseServerError { status_code: 404, .. }`).
pub fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.kind.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
