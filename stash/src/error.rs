//! Error taxonomy shared by the history store, run engine, and API layer.

use std::fmt;

/// Errors surfaced synchronously to callers of the store and engine.
///
/// `NotFound`, `Conflict`, and `InvalidInput` are caller errors and map to
/// distinct HTTP statuses; the remaining variants wrap infrastructure failures.
#[derive(Debug)]
pub enum StashError {
    NotFound { entity: &'static str, id: String },
    Conflict(String),
    InvalidInput(String),
    Sql(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
}

pub type StashResult<T> = Result<T, StashError>;

impl StashError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidInput(_) => "invalid_input",
            Self::Sql(_) | Self::Io(_) | Self::Json(_) => "internal",
        }
    }
}

impl fmt::Display for StashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Json(err) => write!(f, "json: {err}"),
        }
    }
}

impl std::error::Error for StashError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sql(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StashError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<std::io::Error> for StashError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StashError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
