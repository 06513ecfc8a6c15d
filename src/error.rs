//! Error types for the playback core.
//!
//! Every error carries a numeric code, a human message and the moment it was
//! created. Destroyed-state misuse is reported through the same type so it is
//! visible at the call site.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// What went wrong.
#[derive(Debug, Error)]
pub enum ErrorKind {
    /// Malformed argument, e.g. a text channel where a voice channel was expected
    #[error("{0}")]
    InvalidInput(String),

    /// A prerequisite (connection, sink, subscription, track) is missing
    #[error("{0}")]
    NotFound(String),

    #[error("{0} no está soportado como motor de búsqueda")]
    UnsupportedEngine(String),

    #[error("el track recibido de '{0}' no pertenece a un motor soportado")]
    UnsupportedSource(String),

    #[error("esta cola fue destruida y ya no existe")]
    QueueDestroyed,

    #[error("este player fue destruido y ya no existe")]
    PlayerDestroyed,

    /// Provider failed to resolve a deferred stream
    #[error("no se pudo resolver el stream de '{title}': {source}")]
    Stream {
        title: String,
        #[source]
        source: anyhow::Error,
    },

    /// Engine failed to answer a query
    #[error("la búsqueda '{query}' falló: {source}")]
    Search {
        query: String,
        #[source]
        source: anyhow::Error,
    },

    /// Voice gateway failure
    #[error("error de transporte de voz: {0}")]
    Transport(#[source] anyhow::Error),
}

impl ErrorKind {
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::InvalidInput(_) => 400,
            ErrorKind::NotFound(_) => 404,
            ErrorKind::UnsupportedEngine(_) | ErrorKind::UnsupportedSource(_) => 415,
            ErrorKind::QueueDestroyed | ErrorKind::PlayerDestroyed => 410,
            ErrorKind::Stream { .. } | ErrorKind::Search { .. } | ErrorKind::Transport(_) => 502,
        }
    }
}

/// Error returned by every queue and player operation.
#[derive(Debug, Error)]
#[error("[{code}]: {kind}", code = .kind.code())]
pub struct PlayerError {
    kind: ErrorKind,
    created_at: DateTime<Utc>,
}

impl PlayerError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput(message.into()))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound(message.into()))
    }

    pub fn unsupported_engine(engine: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedEngine(engine.into()))
    }

    pub fn unsupported_source(provider: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedSource(provider.into()))
    }

    pub fn queue_destroyed() -> Self {
        Self::new(ErrorKind::QueueDestroyed)
    }

    pub fn player_destroyed() -> Self {
        Self::new(ErrorKind::PlayerDestroyed)
    }

    pub fn stream(title: impl Into<String>, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Stream {
            title: title.into(),
            source,
        })
    }

    pub fn search(query: impl Into<String>, source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Search {
            query: query.into(),
            source,
        })
    }

    pub fn transport(source: anyhow::Error) -> Self {
        Self::new(ErrorKind::Transport(source))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn code(&self) -> u16 {
        self.kind.code()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Milliseconds since the Unix epoch at creation time
    pub fn timestamp(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    /// True for misuse of a queue or player that was already torn down.
    pub fn is_destroyed(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::QueueDestroyed | ErrorKind::PlayerDestroyed
        )
    }
}

/// Convenience Result type for playback operations
pub type Result<T, E = PlayerError> = std::result::Result<T, E>;
