use crate::model::{ReservationId, ServerId};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("server {0} is under maintenance")]
    Unavailable(ServerId),
    #[error("conflict with reservation {0}")]
    Conflict(ReservationId),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    pub fn server_not_found(id: ServerId) -> Self {
        EngineError::NotFound(format!("server {id}"))
    }

    pub fn reservation_not_found(id: ReservationId) -> Self {
        EngineError::NotFound(format!("reservation {id}"))
    }

    /// Stable SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::InvalidInput(_) => "22023",
            EngineError::Unavailable(_) => "55000",
            EngineError::Conflict(_) => "23P01",
            EngineError::InvalidState(_) => "55P04",
            EngineError::Forbidden(_) => "42501",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Wal(_) => "58030",
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Wal(_) => "wal",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Wal(e.to_string())
    }
}
