use std::fmt;

use thiserror::Error;
use ulid::Ulid;

use crate::model::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Session,
    Room,
    ChangeRequest,
    Tutor,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Session => "session",
            EntityKind::Room => "room",
            EntityKind::ChangeRequest => "change request",
            EntityKind::Tutor => "tutor",
        })
    }
}

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    InvalidState,
    Conflict,
    NotFound,
    Unavailable,
    Forbidden,
    LimitExceeded,
}

impl ErrorKind {
    /// SQLSTATE reported on the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "22023",
            ErrorKind::InvalidState => "55000",
            ErrorKind::Conflict => "23P01",
            ErrorKind::NotFound => "P0002",
            ErrorKind::Unavailable => "58030",
            ErrorKind::Forbidden => "42501",
            ErrorKind::LimitExceeded => "54000",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::LimitExceeded => "limit_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity} {id} is {status}; cannot {action}")]
    InvalidState {
        entity: EntityKind,
        id: Ulid,
        status: &'static str,
        action: &'static str,
    },
    #[error("conflict on {on}: session {with} occupies [{}, {})", .span.start, .span.end)]
    Conflict { on: String, with: Ulid, span: Span },
    #[error("session {0} was modified concurrently; retry")]
    ConcurrentModification(Ulid),
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::Conflict { .. } | EngineError::ConcurrentModification(_) => {
                ErrorKind::Conflict
            }
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::Unavailable(_) => ErrorKind::Unavailable,
            EngineError::Forbidden(_) => ErrorKind::Forbidden,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
        }
    }

    /// Only store failures are worth retrying without new input.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(crate) fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_names_the_session() {
        let with = Ulid::new();
        let e = EngineError::Conflict {
            on: "tutor t1".into(),
            with,
            span: Span::new(1000, 2000),
        };
        let msg = e.to_string();
        assert!(msg.contains(&with.to_string()));
        assert!(msg.contains("[1000, 2000)"));
        assert_eq!(e.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(EngineError::Unavailable("disk".into()).is_retryable());
        assert!(!EngineError::validation("short").is_retryable());
        assert!(!EngineError::ConcurrentModification(Ulid::new()).is_retryable());
    }

    #[test]
    fn sqlstates_are_distinct() {
        let kinds = [
            ErrorKind::Validation,
            ErrorKind::InvalidState,
            ErrorKind::Conflict,
            ErrorKind::NotFound,
            ErrorKind::Unavailable,
            ErrorKind::Forbidden,
            ErrorKind::LimitExceeded,
        ];
        let states: std::collections::HashSet<_> = kinds.iter().map(|k| k.sqlstate()).collect();
        assert_eq!(states.len(), kinds.len());
    }
}
