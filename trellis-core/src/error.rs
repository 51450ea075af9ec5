use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a client can observe.
///
/// Semantic errors raised by resource state machines are captured by the
/// dispatcher and travel inside the replicated response, so the enum is
/// serializable and cheap to clone.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    #[error("unknown session: {0}")]
    UnknownSession(u64),

    #[error("session expired: {0}")]
    SessionExpired(u64),

    #[error("session closed: {0}")]
    SessionClosed(u64),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("resource already exists: {0}")]
    DuplicateResource(String),

    #[error("wrong resource type: {0}")]
    WrongResourceType(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no such element")]
    NoSuchElement,

    #[error("member already exists: {0}")]
    DuplicateMember(String),

    #[error("illegal unlock: {0}")]
    IllegalUnlock(String),

    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error("read could not be served at the requested consistency: {0}")]
    ReadStale(String),

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable taxonomy name, used as the `code` field of JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnknownSession(_) => "UnknownSession",
            Error::SessionExpired(_) => "SessionExpired",
            Error::SessionClosed(_) => "SessionClosed",
            Error::UnknownResource(_) => "UnknownResource",
            Error::DuplicateResource(_) => "DuplicateResource",
            Error::WrongResourceType(_) => "WrongResourceType",
            Error::UnknownOperation(_) => "UnknownOperation",
            Error::BadRequest(_) => "BadRequest",
            Error::NoSuchElement => "NoSuchElement",
            Error::DuplicateMember(_) => "DuplicateMember",
            Error::IllegalUnlock(_) => "IllegalUnlock",
            Error::NotLeader { .. } => "NotLeader",
            Error::ReadStale(_) => "ReadStale",
            Error::Timeout => "Timeout",
            Error::Internal(_) => "Internal",
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Error::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadRequest(e.to_string())
    }
}
