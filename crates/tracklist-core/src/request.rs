//! Inbound operations and the validation that happens before any backend call.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

use crate::backend::BackendError;
use crate::link::{Item, LinkError};
use crate::response::Status;

/// Scalar playlist attributes readable on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Collaborative,
    Title,
    Creator,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Collaborative => "collaborative",
            Field::Title => "title",
            Field::Creator => "creator",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collaborative" => Ok(Field::Collaborative),
            "title" => Ok(Field::Title),
            "creator" => Ok(Field::Creator),
            _ => Err(RequestError::NotImplemented),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Get,
    GetField(Field),
    AddItems { index: usize, items: Vec<Item> },
    RemoveItems { index: usize, count: usize },
    Patch { desired: Vec<Item> },
}

impl Operation {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::GetField(_) => "get_field",
            Operation::AddItems { .. } => "add",
            Operation::RemoveItems { .. } => "remove",
            Operation::Patch { .. } => "patch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Unparsed; resolved on the loop thread.
    pub entity: String,
    pub operation: Operation,
}

impl Request {
    pub fn new(entity: impl Into<String>, operation: Operation) -> Self {
        Self {
            entity: entity.into(),
            operation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Link not found")]
    LinkNotFound,
    #[error("Not a playlist link")]
    NotAPlaylist,
    #[error("Bad parameter: index must be numeric")]
    BadIndex,
    #[error("Bad parameter: count must be numeric and positive")]
    BadCount,
    #[error("No body")]
    NoBody,
    #[error("{0}")]
    InvalidJson(String),
    #[error("Not valid JSON array")]
    NotAnArray,
    #[error("No valid tracks")]
    NoValidTracks,
    #[error("Not Implemented")]
    NotImplemented,
    #[error("Bad Request")]
    BadRoute,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Timed out waiting for the playlist service")]
    TimedOut,
    #[error("patch did not converge")]
    PatchDiverged,
    #[error("session is shutting down")]
    ShuttingDown,
}

impl RequestError {
    pub fn status(&self) -> Status {
        match self {
            RequestError::LinkNotFound => Status::NotFound,
            RequestError::NotImplemented => Status::NotImplemented,
            RequestError::Backend(err) => match err {
                BackendError::NotFound => Status::NotFound,
                BackendError::NotLoggedIn | BackendError::Disconnected => {
                    Status::ServiceUnavailable
                }
                _ => Status::BadRequest,
            },
            RequestError::TimedOut => Status::GatewayTimeout,
            RequestError::PatchDiverged => Status::Internal,
            RequestError::ShuttingDown => Status::ServiceUnavailable,
            RequestError::NotAPlaylist
            | RequestError::BadIndex
            | RequestError::BadCount
            | RequestError::NoBody
            | RequestError::InvalidJson(_)
            | RequestError::NotAnArray
            | RequestError::NoValidTracks
            | RequestError::BadRoute => Status::BadRequest,
        }
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::LinkNotFound | RequestError::NotAPlaylist => "resolution",
            RequestError::BadIndex
            | RequestError::BadCount
            | RequestError::NoBody
            | RequestError::InvalidJson(_)
            | RequestError::NotAnArray
            | RequestError::NoValidTracks
            | RequestError::BadRoute => "input",
            RequestError::NotImplemented => "not_implemented",
            RequestError::Backend(_) => "backend",
            RequestError::TimedOut => "timeout",
            RequestError::PatchDiverged => "diverged",
            RequestError::ShuttingDown => "shutdown",
        }
    }
}

impl From<LinkError> for RequestError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Unrecognised(_) => RequestError::LinkNotFound,
            LinkError::WrongKind { .. } => RequestError::NotAPlaylist,
        }
    }
}

/// Parses the `index` query parameter. Zero is a valid index.
pub fn parse_index(raw: Option<&str>) -> Result<usize, RequestError> {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or(RequestError::BadIndex)
}

/// Parses the `count` query parameter, which must be at least one.
pub fn parse_count(raw: Option<&str>) -> Result<usize, RequestError> {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|count| *count > 0)
        .ok_or(RequestError::BadCount)
}

/// Parses a JSON array of item links. Entries that are not strings or not
/// track links are skipped; a non-empty array with nothing usable is refused.
pub fn parse_item_list(body: &[u8]) -> Result<Vec<Item>, RequestError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(RequestError::NoBody);
    }
    let value: Value =
        serde_json::from_slice(body).map_err(|err| RequestError::InvalidJson(err.to_string()))?;
    let Value::Array(entries) = value else {
        return Err(RequestError::NotAnArray);
    };
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let items: Vec<Item> = entries
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|uri| Item::parse(uri).ok())
        .collect();
    if items.is_empty() {
        return Err(RequestError::NoValidTracks);
    }
    Ok(items)
}
