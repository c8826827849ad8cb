//! Remote table contract.
//!
//! The HTTP transport is out of scope; the engine consumes it through
//! [`RemoteTable`]. Concurrency is optimistic: the server returns an
//! opaque `version` token (mapped from the ETag), and conditional
//! requests carry it back as `If-Match`.

use crate::query::Query;
use crate::value::Item;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// 412: the `If-Match` token no longer matches; a conflict.
    PreconditionFailed,
    /// 409: insert of an id the server already has.
    Conflict,
    /// 404: the record is gone. Benign for deletes.
    NotFound,
    /// 401: credentials rejected.
    Unauthorized,
    /// The request never completed: DNS, connect, or timeout failure.
    NetworkError,
    /// Anything else.
    Other,
}

impl RemoteErrorKind {
    /// Classifies an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => RemoteErrorKind::Unauthorized,
            404 => RemoteErrorKind::NotFound,
            409 => RemoteErrorKind::Conflict,
            412 => RemoteErrorKind::PreconditionFailed,
            _ => RemoteErrorKind::Other,
        }
    }
}

/// A failure from the remote table.
#[derive(Debug, Clone, Error)]
#[error("remote table failure ({kind:?}{}): {message}", .status.map(|s| format!(", http {s}")).unwrap_or_default())]
pub struct RemoteError {
    /// Failure classification.
    pub kind: RemoteErrorKind,
    /// HTTP status, when a response arrived.
    pub status: Option<u16>,
    /// Raw response body, when one arrived.
    pub body: Option<String>,
    /// Server-side item parsed from the body, when present.
    pub item: Option<Item>,
    /// Human-readable description.
    pub message: String,
}

impl RemoteError {
    /// Builds an error from an HTTP status and optional body.
    pub fn from_response(status: u16, body: Option<String>, message: impl Into<String>) -> Self {
        let item = body
            .as_deref()
            .and_then(|b| serde_json::from_str::<serde_json::Value>(b).ok())
            .and_then(Item::from_json);
        Self {
            kind: RemoteErrorKind::from_status(status),
            status: Some(status),
            body,
            item,
            message: message.into(),
        }
    }

    /// Builds a network-level error with no HTTP response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::NetworkError,
            status: None,
            body: None,
            item: None,
            message: message.into(),
        }
    }

    /// True for conflict-class failures (412 or 409).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::PreconditionFailed | RemoteErrorKind::Conflict
        )
    }
}

/// One page of a remote read.
#[derive(Debug, Clone, Default)]
pub struct ServerPage {
    /// Returned records.
    pub items: Vec<Item>,
    /// Total matching count, when the query asked for it.
    pub total_count: Option<u64>,
    /// Link to the next page, when the server paginates.
    pub next_link: Option<String>,
}

/// Contract of one remote table.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Executes a structured query.
    async fn read(&self, query: &Query) -> Result<ServerPage, RemoteError>;

    /// Follows a server-provided next-page link.
    async fn read_url(&self, url: &str) -> Result<ServerPage, RemoteError>;

    /// Inserts an item; returns the server's copy.
    async fn insert(&self, item: Item) -> Result<Item, RemoteError>;

    /// Updates an item, conditionally on `if_match`; returns the
    /// server's copy.
    async fn update(&self, item: Item, if_match: Option<&str>) -> Result<Item, RemoteError>;

    /// Deletes by id, conditionally on `if_match`.
    async fn delete(&self, id: &str, if_match: Option<&str>) -> Result<(), RemoteError>;

    /// Looks up a single record by id.
    async fn lookup(&self, id: &str) -> Result<Item, RemoteError>;
}

/// Resolves remote tables by name.
pub trait RemoteBackend: Send + Sync {
    /// Returns the remote table handle for `name`.
    fn table(&self, name: &str) -> Arc<dyn RemoteTable>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(RemoteErrorKind::from_status(412), RemoteErrorKind::PreconditionFailed);
        assert_eq!(RemoteErrorKind::from_status(409), RemoteErrorKind::Conflict);
        assert_eq!(RemoteErrorKind::from_status(404), RemoteErrorKind::NotFound);
        assert_eq!(RemoteErrorKind::from_status(401), RemoteErrorKind::Unauthorized);
        assert_eq!(RemoteErrorKind::from_status(500), RemoteErrorKind::Other);
    }

    #[test]
    fn response_parses_server_item() {
        let err = RemoteError::from_response(
            412,
            Some(r#"{"id":"a","version":"2"}"#.to_string()),
            "precondition failed",
        );
        assert!(err.is_conflict());
        let item = err.item.expect("server item");
        assert_eq!(item.id(), Some("a"));
        assert_eq!(item.version(), Some("2"));
    }

    #[test]
    fn network_error_has_no_status() {
        let err = RemoteError::network("connection refused");
        assert_eq!(err.kind, RemoteErrorKind::NetworkError);
        assert_eq!(err.status, None);
        assert!(!err.is_conflict());
    }

    #[test]
    fn error_display_includes_status() {
        let err = RemoteError::from_response(412, None, "stale token");
        let text = err.to_string();
        assert!(text.contains("http 412"), "{text}");
        assert!(text.contains("stale token"));
    }
}
