//! Remote inventory store: the document database the engine writes into.
//!
//! The engine only depends on [`RemoteStore`]. Optimistic transactions are
//! expressed as "read documents with their versions, then commit one atomic
//! batch whose writes carry [`Precondition`]s"; a failed precondition rejects
//! the whole batch with [`RemoteError::Conflict`] and the caller retries.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod http;
pub mod memory;

pub use http::HttpRemoteStore;
pub use memory::{Fault, MemoryRemoteStore};

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    /// The request may or may not have been applied.
    #[error("remote request timed out after {0:?}")]
    Timeout(Duration),
    #[error("precondition failed on {0}")]
    Conflict(String),
    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("lookup of {requested} keys exceeds the limit of {limit}")]
    TooManyKeys { requested: usize, limit: usize },
    #[error("batch of {requested} writes exceeds the limit of {limit}")]
    BatchTooLarge { requested: usize, limit: usize },
    #[error("malformed document {doc}: {message}")]
    Malformed { doc: String, message: String },
}

impl RemoteError {
    /// Failures that say nothing about the request itself; retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_) | RemoteError::Timeout(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict(_))
    }
}

/// Address of one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRef {
    pub collection: String,
    pub id: String,
}

impl DocRef {
    pub fn new(collection: &str, id: impl Into<String>) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as read from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Changes on every write; used for optimistic preconditions.
    pub version: u64,
    pub data: Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self, collection: &str) -> Result<T, RemoteError> {
        serde_json::from_value(self.data.clone()).map_err(|err| RemoteError::Malformed {
            doc: format!("{}/{}", collection, self.id),
            message: err.to_string(),
        })
    }
}

/// Condition the stored document must satisfy for the batch to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precondition {
    Exists,
    Missing,
    Version(u64),
}

impl Precondition {
    /// Guard a write with exactly the state that was read.
    pub fn matching(read: Option<&Document>) -> Self {
        match read {
            Some(doc) => Precondition::Version(doc.version),
            None => Precondition::Missing,
        }
    }

    pub fn holds(&self, current: Option<u64>) -> bool {
        match (self, current) {
            (Precondition::Exists, Some(_)) => true,
            (Precondition::Missing, None) => true,
            (Precondition::Version(want), Some(have)) => *want == have,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteKind {
    /// Replace the whole document.
    Set { data: Value },
    /// Overwrite the listed top-level fields, creating the document if absent.
    Merge { fields: Map<String, Value> },
    /// Add values to an array field, skipping ones already present.
    ArrayUnion { field: String, values: Vec<Value> },
    ArrayRemove { field: String, values: Vec<Value> },
    Delete,
}

/// One write inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Write {
    pub doc: DocRef,
    #[serde(flatten)]
    pub kind: WriteKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precondition: Option<Precondition>,
}

impl Write {
    pub fn set(doc: DocRef, data: Value) -> Self {
        Self {
            doc,
            kind: WriteKind::Set { data },
            precondition: None,
        }
    }

    pub fn merge(doc: DocRef, fields: Map<String, Value>) -> Self {
        Self {
            doc,
            kind: WriteKind::Merge { fields },
            precondition: None,
        }
    }

    pub fn array_union(doc: DocRef, field: &str, values: Vec<Value>) -> Self {
        Self {
            doc,
            kind: WriteKind::ArrayUnion {
                field: field.to_string(),
                values,
            },
            precondition: None,
        }
    }

    pub fn array_remove(doc: DocRef, field: &str, values: Vec<Value>) -> Self {
        Self {
            doc,
            kind: WriteKind::ArrayRemove {
                field: field.to_string(),
                values,
            },
            precondition: None,
        }
    }

    pub fn delete(doc: DocRef) -> Self {
        Self {
            doc,
            kind: WriteKind::Delete,
            precondition: None,
        }
    }

    pub fn when(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Provider limit on keys per [`RemoteStore::lookup`].
    fn max_lookup_keys(&self) -> usize;

    /// Provider limit on writes per [`RemoteStore::commit`].
    fn max_batch_writes(&self) -> usize;

    async fn ping(&self) -> Result<(), RemoteError>;

    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, RemoteError>;

    /// Fetch the documents of `collection` whose ids are in `ids`. Missing ids
    /// are simply absent from the result.
    async fn lookup(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, RemoteError>;

    async fn list(&self, collection: &str) -> Result<Vec<Document>, RemoteError>;

    /// Apply every write or none of them.
    async fn commit(&self, writes: Vec<Write>) -> Result<(), RemoteError>;

    async fn set(&self, doc: DocRef, data: Value) -> Result<(), RemoteError> {
        self.commit(vec![Write::set(doc, data)]).await
    }

    async fn delete(&self, doc: DocRef) -> Result<(), RemoteError> {
        self.commit(vec![Write::delete(doc)]).await
    }
}
