//! In-process [`RemoteStore`] with the same batching rules as the hosted
//! store, plus fault injection for exercising failure paths.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{DocRef, Document, RemoteError, RemoteStore, Write, WriteKind};

/// Scripted failure consumed by the next `commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Reject without applying anything.
    Unavailable,
    /// Reject as if a precondition had lost a race.
    Conflict,
    /// Apply the batch, then report a timeout (unknown outcome for the caller).
    AppliedThenTimeout,
}

#[derive(Debug, Clone)]
struct Stored {
    version: u64,
    data: Value,
}

type Collections = HashMap<String, BTreeMap<String, Stored>>;

#[derive(Debug, Default)]
struct State {
    collections: Collections,
    next_version: u64,
    faults: VecDeque<Fault>,
    offline: bool,
    commits: usize,
    lookups: Vec<usize>,
}

#[derive(Debug)]
pub struct MemoryRemoteStore {
    state: Mutex<State>,
    lookup_limit: usize,
    batch_limit: usize,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new(30, 500)
    }
}

impl MemoryRemoteStore {
    pub fn new(lookup_limit: usize, batch_limit: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            lookup_limit,
            batch_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave a half-applied batch:
        // commits swap in a fully built copy.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn push_fault(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Number of successfully applied batches.
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Key counts of every lookup served so far.
    pub fn lookup_sizes(&self) -> Vec<usize> {
        self.lock().lookups.clone()
    }

    /// Current data of a document, without its version.
    pub fn snapshot(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|s| s.data.clone())
    }

    pub fn count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    fn check_online(state: &State) -> Result<(), RemoteError> {
        if state.offline {
            return Err(RemoteError::Unavailable("network unreachable".into()));
        }
        Ok(())
    }
}

fn to_document(id: &str, stored: &Stored) -> Document {
    Document {
        id: id.to_string(),
        version: stored.version,
        data: stored.data.clone(),
    }
}

fn object_mut<'a>(doc: &DocRef, data: &'a mut Value) -> Result<&'a mut Map<String, Value>, RemoteError> {
    if !data.is_object() {
        *data = Value::Object(Map::new());
    }
    data.as_object_mut().ok_or_else(|| RemoteError::Malformed {
        doc: doc.to_string(),
        message: "document is not an object".into(),
    })
}

fn array_field<'a>(
    doc: &DocRef,
    obj: &'a mut Map<String, Value>,
    field: &str,
) -> Result<&'a mut Vec<Value>, RemoteError> {
    let slot = obj
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut().ok_or_else(|| RemoteError::Malformed {
        doc: doc.to_string(),
        message: format!("field {} is not an array", field),
    })
}

fn apply(collections: &mut Collections, version: u64, write: &Write) -> Result<(), RemoteError> {
    let coll = collections.entry(write.doc.collection.clone()).or_default();
    let current = coll.get(&write.doc.id).map(|s| s.version);
    if let Some(pre) = &write.precondition {
        if !pre.holds(current) {
            return Err(RemoteError::Conflict(write.doc.to_string()));
        }
    }

    if let WriteKind::Delete = write.kind {
        coll.remove(&write.doc.id);
        return Ok(());
    }

    let mut data = coll
        .get(&write.doc.id)
        .map(|s| s.data.clone())
        .unwrap_or_else(|| Value::Object(Map::new()));
    match &write.kind {
        WriteKind::Set { data: new } => data = new.clone(),
        WriteKind::Merge { fields } => {
            let obj = object_mut(&write.doc, &mut data)?;
            for (k, v) in fields {
                obj.insert(k.clone(), v.clone());
            }
        }
        WriteKind::ArrayUnion { field, values } => {
            let obj = object_mut(&write.doc, &mut data)?;
            let arr = array_field(&write.doc, obj, field)?;
            for v in values {
                if !arr.contains(v) {
                    arr.push(v.clone());
                }
            }
        }
        WriteKind::ArrayRemove { field, values } => {
            let obj = object_mut(&write.doc, &mut data)?;
            let arr = array_field(&write.doc, obj, field)?;
            arr.retain(|v| !values.contains(v));
        }
        WriteKind::Delete => {}
    }
    coll.insert(write.doc.id.clone(), Stored { version, data });
    Ok(())
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn max_lookup_keys(&self) -> usize {
        self.lookup_limit
    }

    fn max_batch_writes(&self) -> usize {
        self.batch_limit
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Self::check_online(&self.lock())
    }

    async fn get(&self, doc: &DocRef) -> Result<Option<Document>, RemoteError> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(state
            .collections
            .get(&doc.collection)
            .and_then(|c| c.get(&doc.id))
            .map(|s| to_document(&doc.id, s)))
    }

    async fn lookup(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, RemoteError> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        if ids.len() > self.lookup_limit {
            return Err(RemoteError::TooManyKeys {
                requested: ids.len(),
                limit: self.lookup_limit,
            });
        }
        state.lookups.push(ids.len());
        let Some(coll) = state.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| coll.get(id).map(|s| to_document(id, s)))
            .collect())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, RemoteError> {
        let state = self.lock();
        Self::check_online(&state)?;
        Ok(state
            .collections
            .get(collection)
            .map(|c| c.iter().map(|(id, s)| to_document(id, s)).collect())
            .unwrap_or_default())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check_online(&state)?;
        if writes.len() > self.batch_limit {
            return Err(RemoteError::BatchTooLarge {
                requested: writes.len(),
                limit: self.batch_limit,
            });
        }
        let fault = state.faults.pop_front();
        match fault {
            Some(Fault::Unavailable) => {
                return Err(RemoteError::Unavailable("injected outage".into()))
            }
            Some(Fault::Conflict) => return Err(RemoteError::Conflict("injected".into())),
            _ => {}
        }

        let mut staged = state.collections.clone();
        let mut version = state.next_version;
        for write in &writes {
            version += 1;
            apply(&mut staged, version, write)?;
        }
        state.collections = staged;
        state.next_version = version;
        state.commits += 1;
        debug!(writes = writes.len(), "memory store applied batch");

        if fault == Some(Fault::AppliedThenTimeout) {
            return Err(RemoteError::Timeout(Duration::from_secs(0)));
        }
        Ok(())
    }
}
