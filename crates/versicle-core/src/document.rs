//! Shared library document backed by Automerge
//!
//! The document holds one top-level container per logical store (see
//! [`crate::containers`]). Values are JSON: objects become nested Automerge
//! maps, arrays become lists, everything else is a scalar. Nested maps are
//! updated field by field so concurrent edits to different fields merge.
//!
//! All mutations go through [`SharedDocument::transact`]. A transaction is a
//! synchronous closure; it either commits as one Automerge change and
//! notifies subscribers once, or rolls back and notifies nobody.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value as AmValue, ROOT};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map as JsonMap, Number, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::containers::{names, ContainerKind, ContainerRegistry, STATIC_CONTAINERS};
use crate::models::Record;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Failed to decode document state: {0}")]
    Decode(String),

    #[error("Container '{name}' is not a {expected}")]
    WrongKind {
        name: String,
        expected: &'static str,
    },

    #[error("Unknown container: {0}")]
    UnknownContainer(String),

    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keys stored directly on the document root
mod keys {
    pub const SCHEMA_VERSION: &str = "schemaVersion";
}

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: u64 = 1;

/// Actor used for the genesis change shared by every replica
const GENESIS_ACTOR: &[u8] = b"versicle-genesis";

/// Snapshot of one container as plain key → value pairs
pub type ContainerSnapshot = BTreeMap<String, Value>;

/// Where a document update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A local transaction
    Local,
    /// A merged remote update
    Remote,
    /// A checkpoint restore
    Restore,
}

/// Notification sent to subscribers after a commit or merge
#[derive(Debug, Clone)]
pub struct DocumentUpdate {
    pub origin: UpdateOrigin,
    /// Containers touched by the change
    pub containers: BTreeSet<String>,
}

/// The one shared handle to the live document
pub type DocumentHandle = Arc<Mutex<SharedDocument>>;

/// The shared, conflict-free replicated library document
pub struct SharedDocument {
    doc: AutoCommit,
    updates: broadcast::Sender<DocumentUpdate>,
}

impl SharedDocument {
    /// Create a new document containing the static containers
    ///
    /// The containers are written by a fixed actor with a zero timestamp, so
    /// the genesis change hashes identically on every device and merging two
    /// fresh replicas unions their container contents.
    pub fn new() -> Self {
        let mut doc = AutoCommit::new().with_actor(ActorId::from(GENESIS_ACTOR));

        doc.put(ROOT, keys::SCHEMA_VERSION, CURRENT_SCHEMA_VERSION)
            .expect("Failed to set schema version");
        for (name, kind) in STATIC_CONTAINERS {
            doc.put_object(ROOT, *name, obj_type_for(*kind))
                .expect("Failed to create static container");
        }
        doc.commit_with(CommitOptions::default().with_time(0));
        doc.set_actor(ActorId::random());

        Self::from_doc(doc)
    }

    /// Load a document from encoded state
    pub fn load(bytes: &[u8]) -> Result<Self, DocumentError> {
        let doc = AutoCommit::load(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
        Ok(Self::from_doc(doc))
    }

    /// Wrap the document in a shared handle
    pub fn into_handle(self) -> DocumentHandle {
        Arc::new(Mutex::new(self))
    }

    fn from_doc(doc: AutoCommit) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self { doc, updates }
    }

    /// Subscribe to committed updates
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentUpdate> {
        self.updates.subscribe()
    }

    /// Encode the full causal state of the document
    pub fn encode_state(&mut self) -> Vec<u8> {
        self.doc.save()
    }

    /// Merge encoded state from another replica
    ///
    /// Returns `true` if the merge changed this document.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<bool, DocumentError> {
        let mut other = AutoCommit::load(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;

        let before = self.doc.get_heads();
        self.doc.merge(&mut other)?;
        let changed = self.doc.get_heads() != before;

        if changed {
            let containers = self.container_names()?.into_iter().collect();
            self.notify(UpdateOrigin::Remote, containers);
        }
        debug!(bytes = bytes.len(), changed, "Applied document update");

        Ok(changed)
    }

    /// Run a batch of mutations as one atomic change
    pub fn transact<F, R>(&mut self, f: F) -> Result<R, DocumentError>
    where
        F: FnOnce(&mut DocumentTransaction<'_>) -> Result<R, DocumentError>,
    {
        self.transact_with(UpdateOrigin::Local, f)
    }

    fn transact_with<F, R>(&mut self, origin: UpdateOrigin, f: F) -> Result<R, DocumentError>
    where
        F: FnOnce(&mut DocumentTransaction<'_>) -> Result<R, DocumentError>,
    {
        let outcome = {
            let mut tx = DocumentTransaction {
                doc: &mut self.doc,
                touched: BTreeSet::new(),
            };
            f(&mut tx).map(|value| (value, tx.touched))
        };

        match outcome {
            Ok((value, touched)) => {
                if self.doc.pending_ops() > 0 {
                    self.doc.commit();
                    self.notify(origin, touched);
                }
                Ok(value)
            }
            Err(e) => {
                let dropped = self.doc.rollback();
                debug!(dropped, "Rolled back transaction: {}", e);
                Err(e)
            }
        }
    }

    fn notify(&self, origin: UpdateOrigin, containers: BTreeSet<String>) {
        // No subscribers is fine
        let _ = self.updates.send(DocumentUpdate { origin, containers });
    }

    // ==================== Reads ====================

    /// Get a value from a map container
    pub fn get(&self, container: &str, key: &str) -> Result<Option<Value>, DocumentError> {
        let Some((obj_type, obj)) = container_id(&self.doc, container)? else {
            return Ok(None);
        };
        if !is_map(obj_type) {
            return Err(DocumentError::WrongKind {
                name: container.to_string(),
                expected: "map",
            });
        }
        match self.doc.get(&obj, key)? {
            Some(entry) => Ok(Some(read_entry(&self.doc, entry)?)),
            None => Ok(None),
        }
    }

    /// All entries of a map container (empty if the container is missing)
    pub fn entries(&self, container: &str) -> Result<ContainerSnapshot, DocumentError> {
        match container_id(&self.doc, container)? {
            Some((obj_type, obj)) if is_map(obj_type) => map_entries(&self.doc, &obj),
            Some(_) => Err(DocumentError::WrongKind {
                name: container.to_string(),
                expected: "map",
            }),
            None => Ok(ContainerSnapshot::new()),
        }
    }

    /// Typed read of one record
    pub fn get_record<R: Record>(&self, key: &str) -> Result<Option<R>, DocumentError> {
        match self.get(R::CONTAINER, key)? {
            Some(value) => Ok(Some(R::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// All records of a type; entries that fail to parse are skipped
    pub fn records<R: Record>(&self) -> Result<Vec<R>, DocumentError> {
        let mut records = Vec::new();
        for (key, value) in self.entries(R::CONTAINER)? {
            match R::from_value(value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(container = R::CONTAINER, key = %key, "Skipping invalid record: {}", e),
            }
        }
        Ok(records)
    }

    /// Items of a sequence container in order
    pub fn items(&self, container: &str) -> Result<Vec<Value>, DocumentError> {
        match container_id(&self.doc, container)? {
            Some((ObjType::List, obj)) => list_items(&self.doc, &obj),
            Some(_) => Err(DocumentError::WrongKind {
                name: container.to_string(),
                expected: "sequence",
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Number of entries in a container
    pub fn len(&self, container: &str) -> Result<usize, DocumentError> {
        Ok(container_id(&self.doc, container)?
            .map(|(_, obj)| self.doc.length(&obj))
            .unwrap_or(0))
    }

    /// Whether the library container has no books
    pub fn is_library_empty(&self) -> Result<bool, DocumentError> {
        Ok(self.len(names::LIBRARY)? == 0)
    }

    /// Names of every materialized top-level container
    pub fn container_names(&self) -> Result<Vec<String>, DocumentError> {
        Ok(root_containers(&self.doc)?
            .into_iter()
            .map(|(name, _, _)| name)
            .collect())
    }

    /// Stored schema version (0 if none was ever written)
    pub fn schema_version(&self) -> Result<u64, DocumentError> {
        match self.doc.get(ROOT, keys::SCHEMA_VERSION)? {
            Some((AmValue::Scalar(value), _)) => Ok(value
                .to_u64()
                .ok_or_else(|| DocumentError::InvalidValue(keys::SCHEMA_VERSION.to_string()))?),
            _ => Ok(0),
        }
    }

    /// Plain snapshot of every known container
    ///
    /// Containers are read according to their declared kind. Sequences are
    /// keyed by index. Names the registry does not know are skipped.
    pub fn snapshot(&self) -> Result<BTreeMap<String, ContainerSnapshot>, DocumentError> {
        let mut snapshot = BTreeMap::new();

        for (name, obj_type, obj) in root_containers(&self.doc)? {
            let entries = match (ContainerRegistry::resolve(&name).kind(), obj_type) {
                (Some(ContainerKind::Map), t) if is_map(t) => map_entries(&self.doc, &obj)?,
                (Some(ContainerKind::Sequence), ObjType::List) => list_items(&self.doc, &obj)?
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), v))
                    .collect(),
                (Some(kind), actual) => {
                    warn!(container = %name, ?kind, ?actual, "Container kind mismatch, skipping");
                    continue;
                }
                (None, _) => {
                    debug!(container = %name, "Skipping unknown container");
                    continue;
                }
            };
            snapshot.insert(name, entries);
        }

        Ok(snapshot)
    }

    // ==================== Whole-document operations ====================

    /// Replace the content of every container with the content of `source`
    ///
    /// Runs as one transaction: every container materialized here is cleared
    /// first, then the containers of `source` are written back as new
    /// operations. Containers are copied by their actual structure, so names
    /// the registry does not know survive the replacement.
    pub fn replace_with(&mut self, source: &SharedDocument) -> Result<Vec<String>, DocumentError> {
        let mut incoming = Vec::new();
        for (name, obj_type, obj) in root_containers(&source.doc)? {
            if ContainerRegistry::resolve(&name).kind().is_none() {
                debug!(container = %name, "Restoring unknown container structurally");
            }
            incoming.push((name, obj_type, read_object(&source.doc, &obj, obj_type)?));
        }

        self.transact_with(UpdateOrigin::Restore, |tx| {
            for (name, obj_type, obj) in root_containers(tx.doc)? {
                clear_object(tx.doc, &obj, obj_type)?;
                tx.touched.insert(name);
            }

            for (name, obj_type, content) in &incoming {
                let obj = match container_id(tx.doc, name)? {
                    Some((existing, obj)) if existing == *obj_type => obj,
                    _ => tx.doc.put_object(ROOT, name.as_str(), *obj_type)?,
                };
                fill_object(tx.doc, &obj, *obj_type, content)?;
                tx.touched.insert(name.clone());
            }

            Ok(incoming.iter().map(|(name, _, _)| name.clone()).collect())
        })
    }

    /// Run the schema version-bump hook if the stored version is older
    ///
    /// Returns `true` if the hook ran.
    pub fn migrate<F>(&mut self, hook: F) -> Result<bool, DocumentError>
    where
        F: FnOnce(u64, &mut DocumentTransaction<'_>) -> Result<(), DocumentError>,
    {
        let stored = self.schema_version()?;
        if stored >= CURRENT_SCHEMA_VERSION {
            return Ok(false);
        }

        self.transact(|tx| {
            hook(stored, tx)?;
            tx.doc
                .put(ROOT, keys::SCHEMA_VERSION, CURRENT_SCHEMA_VERSION)?;
            Ok(())
        })?;
        Ok(true)
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutation handle passed to [`SharedDocument::transact`]
pub struct DocumentTransaction<'a> {
    doc: &'a mut AutoCommit,
    touched: BTreeSet<String>,
}

impl DocumentTransaction<'_> {
    /// Set a value in a map container
    ///
    /// Object values update an existing nested map field by field.
    pub fn set(&mut self, container: &str, key: &str, value: &Value) -> Result<(), DocumentError> {
        let obj = self.map_container(container)?;
        put_value(self.doc, &obj, key, value)
    }

    /// Store a typed record under its key
    pub fn put_record<R: Record>(&mut self, record: &R) -> Result<(), DocumentError> {
        self.set(R::CONTAINER, &record.key(), &record.to_value()?)
    }

    /// Set one field of a nested map, creating the map if needed
    pub fn set_field(
        &mut self,
        container: &str,
        key: &str,
        field: &str,
        value: &Value,
    ) -> Result<(), DocumentError> {
        let obj = self.map_container(container)?;
        let nested = match self.doc.get(&obj, key)? {
            Some((AmValue::Object(ObjType::Map), id)) => id,
            _ => self.doc.put_object(&obj, key, ObjType::Map)?,
        };
        put_value(self.doc, &nested, field, value)
    }

    /// Delete a key from a map container
    pub fn delete(&mut self, container: &str, key: &str) -> Result<(), DocumentError> {
        let obj = self.map_container(container)?;
        if self.doc.get(&obj, key)?.is_some() {
            self.doc.delete(&obj, key)?;
        }
        Ok(())
    }

    /// Append a value to a sequence container
    pub fn append(&mut self, container: &str, value: &Value) -> Result<(), DocumentError> {
        let obj = match container_id(self.doc, container)? {
            Some((ObjType::List, obj)) => obj,
            Some(_) => {
                return Err(DocumentError::WrongKind {
                    name: container.to_string(),
                    expected: "sequence",
                })
            }
            None => self.create_container(container, ContainerKind::Sequence)?,
        };
        self.touched.insert(container.to_string());
        let index = self.doc.length(&obj);
        insert_value(self.doc, &obj, index, value)
    }

    /// Remove every entry of a container
    pub fn clear(&mut self, container: &str) -> Result<(), DocumentError> {
        if let Some((obj_type, obj)) = container_id(self.doc, container)? {
            clear_object(self.doc, &obj, obj_type)?;
            self.touched.insert(container.to_string());
        }
        Ok(())
    }

    /// Read a value inside the transaction (sees uncommitted writes)
    pub fn get(&self, container: &str, key: &str) -> Result<Option<Value>, DocumentError> {
        match container_id(self.doc, container)? {
            Some((obj_type, obj)) if is_map(obj_type) => match self.doc.get(&obj, key)? {
                Some(entry) => Ok(Some(read_entry(self.doc, entry)?)),
                None => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Resolve a map container, lazily creating declared dynamic ones
    fn map_container(&mut self, container: &str) -> Result<ObjId, DocumentError> {
        let obj = match container_id(self.doc, container)? {
            Some((obj_type, obj)) if is_map(obj_type) => obj,
            Some(_) => {
                return Err(DocumentError::WrongKind {
                    name: container.to_string(),
                    expected: "map",
                })
            }
            None => self.create_container(container, ContainerKind::Map)?,
        };
        self.touched.insert(container.to_string());
        Ok(obj)
    }

    fn create_container(&mut self, container: &str, kind: ContainerKind) -> Result<ObjId, DocumentError> {
        match ContainerRegistry::resolve(container).kind() {
            Some(declared) if declared == kind => {
                Ok(self.doc.put_object(ROOT, container, obj_type_for(kind))?)
            }
            Some(_) => Err(DocumentError::WrongKind {
                name: container.to_string(),
                expected: match kind {
                    ContainerKind::Map => "map",
                    ContainerKind::Sequence => "sequence",
                },
            }),
            None => Err(DocumentError::UnknownContainer(container.to_string())),
        }
    }
}

// ==================== Private helpers ====================

fn obj_type_for(kind: ContainerKind) -> ObjType {
    match kind {
        ContainerKind::Map => ObjType::Map,
        ContainerKind::Sequence => ObjType::List,
    }
}

fn is_map(obj_type: ObjType) -> bool {
    matches!(obj_type, ObjType::Map | ObjType::Table)
}

fn container_id<R: ReadDoc>(doc: &R, name: &str) -> Result<Option<(ObjType, ObjId)>, DocumentError> {
    match doc.get(ROOT, name)? {
        Some((AmValue::Object(obj_type), obj)) => Ok(Some((obj_type, obj))),
        _ => Ok(None),
    }
}

fn root_containers<R: ReadDoc>(doc: &R) -> Result<Vec<(String, ObjType, ObjId)>, DocumentError> {
    let mut containers = Vec::new();
    for name in doc.keys(ROOT) {
        if let Some((obj_type, obj)) = container_id(doc, &name)? {
            containers.push((name, obj_type, obj));
        }
    }
    Ok(containers)
}

fn map_entries<R: ReadDoc>(doc: &R, obj: &ObjId) -> Result<ContainerSnapshot, DocumentError> {
    let mut entries = ContainerSnapshot::new();
    for key in doc.keys(obj) {
        if let Some(entry) = doc.get(obj, key.as_str())? {
            let value = read_entry(doc, entry)?;
            entries.insert(key, value);
        }
    }
    Ok(entries)
}

fn list_items<R: ReadDoc>(doc: &R, obj: &ObjId) -> Result<Vec<Value>, DocumentError> {
    let mut items = Vec::new();
    for i in 0..doc.length(obj) {
        if let Some(entry) = doc.get(obj, i)? {
            items.push(read_entry(doc, entry)?);
        }
    }
    Ok(items)
}

fn read_entry<R: ReadDoc>(doc: &R, (value, id): (AmValue<'_>, ObjId)) -> Result<Value, DocumentError> {
    match value {
        AmValue::Object(obj_type) => read_object(doc, &id, obj_type),
        AmValue::Scalar(scalar) => Ok(scalar_to_json(&scalar)),
    }
}

fn read_object<R: ReadDoc>(doc: &R, obj: &ObjId, obj_type: ObjType) -> Result<Value, DocumentError> {
    match obj_type {
        ObjType::Map | ObjType::Table => Ok(Value::Object(
            map_entries(doc, obj)?.into_iter().collect::<JsonMap<_, _>>(),
        )),
        ObjType::List => Ok(Value::Array(list_items(doc, obj)?)),
        ObjType::Text => Ok(Value::String(doc.text(obj)?)),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> Value {
    match scalar {
        ScalarValue::Str(s) => Value::String(s.to_string()),
        ScalarValue::Int(i) => Value::from(*i),
        ScalarValue::Uint(u) => Value::from(*u),
        ScalarValue::F64(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        ScalarValue::Boolean(b) => Value::Bool(*b),
        ScalarValue::Timestamp(t) => Value::from(*t),
        ScalarValue::Bytes(bytes) => Value::String(BASE64.encode(bytes)),
        ScalarValue::Null => Value::Null,
        other => other.to_i64().map(Value::from).unwrap_or(Value::Null),
    }
}

fn json_to_scalar(value: &Value) -> ScalarValue {
    match value {
        Value::Bool(b) => ScalarValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else {
                ScalarValue::F64(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => ScalarValue::from(s.as_str()),
        Value::Null | Value::Array(_) | Value::Object(_) => ScalarValue::Null,
    }
}

fn put_value(doc: &mut AutoCommit, obj: &ObjId, key: &str, value: &Value) -> Result<(), DocumentError> {
    match value {
        Value::Object(fields) => {
            let nested = match doc.get(obj, key)? {
                Some((AmValue::Object(ObjType::Map), id)) => id,
                _ => doc.put_object(obj, key, ObjType::Map)?,
            };
            update_map(doc, &nested, fields)
        }
        Value::Array(items) => {
            let existing = match doc.get(obj, key)? {
                Some((AmValue::Object(ObjType::List), id)) => Some(id),
                _ => None,
            };
            if let Some(id) = existing {
                if list_items(&*doc, &id)? == *items {
                    return Ok(());
                }
            }
            let list = doc.put_object(obj, key, ObjType::List)?;
            fill_list(doc, &list, items)
        }
        scalar => {
            let new = json_to_scalar(scalar);
            let unchanged =
                matches!(doc.get(obj, key)?, Some((AmValue::Scalar(current), _)) if *current == new);
            if !unchanged {
                doc.put(obj, key, new)?;
            }
            Ok(())
        }
    }
}

fn update_map(doc: &mut AutoCommit, map: &ObjId, fields: &JsonMap<String, Value>) -> Result<(), DocumentError> {
    let stale: Vec<String> = doc.keys(map).filter(|k| !fields.contains_key(k)).collect();
    for key in stale {
        doc.delete(map, key.as_str())?;
    }
    for (key, value) in fields {
        put_value(doc, map, key, value)?;
    }
    Ok(())
}

fn fill_list(doc: &mut AutoCommit, list: &ObjId, items: &[Value]) -> Result<(), DocumentError> {
    for (index, item) in items.iter().enumerate() {
        insert_value(doc, list, index, item)?;
    }
    Ok(())
}

fn insert_value(doc: &mut AutoCommit, list: &ObjId, index: usize, value: &Value) -> Result<(), DocumentError> {
    match value {
        Value::Object(fields) => {
            let map = doc.insert_object(list, index, ObjType::Map)?;
            update_map(doc, &map, fields)
        }
        Value::Array(items) => {
            let nested = doc.insert_object(list, index, ObjType::List)?;
            fill_list(doc, &nested, items)
        }
        scalar => {
            doc.insert(list, index, json_to_scalar(scalar))?;
            Ok(())
        }
    }
}

fn fill_object(doc: &mut AutoCommit, obj: &ObjId, obj_type: ObjType, content: &Value) -> Result<(), DocumentError> {
    match (obj_type, content) {
        (ObjType::Map | ObjType::Table, Value::Object(fields)) => update_map(doc, obj, fields),
        (ObjType::List, Value::Array(items)) => fill_list(doc, obj, items),
        (ObjType::Text, Value::String(text)) => {
            doc.splice_text(obj, 0, 0, text)?;
            Ok(())
        }
        _ => Err(DocumentError::InvalidValue(format!("{:?} container content", obj_type))),
    }
}

fn clear_object(doc: &mut AutoCommit, obj: &ObjId, obj_type: ObjType) -> Result<(), DocumentError> {
    match obj_type {
        ObjType::Map | ObjType::Table => {
            let keys: Vec<String> = doc.keys(obj).collect();
            for key in keys {
                doc.delete(obj, key.as_str())?;
            }
        }
        ObjType::List => {
            for index in (0..doc.length(obj)).rev() {
                doc.delete(obj, index)?;
            }
        }
        ObjType::Text => {
            let len = doc.length(obj);
            if len > 0 {
                doc.splice_text(obj, 0, len as isize, "")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_with_book(id: &str, title: &str) -> SharedDocument {
        let mut doc = SharedDocument::new();
        doc.transact(|tx| tx.set("library", id, &json!({ "title": title })))
            .unwrap();
        doc
    }

    #[test]
    fn test_new_document_has_static_containers() {
        let doc = SharedDocument::new();
        let names = doc.container_names().unwrap();
        for name in ContainerRegistry::static_names() {
            assert!(names.contains(&name.to_string()), "missing {}", name);
        }
        assert!(doc.is_library_empty().unwrap());
        assert_eq!(doc.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_set_get_delete() {
        let mut doc = doc_with_book("book1", "Moby Dick");
        assert_eq!(
            doc.get("library", "book1").unwrap(),
            Some(json!({ "title": "Moby Dick" }))
        );

        doc.transact(|tx| tx.delete("library", "book1")).unwrap();
        assert!(doc.get("library", "book1").unwrap().is_none());
        assert!(doc.is_library_empty().unwrap());
    }

    #[test]
    fn test_nested_values_round_trip() {
        let mut doc = SharedDocument::new();
        let value = json!({
            "title": "Dune",
            "authors": ["Frank Herbert"],
            "progress": 0.25,
            "pages": 412,
            "finished": false,
            "cover": null,
            "meta": { "lang": "en" }
        });
        doc.transact(|tx| tx.set("library", "dune", &value)).unwrap();
        assert_eq!(doc.get("library", "dune").unwrap(), Some(value));
    }

    #[test]
    fn test_object_update_removes_stale_fields() {
        let mut doc = SharedDocument::new();
        doc.transact(|tx| tx.set("library", "b", &json!({ "title": "A", "author": "X" })))
            .unwrap();
        doc.transact(|tx| tx.set("library", "b", &json!({ "title": "B" })))
            .unwrap();
        assert_eq!(doc.get("library", "b").unwrap(), Some(json!({ "title": "B" })));
    }

    #[test]
    fn test_rewriting_equal_values_adds_no_change() {
        let mut doc = SharedDocument::new();
        let value = json!({ "title": "Dune", "ranges": ["a", "b"] });
        doc.transact(|tx| tx.set("library", "dune", &value)).unwrap();
        let size = doc.encode_state().len();

        let mut rx = doc.subscribe();
        doc.transact(|tx| tx.set("library", "dune", &value)).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(doc.encode_state().len(), size);

        doc.transact(|tx| tx.set("library", "dune", &json!({ "title": "Dune", "ranges": ["a"] })))
            .unwrap();
        assert_eq!(doc.get("library", "dune").unwrap().unwrap()["ranges"], json!(["a"]));
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let mut doc = SharedDocument::new();
        let mut rx = doc.subscribe();

        let result = doc.transact(|tx| {
            tx.set("library", "book1", &json!({ "title": "T" }))?;
            tx.set("no-such-container", "k", &json!(1))
        });

        assert!(matches!(result, Err(DocumentError::UnknownContainer(_))));
        assert!(doc.get("library", "book1").unwrap().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_transaction_notifies_once() {
        let mut doc = SharedDocument::new();
        let mut rx = doc.subscribe();

        doc.transact(|tx| {
            tx.set("library", "a", &json!({ "title": "A" }))?;
            tx.set("library", "b", &json!({ "title": "B" }))?;
            tx.set("lexicon", "r1", &json!({ "original": "x" }))
        })
        .unwrap();

        let update = rx.try_recv().unwrap();
        assert_eq!(update.origin, UpdateOrigin::Local);
        assert!(update.containers.contains("library"));
        assert!(update.containers.contains("lexicon"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dynamic_preferences_created_lazily() {
        let mut doc = SharedDocument::new();
        let prefs = ContainerRegistry::preferences_for("device-a");
        assert!(!doc.container_names().unwrap().contains(&prefs));

        doc.transact(|tx| tx.set(&prefs, "theme", &json!("dark"))).unwrap();
        assert_eq!(doc.get(&prefs, "theme").unwrap(), Some(json!("dark")));
    }

    #[test]
    fn test_two_devices_scenario() {
        let mut device_a = doc_with_book("book1", "Moby Dick");
        let mut device_b = SharedDocument::new();

        device_b.apply_update(&device_a.encode_state()).unwrap();
        assert_eq!(
            device_b.get("library", "book1").unwrap(),
            Some(json!({ "title": "Moby Dick" }))
        );

        device_b
            .transact(|tx| tx.set_field("progress", "book1", "deviceB", &json!({ "percentage": 0.5 })))
            .unwrap();

        device_a.apply_update(&device_b.encode_state()).unwrap();
        assert_eq!(
            device_a.get("library", "book1").unwrap(),
            Some(json!({ "title": "Moby Dick" }))
        );
        assert_eq!(
            device_a.get("progress", "book1").unwrap(),
            Some(json!({ "deviceB": { "percentage": 0.5 } }))
        );
    }

    #[test]
    fn test_independent_replicas_union_keys() {
        let mut a = doc_with_book("a", "Alpha");
        let mut b = doc_with_book("b", "Beta");

        a.apply_update(&b.encode_state()).unwrap();
        b.apply_update(&a.encode_state()).unwrap();

        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
        assert_eq!(a.len("library").unwrap(), 2);
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut a = doc_with_book("shared", "From A");
        let mut b = doc_with_book("shared", "From B");
        b.transact(|tx| tx.set("lexicon", "r1", &json!({ "original": "colour" })))
            .unwrap();
        let update_a = a.encode_state();
        let update_b = b.encode_state();

        let mut ab = SharedDocument::new();
        ab.apply_update(&update_a).unwrap();
        ab.apply_update(&update_b).unwrap();

        let mut ba = SharedDocument::new();
        ba.apply_update(&update_b).unwrap();
        ba.apply_update(&update_a).unwrap();

        assert_eq!(ab.snapshot().unwrap(), ba.snapshot().unwrap());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut source = doc_with_book("book1", "Moby Dick");
        let update = source.encode_state();

        let mut target = SharedDocument::new();
        assert!(target.apply_update(&update).unwrap());
        let once = target.snapshot().unwrap();

        assert!(!target.apply_update(&update).unwrap());
        assert_eq!(target.snapshot().unwrap(), once);
    }

    #[test]
    fn test_apply_update_rejects_garbage() {
        let mut doc = SharedDocument::new();
        assert!(matches!(
            doc.apply_update(b"not automerge"),
            Err(DocumentError::Decode(_))
        ));
    }

    #[test]
    fn test_remote_update_notifies_subscribers() {
        let mut source = doc_with_book("book1", "T");
        let mut target = SharedDocument::new();
        let mut rx = target.subscribe();

        target.apply_update(&source.encode_state()).unwrap();
        assert_eq!(rx.try_recv().unwrap().origin, UpdateOrigin::Remote);
    }

    #[test]
    fn test_replace_with_drops_entries_missing_from_source() {
        let mut live = doc_with_book("keep", "Keep");
        let mut source = SharedDocument::load(&live.encode_state()).unwrap();
        source
            .transact(|tx| tx.set("library", "restored", &json!({ "title": "R" })))
            .unwrap();

        live.transact(|tx| {
            tx.set("library", "extra", &json!({ "title": "Extra" }))?;
            tx.set("preferences/dev", "theme", &json!("dark"))
        })
        .unwrap();

        live.replace_with(&source).unwrap();

        let library = live.entries("library").unwrap();
        assert!(library.contains_key("keep"));
        assert!(library.contains_key("restored"));
        assert!(!library.contains_key("extra"));
        assert!(live.entries("preferences/dev").unwrap().is_empty());
    }

    #[test]
    fn test_sequence_append_and_items() {
        let mut doc = SharedDocument::new();
        // Sequences are only created for names declared as sequences
        let err = doc.transact(|tx| tx.append("library", &json!(1)));
        assert!(matches!(err, Err(DocumentError::WrongKind { .. })));
        assert!(doc.items("library").is_err());
    }

    #[test]
    fn test_migrate_runs_only_for_old_documents() {
        let mut doc = SharedDocument::new();
        let ran = doc.migrate(|_, _| Ok(())).unwrap();
        assert!(!ran);
    }
}
