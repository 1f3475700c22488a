use crate::db::driver::{BulkOperation, Document, Driver, DriverError, DriverResult};
use hashbrown::HashMap;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// An in-memory document store implementing the driver contract. Backs the
/// runner's embedded mode and the engine tests: duplicate `_id` detection on
/// insert, top-level-subset filter matching, `$set`/replace updates, and a
/// submission journal the tests assert against.
#[derive(Clone)]
pub struct MemDriver {
    store: Arc<MemStore>,
}

struct MemStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    journal: Mutex<Vec<Submission>>,
    rigged_inserts: Mutex<VecDeque<DriverError>>,
}

/// One executed submission, as observed by the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Submission {
    Insert { collection: String },
    Bulk { collection: String, ops: Vec<&'static str> },
}

/// Collection handle: the store plus a resolved collection name.
pub struct MemCollection {
    store: Arc<MemStore>,
    name: String,
}

pub struct MemBulk {
    ops: Vec<MemOp>,
}

enum MemOp {
    Insert(Document),
    UpdateOne(Document, Document),
    UpdateMany(Document, Document),
    Upsert(Document, Document),
    Delete(Document),
}

impl MemOp {
    fn tag(&self) -> &'static str {
        match self {
            MemOp::Insert(_) => "insert",
            MemOp::UpdateOne(..) => "update_one",
            MemOp::UpdateMany(..) => "update_many",
            MemOp::Upsert(..) => "upsert",
            MemOp::Delete(_) => "delete",
        }
    }
}

impl MemDriver {
    pub fn new() -> MemDriver {
        MemDriver {
            store: Arc::new(MemStore {
                collections: Mutex::new(HashMap::new()),
                journal: Mutex::new(Vec::new()),
                rigged_inserts: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Snapshot of a collection's documents.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.store
            .collections
            .lock()
            .expect("Mem store poisoned")
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Everything executed so far, in execution order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.store.journal.lock().expect("Mem store poisoned").clone()
    }

    /// Force the next `insert_one` calls to fail with the given errors, in
    /// order. Used to exercise the gateway's retry paths.
    pub fn rig_insert_failures(&self, errors: Vec<DriverError>) {
        self.store.rigged_inserts.lock().expect("Mem store poisoned").extend(errors);
    }
}

impl MemStore {
    fn insert(&self, collection: &str, document: Document) -> DriverResult<()> {
        if let Some(error) = self.rigged_inserts.lock().expect("Mem store poisoned").pop_front() {
            return Err(error);
        }

        let mut collections = self.collections.lock().expect("Mem store poisoned");
        let documents = collections.entry_ref(collection).or_default();

        if let Some(id) = document.get("_id") {
            if documents.iter().any(|d| d.get("_id") == Some(id)) {
                return Err(DriverError::DuplicateKey);
            }
        }

        documents.push(document);
        Ok(())
    }

    fn apply(&self, collection: &str, op: MemOp) -> u64 {
        match op {
            MemOp::Insert(document) => match self.insert(collection, document) {
                Ok(()) => 1,
                Err(_) => 0,
            },
            MemOp::UpdateOne(filter, update) => self.update(collection, &filter, &update, false, false),
            MemOp::UpdateMany(filter, update) => self.update(collection, &filter, &update, true, false),
            MemOp::Upsert(filter, update) => self.update(collection, &filter, &update, true, true),
            MemOp::Delete(filter) => {
                let mut collections = self.collections.lock().expect("Mem store poisoned");
                let documents = collections.entry_ref(collection).or_default();
                let before = documents.len();
                documents.retain(|d| !matches(d, &filter));
                (before - documents.len()) as u64
            }
        }
    }

    fn update(&self, collection: &str, filter: &Document, update: &Document, many: bool, upsert: bool) -> u64 {
        let mut collections = self.collections.lock().expect("Mem store poisoned");
        let documents = collections.entry_ref(collection).or_default();

        let mut touched = 0;
        for document in documents.iter_mut() {
            if matches(document, filter) {
                apply_update(document, update);
                touched += 1;
                if !many {
                    break;
                }
            }
        }

        if touched == 0 && upsert {
            let mut fresh = filter.clone();
            apply_update(&mut fresh, update);
            documents.push(fresh);
            touched = 1;
        }

        touched
    }
}

/// Top-level subset match: every field of the filter must equal the
/// document's field.
fn matches(document: &Document, filter: &Document) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| document.get(k) == Some(v)),
        None => false,
    }
}

/// `$set` merges fields; any other update document replaces everything but
/// the `_id`.
fn apply_update(document: &mut Document, update: &Document) {
    if let Some(set) = update.get("$set").and_then(|s| s.as_object()) {
        for (k, v) in set {
            document[k] = v.clone();
        }
        return;
    }

    let id = document.get("_id").cloned();
    *document = update.clone();
    if let (Some(id), Some(object)) = (id, document.as_object_mut()) {
        object.entry("_id").or_insert(id);
    }
}

impl Driver for MemDriver {
    type Client = ();
    type Database = ();
    type Collection = MemCollection;
    type Bulk = MemBulk;

    fn checkout(&self) -> () {}

    fn checkin(&self, _client: ()) {}

    fn ping(&self) -> DriverResult<()> {
        Ok(())
    }

    fn database(&self, _client: &(), _name: &str) -> () {}

    fn collection(&self, _database: &(), name: &str) -> MemCollection {
        MemCollection {
            store: self.store.clone(),
            name: name.to_string(),
        }
    }

    fn insert_one(&self, collection: &MemCollection, document: Document) -> DriverResult<()> {
        let result = collection.store.insert(&collection.name, document);
        if result.is_ok() {
            collection.store.journal.lock().expect("Mem store poisoned").push(Submission::Insert {
                collection: collection.name.clone(),
            });
        }
        result
    }

    fn create_bulk(&self, _collection: &MemCollection) -> MemBulk {
        MemBulk { ops: Vec::new() }
    }

    fn execute_bulk(&self, collection: &MemCollection, bulk: MemBulk) -> DriverResult<Document> {
        let tags: Vec<&'static str> = bulk.ops.iter().map(MemOp::tag).collect();

        let mut touched = 0;
        for op in bulk.ops {
            touched += collection.store.apply(&collection.name, op);
        }

        collection.store.journal.lock().expect("Mem store poisoned").push(Submission::Bulk {
            collection: collection.name.clone(),
            ops: tags,
        });

        Ok(json!({ "nTouched": touched }))
    }
}

impl MemCollection {
    /// Name of the collection this handle points at. Available to callables
    /// executing on the database pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Documents currently in the collection.
    pub fn documents(&self) -> Vec<Document> {
        self.store
            .collections
            .lock()
            .expect("Mem store poisoned")
            .get(&self.name)
            .cloned()
            .unwrap_or_default()
    }
}

impl BulkOperation for MemBulk {
    fn insert(&mut self, document: Document) {
        self.ops.push(MemOp::Insert(document));
    }

    fn update_one(&mut self, filter: Document, update: Document) {
        self.ops.push(MemOp::UpdateOne(filter, update));
    }

    fn update_many(&mut self, filter: Document, update: Document) {
        self.ops.push(MemOp::UpdateMany(filter, update));
    }

    fn upsert(&mut self, filter: Document, update: Document) {
        self.ops.push(MemOp::Upsert(filter, update));
    }

    fn delete(&mut self, filter: Document) {
        self.ops.push(MemOp::Delete(filter));
    }

    fn len(&self) -> usize {
        self.ops.len()
    }
}
