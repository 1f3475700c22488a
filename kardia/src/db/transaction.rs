use crate::db::driver::{BulkOperation, CollectionKey, Document, Driver};
use crate::db::gateway::DatabaseGateway;
use crate::logging;
use hashbrown::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

pub type OpId = u64;
pub type EntityId = u64;

/// Bulk-eligible operation kinds. A contiguous run of these is submitted as
/// one bulk write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpType {
    Insert,
    DeleteOne,
    DeleteMany,
    UpdateOne,
    UpdateMany,
    UpsertOne,
    UpsertMany,
}

/// A barrier entry: the queue may not advance past it until the referenced
/// op on the owning entity's transaction is done.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Dependency {
    pub owner: EntityId,
    pub id: OpId,
}

/// An application callback executed with the raw collection handle on the
/// database fiber pool.
pub type Callable<D> = Box<dyn FnOnce(&<D as Driver>::Collection) + Send + 'static>;

enum Payload<D: Driver> {
    Bulk {
        ty: OpType,
        doc_1: Document,
        doc_2: Document,
    },
    Callable(Callable<D>),
}

/// Execution state shared between the queue and the database fiber that
/// runs the batch. `pending` means sent but not acknowledged; `done` means
/// acknowledged.
struct OpState {
    pending: AtomicBool,
    done: AtomicBool,
}

impl OpState {
    fn new() -> Arc<OpState> {
        Arc::new(OpState {
            pending: AtomicBool::new(false),
            done: AtomicBool::new(false),
        })
    }
}

struct OpEntry<D: Driver> {
    dependency: Option<Dependency>,
    payload: Option<Payload<D>>,
    state: Arc<OpState>,
}

struct CollectionInfo<D: Driver> {
    /// Prune cursor: every id below this has been acknowledged and removed.
    oldest_id: OpId,
    /// Next id to visit; advances over acknowledged-or-sent ops.
    first_id: OpId,
    /// Next id to hand out.
    current_id: AtomicU64,
    ops: HashMap<OpId, OpEntry<D>>,
}

impl<D: Driver> CollectionInfo<D> {
    fn new() -> CollectionInfo<D> {
        CollectionInfo {
            oldest_id: 0,
            first_id: 0,
            current_id: AtomicU64::new(0),
            ops: HashMap::new(),
        }
    }

    fn push(&mut self, entry: OpEntry<D>) -> OpId {
        let slot = self.current_id.fetch_add(1, Ordering::Relaxed);
        self.ops.insert(slot, entry);
        slot
    }
}

/// Per-entity ordered queues of database operations, one queue per
/// collection. Ops execute in push order within a (entity, collection)
/// pair; cross-entity ordering is only constrained by explicit dependency
/// barriers. Bulk-eligible runs are flushed as single bulk writes, callable
/// runs as callback sequences, never mixed in one submission.
pub struct Transaction<D: Driver> {
    collections: HashMap<CollectionKey, CollectionInfo<D>>,
    execute_every: u64,
    since_last: u64,
    pending_callables: AtomicU8,
    flagged: bool,
    scheduled: bool,
}

impl<D: Driver> Transaction<D> {
    /// Builds the full set of per-collection queues up front so pushes
    /// never race collection creation.
    pub fn new(gateway: &DatabaseGateway<D>, execute_every: u64) -> Transaction<D> {
        Transaction {
            collections: gateway
                .collection_keys()
                .into_iter()
                .map(|key| (key, CollectionInfo::new()))
                .collect(),
            execute_every,
            since_last: 0,
            pending_callables: AtomicU8::new(0),
            flagged: false,
            scheduled: false,
        }
    }

    /// Append a single-document operation (insert, delete). Returns the
    /// op id for use as a dependency target.
    pub fn push_operation(&mut self, collection: CollectionKey, ty: OpType, operation: Document) -> OpId {
        self.collection_mut(collection).push(OpEntry {
            dependency: None,
            payload: Some(Payload::Bulk {
                ty,
                doc_1: operation,
                doc_2: Document::Null,
            }),
            state: OpState::new(),
        })
    }

    /// Append a two-document operation (update, upsert: filter + update).
    pub fn push_operation_pair(
        &mut self,
        collection: CollectionKey,
        ty: OpType,
        operation_1: Document,
        operation_2: Document,
    ) -> OpId {
        self.collection_mut(collection).push(OpEntry {
            dependency: None,
            payload: Some(Payload::Bulk {
                ty,
                doc_1: operation_1,
                doc_2: operation_2,
            }),
            state: OpState::new(),
        })
    }

    /// Append a callable op. Callables force a flush on the next update.
    pub fn push_callable(&mut self, collection: CollectionKey, callable: Callable<D>) -> OpId {
        self.pending_callables.fetch_add(1, Ordering::Relaxed);
        self.collection_mut(collection).push(OpEntry {
            dependency: None,
            payload: Some(Payload::Callable(callable)),
            state: OpState::new(),
        })
    }

    /// Append a dependency barrier on `{owner, id}` in the same collection
    /// of another entity's transaction.
    pub fn push_dependency(&mut self, collection: CollectionKey, owner: EntityId, id: OpId) {
        self.collection_mut(collection).push(OpEntry {
            dependency: Some(Dependency { owner, id }),
            payload: None,
            state: OpState::new(),
        });
    }

    /// Whether the op with `id` in `collection` has been acknowledged.
    /// `None` when the entry is unknown (never existed, or already pruned —
    /// pruned implies acknowledged).
    pub fn op_done(&self, collection: CollectionKey, id: OpId) -> Option<bool> {
        self.collections
            .get(&collection)?
            .ops
            .get(&id)
            .map(|entry| entry.state.done.load(Ordering::Acquire))
    }

    /// Mark the transaction for deletion. Once every queue has drained and
    /// acknowledged, `update` returns false and the caller drops the
    /// transaction.
    #[inline]
    pub fn flag_deletion(&mut self) {
        self.flagged = true;
    }

    #[inline]
    pub fn unflag_deletion(&mut self) {
        self.flagged = false;
        self.scheduled = false;
    }

    /// Advance the queues. Returns false exactly when the transaction has
    /// been flagged for deletion and every op is acknowledged; the caller
    /// must then drop it.
    ///
    /// `diff` is the elapsed base time since the previous call; a flush is
    /// triggered once `execute_every` has accumulated or whenever a
    /// callable is waiting. `resolver` maps entity ids to other
    /// transactions for dependency checks; unresolvable owners or ops count
    /// as met.
    pub fn update<F, R>(&mut self, diff: u64, gateway: &DatabaseGateway<D>, mut resolver: F) -> bool
    where
        F: FnMut(EntityId) -> Option<R>,
        R: Deref<Target = Transaction<D>>,
    {
        if self.flagged {
            if self.scheduled {
                return false;
            }

            if self.drained() {
                self.scheduled = true;
                return false;
            }
        }

        // Flush when enough base time accumulated or a callable is waiting.
        self.since_last += diff;
        if self.pending_callables.load(Ordering::Relaxed) == 0 && self.since_last < self.execute_every {
            return true;
        }
        self.since_last = 0;

        let keys: Vec<CollectionKey> = self.collections.keys().copied().collect();
        for collection in keys {
            let info = self
                .collections
                .get_mut(&collection)
                .expect("Collection vanished mid-update");

            if info.first_id == info.current_id.load(Ordering::Relaxed) {
                Self::prune(info);
                continue;
            }

            let (batch, has_bulk) =
                Self::select_batch(info, &self.pending_callables, collection, &mut resolver);
            Self::prune(info);

            if batch.is_empty() {
                continue;
            }

            let log = gateway.log().clone();
            if has_bulk {
                gateway.execute(move |session| {
                    let handle = session.collection(collection);
                    let mut bulk = session.driver().create_bulk(&handle);
                    let mut states = Vec::with_capacity(batch.len());

                    for (state, payload) in batch {
                        match payload {
                            Payload::Bulk { ty, doc_1, doc_2 } => match ty {
                                OpType::Insert => bulk.insert(doc_1),
                                OpType::UpdateOne => bulk.update_one(doc_1, doc_2),
                                OpType::UpdateMany => bulk.update_many(doc_1, doc_2),
                                OpType::UpsertOne | OpType::UpsertMany => bulk.upsert(doc_1, doc_2),
                                OpType::DeleteOne | OpType::DeleteMany => bulk.delete(doc_1),
                            },
                            Payload::Callable(_) => panic!("Callable op in a bulk batch"),
                        }
                        states.push(state);
                    }

                    match session.driver().execute_bulk(&handle, bulk) {
                        Ok(reply) => {
                            logging::trace!(log, "bulk executed";
                                            "collection" => collection,
                                            "reply" => %reply);
                        }
                        Err(err) => {
                            // At-most-once: the ops are acknowledged anyway
                            // so the queue drains; the application
                            // reconciles.
                            logging::error!(log, "bulk write failed";
                                            "collection" => collection,
                                            "error" => %err);
                        }
                    }

                    for state in states {
                        state.done.store(true, Ordering::Release);
                        state.pending.store(false, Ordering::Release);
                    }
                });
            } else {
                gateway.execute(move |session| {
                    let handle = session.collection(collection);

                    for (state, payload) in batch {
                        match payload {
                            Payload::Callable(callable) => callable(&handle),
                            Payload::Bulk { .. } => panic!("Bulk op in a callable batch"),
                        }
                        state.done.store(true, Ordering::Release);
                        state.pending.store(false, Ordering::Release);
                    }
                });
            }
        }

        true
    }

    /// Every queue empty and its last op acknowledged.
    fn drained(&self) -> bool {
        for info in self.collections.values() {
            let current = info.current_id.load(Ordering::Relaxed);
            if info.first_id != current {
                return false;
            }

            if current > 0 {
                if let Some(entry) = info.ops.get(&(current - 1)) {
                    if !entry.state.done.load(Ordering::Acquire) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Walk from `first_id` collecting the next homogeneous batch: stop at
    /// an op already in flight, an unmet dependency, or a callable/bulk
    /// mode switch. Consumed barriers are acknowledged in place; ops added
    /// to the batch are marked pending.
    fn select_batch<F, R>(
        info: &mut CollectionInfo<D>,
        pending_callables: &AtomicU8,
        collection: CollectionKey,
        resolver: &mut F,
    ) -> (Vec<(Arc<OpState>, Payload<D>)>, bool)
    where
        F: FnMut(EntityId) -> Option<R>,
        R: Deref<Target = Transaction<D>>,
    {
        let current = info.current_id.load(Ordering::Relaxed);
        let mut batch = Vec::new();
        let mut has_bulk = false;
        let mut has_callable = false;

        let mut id = info.first_id;
        while id != current {
            let entry = info
                .ops
                .get(&id)
                .expect("Missing transaction entry inside the live window");

            if entry.state.pending.load(Ordering::Acquire) {
                break;
            }

            if entry.state.done.load(Ordering::Acquire) {
                id += 1;
                continue;
            }

            if let Some(dependency) = entry.dependency {
                let met = match resolver(dependency.owner) {
                    Some(other) => other.op_done(collection, dependency.id).unwrap_or(true),
                    None => true,
                };

                if !met {
                    break;
                }

                // Barrier consumed; acknowledge it so the deletion
                // handshake can drain past it.
                entry.state.done.store(true, Ordering::Release);
                id += 1;
                continue;
            }

            let entry = info
                .ops
                .get_mut(&id)
                .expect("Missing transaction entry inside the live window");

            let is_callable = matches!(entry.payload, Some(Payload::Callable(_)));
            if is_callable {
                if has_bulk {
                    break;
                }
                has_callable = true;
                pending_callables.fetch_sub(1, Ordering::Relaxed);
            } else {
                if has_callable {
                    break;
                }
                has_bulk = true;
            }

            entry.state.pending.store(true, Ordering::Release);
            let payload = entry.payload.take().expect("Transaction payload already taken");
            batch.push((entry.state.clone(), payload));
            id += 1;
        }

        info.first_id = id;
        (batch, has_bulk)
    }

    /// Drop acknowledged entries behind `first_id`. Entries that are sent
    /// but unacknowledged stay resident so cross-entity dependency lookups
    /// never mistake an in-flight op for a completed one.
    fn prune(info: &mut CollectionInfo<D>) {
        while info.oldest_id < info.first_id {
            match info.ops.get(&info.oldest_id) {
                Some(entry) if entry.state.done.load(Ordering::Acquire) => {
                    info.ops.remove(&info.oldest_id);
                    info.oldest_id += 1;
                }
                _ => break,
            }
        }
    }

    fn collection_mut(&mut self, collection: CollectionKey) -> &mut CollectionInfo<D> {
        self.collections
            .get_mut(&collection)
            .unwrap_or_else(|| panic!("Unknown collection key {}", collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mem::{MemDriver, Submission};
    use crate::fiber::{Counter, TaskPool};
    use serde_json::json;

    const ITEMS: CollectionKey = 0;
    const EVENTS: CollectionKey = 1;
    const EVERY: u64 = 100;

    fn setup() -> (MemDriver, DatabaseGateway<MemDriver>, Arc<TaskPool>) {
        let driver = MemDriver::new();
        let pool = Arc::new(TaskPool::new("db", None));
        pool.start(1);

        let gateway = DatabaseGateway::new(
            driver.clone(),
            "game",
            vec![(ITEMS, "items"), (EVENTS, "events")],
            None,
        );
        gateway.attach_pool(pool.clone());
        (driver, gateway, pool)
    }

    /// Wait until every database job queued so far has run.
    fn flush(pool: &TaskPool) {
        let counter = Counter::new();
        pool.push_with(|| {}, &counter);
        counter.wait();
    }

    fn no_deps(_: EntityId) -> Option<&'static Transaction<MemDriver>> {
        None
    }

    #[test]
    fn test_bulk_batch_coalescing() {
        let (driver, gateway, pool) = setup();
        let mut tx = Transaction::new(&gateway, EVERY);

        for i in 0..5 {
            tx.push_operation(ITEMS, OpType::Insert, json!({"_id": i}));
        }
        for i in 0..3 {
            tx.push_operation_pair(
                ITEMS,
                OpType::UpdateOne,
                json!({"_id": i}),
                json!({"$set": {"seen": true}}),
            );
        }
        for i in 0..2 {
            tx.push_operation(ITEMS, OpType::DeleteOne, json!({"_id": i}));
        }

        // Below the flush threshold nothing moves.
        assert!(tx.update(EVERY - 1, &gateway, no_deps));
        flush(&pool);
        assert!(driver.submissions().is_empty());

        // One more unit crosses the threshold: a single bulk of all ten
        // ops in push order.
        assert!(tx.update(1, &gateway, no_deps));
        flush(&pool);

        assert_eq!(
            driver.submissions(),
            vec![Submission::Bulk {
                collection: "items".to_string(),
                ops: vec![
                    "insert", "insert", "insert", "insert", "insert",
                    "update_one", "update_one", "update_one",
                    "delete", "delete",
                ],
            }]
        );
        assert_eq!(driver.documents("items").len(), 3);

        pool.end();
        pool.join();
    }

    #[test]
    fn test_callable_barrier_never_mixes() {
        let (driver, gateway, pool) = setup();
        let mut tx = Transaction::new(&gateway, EVERY);

        tx.push_operation(ITEMS, OpType::Insert, json!({"_id": 1}));
        tx.push_operation(ITEMS, OpType::Insert, json!({"_id": 2}));

        let observer = driver.clone();
        let seen_at = Arc::new(AtomicU64::new(u64::MAX));
        let record = seen_at.clone();
        tx.push_callable(
            ITEMS,
            Box::new(move |_collection| {
                record.store(observer.submissions().len() as u64, Ordering::SeqCst);
            }),
        );

        tx.push_operation(ITEMS, OpType::Insert, json!({"_id": 3}));
        tx.push_operation(ITEMS, OpType::Insert, json!({"_id": 4}));

        // First flush: the leading bulk only, the callable stops the walk.
        assert!(tx.update(EVERY, &gateway, no_deps));
        flush(&pool);
        // Second: the callable alone.
        assert!(tx.update(EVERY, &gateway, no_deps));
        flush(&pool);
        // Third: the trailing bulk.
        assert!(tx.update(EVERY, &gateway, no_deps));
        flush(&pool);

        let bulk_pair = Submission::Bulk {
            collection: "items".to_string(),
            ops: vec!["insert", "insert"],
        };
        assert_eq!(driver.submissions(), vec![bulk_pair.clone(), bulk_pair]);

        // The callable observed exactly one bulk already submitted: it ran
        // strictly between the two.
        assert_eq!(seen_at.load(Ordering::SeqCst), 1);
        assert_eq!(driver.documents("items").len(), 4);

        pool.end();
        pool.join();
    }

    #[test]
    fn test_callable_triggers_immediate_flush() {
        let (driver, gateway, pool) = setup();
        let mut tx = Transaction::new(&gateway, EVERY);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tx.push_callable(
            EVENTS,
            Box::new(move |_| {
                flag.store(true, Ordering::SeqCst);
            }),
        );

        // Zero elapsed time, but a callable is waiting.
        assert!(tx.update(0, &gateway, no_deps));
        flush(&pool);
        assert!(ran.load(Ordering::SeqCst));

        // The counter was consumed when the callable went pending; nothing
        // further to flush.
        assert!(tx.update(0, &gateway, no_deps));
        flush(&pool);
        assert!(driver.submissions().is_empty());

        pool.end();
        pool.join();
    }

    #[test]
    fn test_dependency_blocks_until_done() {
        let (driver, gateway, pool) = setup();

        let mut owner = Transaction::new(&gateway, EVERY);
        let target = owner.push_operation(ITEMS, OpType::Insert, json!({"_id": 10}));

        let mut dependent = Transaction::new(&gateway, EVERY);
        dependent.push_dependency(ITEMS, 1, target);
        dependent.push_operation(ITEMS, OpType::Insert, json!({"_id": 11}));

        // The owner has not flushed: the dependent op must not dispatch.
        assert!(dependent.update(EVERY, &gateway, |id| {
            if id == 1 { Some(&owner) } else { None }
        }));
        flush(&pool);
        assert!(driver.submissions().is_empty());
        assert_eq!(dependent.op_done(ITEMS, 1), Some(false));

        // Owner flushes and acknowledges.
        assert!(owner.update(EVERY, &gateway, no_deps));
        flush(&pool);
        assert_eq!(owner.op_done(ITEMS, target), Some(true));

        // First update after completion releases the barrier.
        assert!(dependent.update(EVERY, &gateway, |id| {
            if id == 1 { Some(&owner) } else { None }
        }));
        flush(&pool);
        assert_eq!(driver.documents("items").len(), 2);

        pool.end();
        pool.join();
    }

    #[test]
    fn test_dependency_on_missing_owner_is_met() {
        let (driver, gateway, pool) = setup();
        let mut tx = Transaction::new(&gateway, EVERY);

        tx.push_dependency(ITEMS, 99, 7);
        tx.push_operation(ITEMS, OpType::Insert, json!({"_id": 1}));

        assert!(tx.update(EVERY, &gateway, no_deps));
        flush(&pool);
        assert_eq!(driver.documents("items").len(), 1);

        pool.end();
        pool.join();
    }

    #[test]
    fn test_deletion_handshake() {
        let (_driver, gateway, pool) = setup();
        let mut tx = Transaction::new(&gateway, EVERY);

        tx.push_operation(ITEMS, OpType::Insert, json!({"_id": 1}));
        tx.flag_deletion();

        // Not drained yet: stays alive and flushes.
        assert!(tx.update(EVERY, &gateway, no_deps));
        flush(&pool);

        // Everything acknowledged: schedules itself for deletion.
        assert!(!tx.update(0, &gateway, no_deps));
        // And keeps saying so.
        assert!(!tx.update(0, &gateway, no_deps));

        tx.unflag_deletion();
        assert!(tx.update(0, &gateway, no_deps));

        pool.end();
        pool.join();
    }

    #[test]
    fn test_deletion_waits_for_trailing_barrier() {
        let (_driver, gateway, pool) = setup();

        let mut owner = Transaction::new(&gateway, EVERY);
        let target = owner.push_operation(ITEMS, OpType::Insert, json!({"_id": 1}));

        let mut tx = Transaction::new(&gateway, EVERY);
        tx.push_dependency(ITEMS, 1, target);
        tx.flag_deletion();

        // The barrier is unmet, so the queue has not drained.
        assert!(tx.update(EVERY, &gateway, |id| {
            if id == 1 { Some(&owner) } else { None }
        }));

        assert!(owner.update(EVERY, &gateway, no_deps));
        flush(&pool);

        // Barrier passes and is acknowledged; the next update deletes.
        assert!(tx.update(EVERY, &gateway, |id| {
            if id == 1 { Some(&owner) } else { None }
        }));
        assert!(!tx.update(0, &gateway, no_deps));

        pool.end();
        pool.join();
    }

    #[test]
    fn test_acknowledged_entries_pruned() {
        let (_driver, gateway, pool) = setup();
        let mut tx = Transaction::new(&gateway, EVERY);

        for i in 0..8 {
            tx.push_operation(ITEMS, OpType::Insert, json!({"_id": i}));
        }
        assert!(tx.update(EVERY, &gateway, no_deps));
        flush(&pool);

        // A further update sweeps the acknowledged window.
        assert!(tx.update(EVERY, &gateway, no_deps));
        let info = tx.collections.get(&ITEMS).unwrap();
        assert_eq!(info.oldest_id, 8);
        assert!(info.ops.is_empty());

        pool.end();
        pool.join();
    }

    #[test]
    #[should_panic]
    fn test_unknown_collection_panics() {
        let (_driver, gateway, _pool) = setup();
        let mut tx = Transaction::new(&gateway, EVERY);
        tx.push_operation(42, OpType::Insert, json!({}));
    }
}
