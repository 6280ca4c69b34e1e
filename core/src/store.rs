//! The transactional store: one collection, atomic batches, event fan-out
//! and reactive predicate queries (spec.md §4.5, §4.5.1).
//!
//! Grounded on `topgun-core`'s own construction-time dependency injection
//! pattern (`HLC::new`/`with_system_clock` in `hlc.rs`) for `Store::new`, and
//! on `traits.rs`'s `QueryNotifier` shape for the store's write-path
//! notification, generalized from a single old/new callback to the
//! `added`/`updated`/`removed` batch spec.md requires. The query handle is a
//! token (`QueryId`) plus explicit store-parameter methods rather than a
//! shared `Rc<RefCell<_>>` handle, keeping `Store` itself trivially `Send`
//! for the "wrap the whole store in one external mutex" concurrency model
//! spec.md §5 prescribes.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use uuid::Uuid;

use crate::clock::{ClockSource, SystemClock, HLC};
use crate::document::{EncodedDocument, Record, Value};
use crate::error::{Result, StarlingError};
use crate::eventstamp::Eventstamp;
use crate::merge::{self, Transition};

/// Injectable id generator for new documents (spec.md §9 "Open question:
/// ID generation"). Default is [`UuidGenerator`]; tests can inject a
/// deterministic generator.
pub trait IdGenerator: Send {
    /// Produces a fresh, collection-unique id.
    fn generate(&mut self) -> String;
}

/// Default id generator: random UUID v4.
#[derive(Debug, Clone, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&mut self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// One batch of mutations, emitted once per commit (spec.md §4.5 "Event
/// shape").
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Documents whose first live state arose this batch.
    pub added: Vec<(String, Record)>,
    /// Documents live before and after, whose `latest` advanced.
    pub updated: Vec<(String, Record, Record)>,
    /// Documents tombstoned this batch.
    pub removed: Vec<(String, Record)>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

type Subscriber<T> = Box<dyn FnMut(&T) + Send>;

#[derive(Default)]
struct Subscribers {
    add: Vec<(u64, Subscriber<(String, Record)>)>,
    update: Vec<(u64, Subscriber<(String, Record, Record)>)>,
    delete: Vec<(u64, Subscriber<(String, Record)>)>,
    mutation: Vec<(u64, Subscriber<Batch>)>,
    next_id: u64,
}

/// Token returned by `on_add`/`on_update`/`on_delete`/[`Store::on_mutation`];
/// call [`Store::unsubscribe`] with it to detach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Opaque handle returned by [`Store::query`]. Methods take `&Store`/
/// `&mut Store` explicitly rather than holding a reference, so `Store`
/// itself stays `Send` with no interior sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

#[allow(clippy::type_complexity)]
struct QuerySpec {
    matches: Box<dyn FnMut(&Record) -> bool + Send>,
    select: Option<Box<dyn FnMut(&Record) -> Value + Send>>,
    order: Option<Box<dyn FnMut(&Value, &Value) -> std::cmp::Ordering + Send>>,
    /// Insertion order is the id order of the first scan / first match;
    /// stable across unchanged sets per spec.md §4.5.1.
    results: BTreeMap<String, Value>,
    on_change: Vec<Box<dyn FnMut() + Send>>,
}

impl QuerySpec {
    /// Applies `select` (identity if absent), panic-guarded. `None` means
    /// `select` panicked; spec.md §4.5.1 treats that like a predicate
    /// panic, the document is excluded.
    fn select_value(&mut self, id: &str, record: &Record) -> Option<Value> {
        match &mut self.select {
            None => Some(Value::Object(record.clone())),
            Some(select) => match panic::catch_unwind(AssertUnwindSafe(|| select(record))) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(id, "query select panicked; treating as non-match");
                    None
                }
            },
        }
    }

    /// Sorted snapshot if `order` is set, else stable id order.
    fn sorted_results(&mut self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> =
            self.results.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if let Some(order) = &mut self.order {
            entries.sort_by(|a, b| order(&a.1, &b.1));
        }
        entries
    }
}

/// A per-collection store: the document map, the clock, subscribers, and
/// live queries (spec.md §4.5).
pub struct Store {
    resources: BTreeMap<String, EncodedDocument>,
    clock: HLC,
    id_generator: Box<dyn IdGenerator>,
    subscribers: Subscribers,
    queries: BTreeMap<u64, QuerySpec>,
    next_query_id: u64,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Box::new(SystemClock), Box::new(UuidGenerator))
    }
}

impl Store {
    /// Creates an empty store with injected clock source and id generator.
    #[must_use]
    pub fn new(clock_source: Box<dyn ClockSource>, id_generator: Box<dyn IdGenerator>) -> Self {
        Self {
            resources: BTreeMap::new(),
            clock: HLC::new(clock_source),
            id_generator,
            subscribers: Subscribers::default(),
            queries: BTreeMap::new(),
            next_query_id: 0,
        }
    }

    /// Inserts a new live document, allocating an id unless `with_id` names
    /// one.
    ///
    /// # Errors
    ///
    /// [`StarlingError::DuplicateId`] if the id already names a live
    /// document. Re-adding a tombstoned id is permitted: the incoming value
    /// is field-level LWW merged against the retained tombstone rather than
    /// overwriting it outright (spec.md §4.5, §8 "re-adding a tombstoned id
    /// is permitted and produces field-level LWW ... tombstone wins any
    /// field whose incoming stamp is older"), so the document stays
    /// excluded from reads unless the tombstone itself is superseded.
    pub fn add(&mut self, value: Record, with_id: Option<String>) -> Result<String> {
        let id = with_id.unwrap_or_else(|| self.id_generator.generate());
        if let Some(existing) = self.resources.get(&id) {
            if existing.is_live() {
                return Err(StarlingError::DuplicateId(id));
            }
        }

        let stamp = self.clock.now();
        let incoming = EncodedDocument::make_resource(&id, Value::Object(value), stamp);

        let mut batch = Batch::default();
        match self.resources.get(&id) {
            Some(existing) => {
                let merged = merge::merge_resources(existing, &incoming)?;
                self.resources.insert(id.clone(), merged);
            }
            None => {
                batch.added.push((id.clone(), record_of(&incoming)));
                self.resources.insert(id.clone(), incoming);
            }
        }

        self.emit(batch);
        Ok(id)
    }

    /// Overlays `partial`'s fields onto the current document with a fresh
    /// stamp, then merges (spec.md §4.5, "the same LWW rules apply even
    /// locally").
    ///
    /// # Errors
    ///
    /// [`StarlingError::NotFound`] if `id` has no live document.
    pub fn update(&mut self, id: &str, partial: Record) -> Result<()> {
        let current = self
            .resources
            .get(id)
            .filter(|doc| doc.is_live())
            .ok_or_else(|| StarlingError::NotFound(id.to_string()))?
            .clone();

        let stamp = self.clock.now();
        let overlay = EncodedDocument::make_resource(id, Value::Object(partial), stamp);
        let merged = merge::merge_resources(&current, &overlay)?;

        let before = record_of(&current);
        let after = record_of(&merged);
        self.resources.insert(id.to_string(), merged);

        let mut batch = Batch::default();
        batch.updated.push((id.to_string(), before, after));
        self.emit(batch);
        Ok(())
    }

    /// Tombstones `id` at a fresh stamp. Idempotent: removing an already
    /// tombstoned id just advances its tombstone stamp and emits no event
    /// since it was not live before.
    ///
    /// # Errors
    ///
    /// [`StarlingError::NotFound`] if `id` is not present at all.
    pub fn remove(&mut self, id: &str) -> Result<()> {
        let current = self
            .resources
            .get(id)
            .ok_or_else(|| StarlingError::NotFound(id.to_string()))?
            .clone();
        let was_live = current.is_live();
        let last_record = record_of(&current);

        let stamp = self.clock.now();
        let deleted = current.delete_resource(stamp);
        self.resources.insert(id.to_string(), deleted);

        let mut batch = Batch::default();
        if was_live {
            batch.removed.push((id.to_string(), last_record));
        }
        self.emit(batch);
        Ok(())
    }

    /// Returns the decoded record, or `None` if absent or tombstoned.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Record> {
        self.resources
            .get(id)
            .filter(|doc| doc.is_live())
            .map(record_of)
    }

    /// Live documents only, in id order.
    pub fn entries(&self) -> impl Iterator<Item = (String, Record)> + '_ {
        self.resources
            .iter()
            .filter(|(_, doc)| doc.is_live())
            .map(|(id, doc)| (id.clone(), record_of(doc)))
    }

    /// A full snapshot of this collection, for persistence or sync
    /// (spec.md §6).
    #[must_use]
    pub fn collection(&self) -> Snapshot {
        Snapshot {
            docs: self.resources.values().cloned().collect(),
            eventstamp: self.clock.latest(),
        }
    }

    /// Fast-forwards the clock, merges every document in `snapshot`, and
    /// emits one batch classified per spec.md §4.4's transitions.
    ///
    /// # Errors
    ///
    /// Propagates [`merge::merge_resources`]'s structural errors. On error
    /// no part of the snapshot has been applied.
    pub fn merge(&mut self, snapshot: Snapshot) -> Result<()> {
        self.clock.forward(&snapshot.eventstamp)?;

        let remote: BTreeMap<String, EncodedDocument> = snapshot
            .docs
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect();

        let merged = merge::merge_collections(&self.resources, &remote)?;

        let mut batch = Batch::default();
        for entry in merged {
            match entry.transition {
                Transition::Added => {
                    batch
                        .added
                        .push((entry.id.clone(), record_of(&entry.document)));
                }
                Transition::Updated => {
                    let before = entry
                        .previous
                        .as_ref()
                        .map(record_of)
                        .unwrap_or_default();
                    batch
                        .updated
                        .push((entry.id.clone(), before, record_of(&entry.document)));
                }
                Transition::Removed => {
                    let last = entry
                        .previous
                        .as_ref()
                        .map(record_of)
                        .unwrap_or_default();
                    batch.removed.push((entry.id.clone(), last));
                }
                Transition::NoOp => {}
            }
            self.resources.insert(entry.id, entry.document);
        }

        self.emit(batch);
        Ok(())
    }

    /// Runs `f` against a transaction staged over a copy of this store's
    /// resources. If `f` returns `Ok`, the staging is swapped in atomically
    /// and one aggregated event batch fires; if `f` returns `Err`, nothing
    /// is applied and no events fire (spec.md §4.5 "Atomicity of
    /// transactions").
    ///
    /// # Errors
    ///
    /// Returns whatever error `f` returns; the store is left unchanged.
    pub fn begin<R>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut tx = Transaction {
            staging: self.resources.clone(),
            clock: &mut self.clock,
            id_generator: self.id_generator.as_mut(),
            batch: Batch::default(),
            rolled_back: false,
        };
        let result = f(&mut tx)?;
        let rolled_back = tx.rolled_back;
        let staging = tx.staging;
        let batch = tx.batch;

        if rolled_back {
            return Ok(result);
        }

        self.resources = staging;
        self.emit(batch);
        Ok(result)
    }

    /// Subscribes to the `mutation` stream: fires once per commit, carrying
    /// the whole batch (spec.md §4.5, `"mutation" is the union batch used
    /// by queries`).
    pub fn on_mutation(&mut self, handler: impl FnMut(&Batch) + Send + 'static) -> SubscriptionId {
        let id = self.subscribers.next_id;
        self.subscribers.next_id += 1;
        self.subscribers.mutation.push((id, Box::new(handler)));
        SubscriptionId(id)
    }

    /// Subscribes to the `add` stream: fires once per added document.
    pub fn on_add(&mut self, handler: impl FnMut(&(String, Record)) + Send + 'static) -> SubscriptionId {
        let id = self.subscribers.next_id;
        self.subscribers.next_id += 1;
        self.subscribers.add.push((id, Box::new(handler)));
        SubscriptionId(id)
    }

    /// Subscribes to the `update` stream: fires once per updated document.
    pub fn on_update(
        &mut self,
        handler: impl FnMut(&(String, Record, Record)) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.subscribers.next_id;
        self.subscribers.next_id += 1;
        self.subscribers.update.push((id, Box::new(handler)));
        SubscriptionId(id)
    }

    /// Subscribes to the `delete` stream: fires once per removed document.
    pub fn on_delete(
        &mut self,
        handler: impl FnMut(&(String, Record)) + Send + 'static,
    ) -> SubscriptionId {
        let id = self.subscribers.next_id;
        self.subscribers.next_id += 1;
        self.subscribers.delete.push((id, Box::new(handler)));
        SubscriptionId(id)
    }

    /// Detaches a subscriber registered through `on`/`on_add`/`on_update`/
    /// `on_delete`. A no-op if `id` is already detached.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.add.retain(|(sub_id, _)| *sub_id != id.0);
        self.subscribers.update.retain(|(sub_id, _)| *sub_id != id.0);
        self.subscribers.delete.retain(|(sub_id, _)| *sub_id != id.0);
        self.subscribers.mutation.retain(|(sub_id, _)| *sub_id != id.0);
    }

    /// Registers a predicate query with no `select`/`order` (identity
    /// projection, id-order results). Scans the current live set once to
    /// populate the index, then stays current as batches commit (spec.md
    /// §4.5.1).
    pub fn query(&mut self, matches: impl FnMut(&Record) -> bool + Send + 'static) -> QueryId {
        self.query_with(matches, None, None)
    }

    /// Registers a predicate query with the full `{ where, select?, order? }`
    /// shape spec.md §4.5.1 describes: `select` projects each matching
    /// record (identity if `None`), `order` sorts the surfaced sequence
    /// (insertion/id order if `None`, "unspecified but stable").
    pub fn query_with(
        &mut self,
        matches: impl FnMut(&Record) -> bool + Send + 'static,
        select: Option<Box<dyn FnMut(&Record) -> Value + Send>>,
        order: Option<Box<dyn FnMut(&Value, &Value) -> std::cmp::Ordering + Send>>,
    ) -> QueryId {
        let mut spec = QuerySpec {
            matches: Box::new(matches),
            select,
            order,
            results: BTreeMap::new(),
            on_change: Vec::new(),
        };
        for (id, doc) in &self.resources {
            if !doc.is_live() {
                continue;
            }
            let record = record_of(doc);
            if call_predicate(&mut spec.matches, &record, id) {
                if let Some(value) = spec.select_value(id, &record) {
                    spec.results.insert(id.clone(), value);
                }
            }
        }
        let query_id = self.next_query_id;
        self.next_query_id += 1;
        self.queries.insert(query_id, spec);
        QueryId(query_id)
    }

    /// Current matching `(id, selected-value)` pairs for `query_id`, sorted
    /// by `order` if one was given, else in stable id order.
    #[must_use]
    pub fn query_results(&mut self, query_id: QueryId) -> Vec<(String, Value)> {
        self.queries
            .get_mut(&query_id.0)
            .map(QuerySpec::sorted_results)
            .unwrap_or_default()
    }

    /// Subscribes `handler` to be called after any batch that changes
    /// `query_id`'s result set.
    pub fn query_on_change(&mut self, query_id: QueryId, handler: impl FnMut() + Send + 'static) {
        if let Some(spec) = self.queries.get_mut(&query_id.0) {
            spec.on_change.push(Box::new(handler));
        }
    }

    /// Detaches a query. Double-dispose is a no-op (spec.md §4.5.1).
    pub fn query_dispose(&mut self, query_id: QueryId) {
        self.queries.remove(&query_id.0);
    }

    /// Detaches every subscriber and query. Further operations are
    /// undefined (spec.md §4.5 `dispose`).
    pub fn dispose(&mut self) {
        self.subscribers = Subscribers::default();
        self.queries.clear();
    }

    fn emit(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }

        tracing::debug!(
            added = batch.added.len(),
            updated = batch.updated.len(),
            removed = batch.removed.len(),
            "store commit"
        );

        for (id, record) in &batch.added {
            for (_, handler) in &mut self.subscribers.add {
                run_handler(handler, &(id.clone(), record.clone()));
            }
        }
        for entry in &batch.updated {
            for (_, handler) in &mut self.subscribers.update {
                run_handler(handler, entry);
            }
        }
        for (id, record) in &batch.removed {
            for (_, handler) in &mut self.subscribers.delete {
                run_handler(handler, &(id.clone(), record.clone()));
            }
        }
        for (_, handler) in &mut self.subscribers.mutation {
            run_handler(handler, &batch);
        }

        self.update_queries(&batch);
    }

    fn update_queries(&mut self, batch: &Batch) {
        for spec in self.queries.values_mut() {
            let mut dirty = false;

            for (id, record) in &batch.added {
                if call_predicate(&mut spec.matches, record, id) {
                    if let Some(value) = spec.select_value(id, record) {
                        spec.results.insert(id.clone(), value);
                        dirty = true;
                    }
                }
            }
            for (id, _, after) in &batch.updated {
                if call_predicate(&mut spec.matches, after, id) {
                    if let Some(value) = spec.select_value(id, after) {
                        spec.results.insert(id.clone(), value);
                        dirty = true;
                    } else if spec.results.remove(id).is_some() {
                        dirty = true;
                    }
                } else if spec.results.remove(id).is_some() {
                    dirty = true;
                }
            }
            for (id, _) in &batch.removed {
                if spec.results.remove(id).is_some() {
                    dirty = true;
                }
            }

            if dirty {
                for handler in &mut spec.on_change {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| handler()));
                    if result.is_err() {
                        tracing::warn!("query change handler panicked; ignoring");
                    }
                }
            }
        }
    }
}

/// A staged view over a store, opened by [`Store::begin`]. Mutating methods
/// write to `staging`, never to the store's live resources, until the
/// transaction commits.
pub struct Transaction<'a> {
    staging: BTreeMap<String, EncodedDocument>,
    clock: &'a mut HLC,
    id_generator: &'a mut dyn IdGenerator,
    batch: Batch,
    rolled_back: bool,
}

impl Transaction<'_> {
    /// Stages an add against this transaction's working set.
    ///
    /// # Errors
    ///
    /// [`StarlingError::DuplicateId`] if the id is already live in staging.
    /// Re-adding a tombstoned id merges field-by-field against the retained
    /// tombstone, matching [`Store::add`].
    pub fn add(&mut self, value: Record, with_id: Option<String>) -> Result<String> {
        let id = with_id.unwrap_or_else(|| self.id_generator.generate());
        if let Some(existing) = self.staging.get(&id) {
            if existing.is_live() {
                return Err(StarlingError::DuplicateId(id));
            }
        }
        let stamp = self.clock.now();
        let incoming = EncodedDocument::make_resource(&id, Value::Object(value), stamp);
        match self.staging.get(&id) {
            Some(existing) => {
                let merged = merge::merge_resources(existing, &incoming)?;
                self.staging.insert(id.clone(), merged);
            }
            None => {
                self.batch.added.push((id.clone(), record_of(&incoming)));
                self.staging.insert(id.clone(), incoming);
            }
        }
        Ok(id)
    }

    /// Stages an update against this transaction's working set.
    ///
    /// # Errors
    ///
    /// [`StarlingError::NotFound`] if `id` has no live document in staging.
    pub fn update(&mut self, id: &str, partial: Record) -> Result<()> {
        let current = self
            .staging
            .get(id)
            .filter(|doc| doc.is_live())
            .ok_or_else(|| StarlingError::NotFound(id.to_string()))?
            .clone();

        let stamp = self.clock.now();
        let overlay = EncodedDocument::make_resource(id, Value::Object(partial), stamp);
        let merged = merge::merge_resources(&current, &overlay)?;

        let before = record_of(&current);
        let after = record_of(&merged);
        self.staging.insert(id.to_string(), merged);
        self.batch.updated.push((id.to_string(), before, after));
        Ok(())
    }

    /// Stages a removal against this transaction's working set.
    ///
    /// # Errors
    ///
    /// [`StarlingError::NotFound`] if `id` is not present in staging at all.
    pub fn remove(&mut self, id: &str) -> Result<()> {
        let current = self
            .staging
            .get(id)
            .ok_or_else(|| StarlingError::NotFound(id.to_string()))?
            .clone();
        let was_live = current.is_live();
        let last_record = record_of(&current);

        let stamp = self.clock.now();
        let deleted = current.delete_resource(stamp);
        self.staging.insert(id.to_string(), deleted);

        if was_live {
            self.batch.removed.push((id.to_string(), last_record));
        }
        Ok(())
    }

    /// Reads staged state (read-your-writes, spec.md §4.5).
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Record> {
        self.staging.get(id).filter(|doc| doc.is_live()).map(record_of)
    }

    /// Aborts the transaction: staging is discarded, no events fire.
    pub fn rollback(&mut self) {
        self.rolled_back = true;
    }
}

/// A full snapshot of a collection: every document plus the clock state at
/// the moment of capture (spec.md §6).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Every document in the collection, live and tombstoned alike.
    pub docs: Vec<EncodedDocument>,
    /// The clock's `latest()` at capture time.
    pub eventstamp: Eventstamp,
}

/// What the core consumes from a persistence plugin (spec.md §6).
pub trait StorageAdapter {
    /// Reads one document by key.
    fn get(&self, key: &str) -> Option<EncodedDocument>;
    /// Writes one document by key.
    fn put(&mut self, key: &str, document: EncodedDocument);
    /// Deletes one key; returns whether it was present.
    fn delete(&mut self, key: &str) -> bool;
    /// All stored `(key, document)` pairs.
    fn entries(&self) -> Vec<(String, EncodedDocument)>;
    /// Drops every entry.
    fn clear(&mut self);
}

/// Lifecycle hooks a persistence or sync plugin may provide (spec.md §6).
/// The core does not ship an implementation; these are the seam external
/// collaborators hang off of.
pub trait SyncPort {
    /// Called once before the store is handed to the application.
    fn on_init(&mut self, store: &mut Store);
    /// Called synchronously right after a commit that added documents.
    fn on_add(&mut self, batch: &Batch);
    /// Called synchronously right after a commit that updated documents.
    fn on_update(&mut self, batch: &Batch);
    /// Called synchronously right after a commit that removed documents.
    fn on_delete(&mut self, batch: &Batch);
    /// Called by `Store::dispose` in reverse registration order.
    fn on_dispose(&mut self);
}

fn record_of(document: &EncodedDocument) -> Record {
    match document.decode() {
        Value::Object(map) => map,
        _ => Record::default(),
    }
}

fn call_predicate(
    predicate: &mut (dyn FnMut(&Record) -> bool + Send),
    record: &Record,
    id: &str,
) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| predicate(record))) {
        Ok(matched) => matched,
        Err(_) => {
            tracing::warn!(id, "query predicate panicked; treating as non-match");
            false
        }
    }
}

fn run_handler<T>(handler: &mut (dyn FnMut(&T) + Send), arg: &T) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| handler(arg)));
    if result.is_err() {
        tracing::warn!("event subscriber panicked; other subscribers still ran");
    }
}
