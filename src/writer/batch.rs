//! Buffered, merge-preserving record writer
//!
//! # Flush pipeline
//!
//! 1. Take the collection's buffer (the buffer lock is released immediately)
//! 2. Pre-create placeholder parent rows for referenced keys missing from the store
//! 3. Reinstate protected fields from persisted rows when the incoming record
//!    leaves them absent or null
//! 4. Upsert in capped chunks; a failing chunk is retried one record at a time
//! 5. Records that still fail land in a bounded backlog
//!
//! Every store call goes through the [`CircuitBreaker`]. While it is open,
//! unwritten records are put back at the front of the buffer instead of being
//! dropped. The same happens when a flush future is cancelled mid-way. Flushes
//! of one collection are serialized by an async gate.
//!
//! Each buffer holds at most `max_buffered` records; the oldest overflow goes
//! to the failed backlog.

use crate::config::WriterConfig;
use crate::lifecycle::BackgroundTask;
use crate::ratelimit::{OpClass, RateLimiter};
use crate::resilience::CircuitBreaker;
use crate::storage::{record_key, Record, RecordStore};
use crate::HarvestError;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A collection the writer accepts records for
#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub name: String,
    /// Columns identifying a row
    pub conflict_keys: Vec<String>,
}

impl CollectionSpec {
    pub fn new(name: &str, conflict_keys: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            conflict_keys: conflict_keys.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// A child field that references a row in a parent collection
///
/// Before children are written, a placeholder row is created for every
/// referenced parent key that does not exist yet.
#[derive(Debug, Clone)]
pub struct ParentRule {
    pub child_collection: String,
    pub child_field: String,
    pub parent_collection: String,
    /// Single conflict column of the parent collection
    pub parent_key_field: String,
}

impl ParentRule {
    pub fn new(child: &str, field: &str, parent: &str, parent_key: &str) -> Self {
        Self {
            child_collection: child.to_string(),
            child_field: field.to_string(),
            parent_collection: parent.to_string(),
            parent_key_field: parent_key.to_string(),
        }
    }
}

/// Counters for one or more flushes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records persisted, including those saved by individual retry
    pub written: usize,
    /// Placeholder parent rows created
    pub placeholders: usize,
    /// Records persisted by the per-record fallback
    pub retried_individually: usize,
    /// Records moved to the failed backlog
    pub failed: usize,
    /// Records put back into the buffer because the circuit was open
    pub deferred: usize,
}

impl FlushReport {
    pub fn merge(&mut self, other: &FlushReport) {
        self.written += other.written;
        self.placeholders += other.placeholders;
        self.retried_individually += other.retried_individually;
        self.failed += other.failed;
        self.deferred += other.deferred;
    }

    pub fn is_empty(&self) -> bool {
        *self == FlushReport::default()
    }
}

/// A record that could not be written even on its own
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub collection: String,
    pub record: Record,
    pub error: String,
}

struct CollectionState {
    spec: CollectionSpec,
    protected: Vec<String>,
    buffer: Mutex<Vec<Record>>,
    gate: tokio::sync::Mutex<()>,
}

impl CollectionState {
    fn buffer(&self) -> MutexGuard<'_, Vec<Record>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Puts unwritten records back ahead of anything added meanwhile
    fn requeue_front(&self, mut records: Vec<Record>) {
        let mut buffer = self.buffer();
        records.append(&mut buffer);
        *buffer = records;
    }
}

/// Records taken out of a buffer by one flush
///
/// Whatever is still held on drop returns to the front of the buffer.
struct PendingBatch<'a> {
    writer: &'a BatchWriter,
    state: &'a CollectionState,
    records: Vec<Record>,
}

impl Drop for PendingBatch<'_> {
    fn drop(&mut self) {
        if self.records.is_empty() {
            return;
        }
        self.state.requeue_front(std::mem::take(&mut self.records));
        self.writer.enforce_cap(self.state);
    }
}

/// Batches records per collection and persists them through the breaker
pub struct BatchWriter {
    store: Arc<dyn RecordStore>,
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    collections: HashMap<String, CollectionState>,
    parent_rules: Vec<ParentRule>,
    protected_fields: HashMap<String, Vec<String>>,
    batch_size: usize,
    chunk_size: usize,
    max_buffered: usize,
    max_failed_backlog: usize,
    failed: Mutex<VecDeque<FailedRecord>>,
    flush_requested: Notify,
}

impl BatchWriter {
    pub fn new(
        store: Arc<dyn RecordStore>,
        breaker: Arc<CircuitBreaker>,
        limiter: RateLimiter,
        config: &WriterConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            limiter,
            collections: HashMap::new(),
            parent_rules: Vec::new(),
            protected_fields: config.protected_fields.clone(),
            batch_size: config.batch_size.max(1),
            chunk_size: config.chunk_size.max(1),
            max_buffered: config.max_buffered.max(1),
            max_failed_backlog: config.max_failed_backlog,
            failed: Mutex::new(VecDeque::new()),
            flush_requested: Notify::new(),
        }
    }

    /// Registers a collection; its protected fields come from configuration
    pub fn with_collection(mut self, spec: CollectionSpec) -> Self {
        let protected = self
            .protected_fields
            .get(&spec.name)
            .cloned()
            .unwrap_or_default();
        self.collections.insert(
            spec.name.clone(),
            CollectionState {
                spec,
                protected,
                buffer: Mutex::new(Vec::new()),
                gate: tokio::sync::Mutex::new(()),
            },
        );
        self
    }

    pub fn with_parent_rule(mut self, rule: ParentRule) -> Self {
        self.parent_rules.push(rule);
        self
    }

    fn state(&self, collection: &str) -> Result<&CollectionState, HarvestError> {
        self.collections
            .get(collection)
            .ok_or_else(|| HarvestError::Payload {
                target: collection.to_string(),
                message: "collection is not registered with the writer".to_string(),
            })
    }

    /// Buffers a record, flushing the collection once it reaches the batch size
    ///
    /// # Returns
    ///
    /// * `Ok(Some(report))` - The add triggered a flush
    /// * `Ok(None)` - The record was only buffered
    pub async fn add(
        &self,
        collection: &str,
        record: Record,
    ) -> Result<Option<FlushReport>, HarvestError> {
        let state = self.state(collection)?;
        if self.push(state, record) >= self.batch_size {
            return self.flush(collection).await.map(Some);
        }
        Ok(None)
    }

    /// Buffers a record without flushing in the caller's future
    ///
    /// Reaching the batch size wakes the auto-flush task instead. Returns
    /// whether a flush was requested.
    pub fn enqueue(&self, collection: &str, record: Record) -> Result<bool, HarvestError> {
        let state = self.state(collection)?;
        if self.push(state, record) >= self.batch_size {
            self.request_flush();
            return Ok(true);
        }
        Ok(false)
    }

    /// Wakes the auto-flush task for an early pass
    pub fn request_flush(&self) {
        self.flush_requested.notify_one();
    }

    fn push(&self, state: &CollectionState, record: Record) -> usize {
        state.buffer().push(record);
        self.enforce_cap(state)
    }

    /// Moves the oldest records beyond `max_buffered` to the failed backlog;
    /// returns the buffer length left
    fn enforce_cap(&self, state: &CollectionState) -> usize {
        let (overflow, remaining) = {
            let mut buffer = state.buffer();
            let excess = buffer.len().saturating_sub(self.max_buffered);
            let overflow: Vec<Record> = buffer.drain(..excess).collect();
            (overflow, buffer.len())
        };
        if overflow.is_empty() {
            return remaining;
        }

        warn!(
            "'{}' buffer is over {} records, moved {} to the failed backlog",
            state.spec.name,
            self.max_buffered,
            overflow.len()
        );
        for record in overflow {
            self.push_failed(FailedRecord {
                collection: state.spec.name.clone(),
                record,
                error: "buffer full".to_string(),
            });
        }
        remaining
    }

    /// Flushes every registered collection
    ///
    /// Parent collections are flushed after their children so placeholder
    /// rows are replaced by real data within the same pass.
    pub async fn flush_all(&self) -> Result<FlushReport, HarvestError> {
        let mut names: Vec<&String> = self.collections.keys().collect();
        names.sort_by_key(|name| {
            let is_parent = self
                .parent_rules
                .iter()
                .any(|r| &r.parent_collection == *name);
            (is_parent, name.to_string())
        });

        let mut total = FlushReport::default();
        for name in names {
            let report = self.flush(name).await?;
            total.merge(&report);
        }
        Ok(total)
    }

    /// Flushes one collection
    pub async fn flush(&self, collection: &str) -> Result<FlushReport, HarvestError> {
        let state = self.state(collection)?;
        let _serialized = state.gate.lock().await;

        let mut pending = PendingBatch {
            writer: self,
            state,
            records: std::mem::take(&mut *state.buffer()),
        };
        let mut report = FlushReport::default();
        if pending.records.is_empty() {
            return Ok(report);
        }

        if !self.breaker.should_allow() {
            report.deferred = pending.records.len();
            warn!(
                "Circuit open, deferred {} '{}' records",
                report.deferred, collection
            );
            return Ok(report);
        }

        report.placeholders = self.ensure_parents(collection, &pending.records).await?;

        if !state.protected.is_empty() {
            if let Err(e) = self.reinstate_protected(state, &mut pending.records) {
                self.breaker.record_failure();
                report.deferred = pending.records.len();
                warn!(
                    "Could not read persisted '{}' rows, deferred flush: {}",
                    collection, e
                );
                return Ok(report);
            }
        }

        while !pending.records.is_empty() {
            if !self.breaker.should_allow() {
                report.deferred += pending.records.len();
                break;
            }

            // the chunk stays pending until the permit is held
            let _permit = self.limiter.acquire(OpClass::Write).await?;
            let rest = pending
                .records
                .split_off(self.chunk_size.min(pending.records.len()));
            let chunk = std::mem::replace(&mut pending.records, rest);

            match self
                .store
                .upsert(collection, &state.spec.conflict_keys, &chunk)
            {
                Ok(n) => {
                    self.breaker.record_success();
                    report.written += n;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    warn!(
                        "Chunk of {} '{}' records failed, retrying individually: {}",
                        chunk.len(),
                        collection,
                        e
                    );
                    let mut leftover = self.write_individually(state, chunk, &mut report);
                    if !leftover.is_empty() {
                        report.deferred += leftover.len() + pending.records.len();
                        leftover.append(&mut pending.records);
                        pending.records = leftover;
                        break;
                    }
                }
            }
        }

        debug!("Flushed '{}': {:?}", collection, report);
        Ok(report)
    }

    /// Per-record fallback; returns the records left unattempted because the circuit opened
    fn write_individually(
        &self,
        state: &CollectionState,
        chunk: Vec<Record>,
        report: &mut FlushReport,
    ) -> Vec<Record> {
        let mut records = chunk.into_iter();
        while let Some(record) = records.next() {
            if !self.breaker.should_allow() {
                let mut leftover = vec![record];
                leftover.extend(records);
                return leftover;
            }

            match self.store.upsert(
                &state.spec.name,
                &state.spec.conflict_keys,
                std::slice::from_ref(&record),
            ) {
                Ok(_) => {
                    self.breaker.record_success();
                    report.written += 1;
                    report.retried_individually += 1;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    report.failed += 1;
                    self.push_failed(FailedRecord {
                        collection: state.spec.name.clone(),
                        record,
                        error: e.to_string(),
                    });
                }
            }
        }
        Vec::new()
    }

    /// Creates placeholder rows for parents referenced by `batch`
    async fn ensure_parents(
        &self,
        collection: &str,
        batch: &[Record],
    ) -> Result<usize, HarvestError> {
        let mut created = 0;

        for rule in self
            .parent_rules
            .iter()
            .filter(|r| r.child_collection == collection)
        {
            let referenced: HashSet<String> = batch
                .iter()
                .filter_map(|r| r.get(&rule.child_field))
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if referenced.is_empty() {
                continue;
            }

            let keys: Vec<String> = referenced.into_iter().collect();
            let parent_keys = vec![rule.parent_key_field.clone()];

            let existing = match self.store.select(&rule.parent_collection, &keys) {
                Ok(rows) => rows,
                Err(e) => {
                    self.breaker.record_failure();
                    warn!(
                        "Placeholder lookup in '{}' failed, children written without parents: {}",
                        rule.parent_collection, e
                    );
                    continue;
                }
            };
            let present: HashSet<String> = existing
                .iter()
                .filter_map(|row| record_key(&rule.parent_collection, &parent_keys, row).ok())
                .collect();

            let placeholders: Vec<Record> = keys
                .iter()
                .filter(|k| !present.contains(*k))
                .map(|k| placeholder(&rule.parent_key_field, k))
                .collect();
            if placeholders.is_empty() {
                continue;
            }

            let _permit = self.limiter.acquire(OpClass::Write).await?;
            match self
                .store
                .insert(&rule.parent_collection, &parent_keys, &placeholders)
            {
                Ok(n) => {
                    self.breaker.record_success();
                    created += n;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    warn!(
                        "Failed to create {} placeholder rows in '{}': {}",
                        placeholders.len(),
                        rule.parent_collection,
                        e
                    );
                }
            }
        }

        Ok(created)
    }

    /// Copies protected fields from persisted rows into records that omit them
    fn reinstate_protected(
        &self,
        state: &CollectionState,
        batch: &mut [Record],
    ) -> Result<(), HarvestError> {
        let keyed: Vec<(usize, String)> = batch
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                state
                    .protected
                    .iter()
                    .any(|f| matches!(r.get(f), None | Some(Value::Null)))
            })
            .filter_map(|(i, r)| {
                record_key(&state.spec.name, &state.spec.conflict_keys, r)
                    .ok()
                    .map(|k| (i, k))
            })
            .collect();
        if keyed.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = keyed.iter().map(|(_, k)| k.clone()).collect();
        let persisted: HashMap<String, Record> = self
            .store
            .select(&state.spec.name, &keys)?
            .into_iter()
            .filter_map(|row| {
                record_key(&state.spec.name, &state.spec.conflict_keys, &row)
                    .ok()
                    .map(|k| (k, row))
            })
            .collect();

        for (idx, key) in keyed {
            let Some(existing) = persisted.get(&key) else {
                continue;
            };
            let record = &mut batch[idx];
            for field in &state.protected {
                let incoming_missing = matches!(record.get(field), None | Some(Value::Null));
                match existing.get(field) {
                    Some(value) if incoming_missing && !value.is_null() => {
                        record.insert(field.clone(), value.clone());
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn push_failed(&self, failed: FailedRecord) {
        let mut backlog = self.lock_failed();
        if self.max_failed_backlog == 0 {
            return;
        }
        while backlog.len() >= self.max_failed_backlog {
            backlog.pop_front();
        }
        backlog.push_back(failed);
    }

    fn lock_failed(&self) -> MutexGuard<'_, VecDeque<FailedRecord>> {
        self.failed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records currently buffered for `collection`
    pub fn buffered(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|s| s.buffer().len())
            .unwrap_or(0)
    }

    /// Records buffered across all collections
    pub fn buffered_total(&self) -> usize {
        self.collections.values().map(|s| s.buffer().len()).sum()
    }

    pub fn failed_backlog_len(&self) -> usize {
        self.lock_failed().len()
    }

    /// Copy of the failed backlog, oldest first
    pub fn failed_records(&self) -> Vec<FailedRecord> {
        self.lock_failed().iter().cloned().collect()
    }

    /// Drops the failed backlog; returns how many records were discarded
    pub fn purge_failed(&self) -> usize {
        let mut backlog = self.lock_failed();
        let n = backlog.len();
        backlog.clear();
        n
    }

    /// Moves the failed backlog back into the buffers for another attempt
    pub fn requeue_failed(&self) -> usize {
        let drained: Vec<FailedRecord> = self.lock_failed().drain(..).collect();
        let n = drained.len();
        for failed in drained {
            if let Some(state) = self.collections.get(&failed.collection) {
                state.buffer().push(failed.record);
            }
        }
        n
    }

    /// Starts the auto-flush, which runs every `interval` and on request
    pub fn spawn_auto_flush(self: &Arc<Self>, interval: Duration) -> BackgroundTask {
        let writer = Arc::clone(self);
        BackgroundTask::spawn("writer-auto-flush", move |mut shutdown| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = writer.flush_requested.notified() => debug!("Flush requested"),
                    _ = shutdown.recv() => break,
                }
                match writer.flush_all().await {
                    Ok(report) if !report.is_empty() => info!("Auto-flush: {:?}", report),
                    Ok(_) => {}
                    Err(e) => warn!("Auto-flush failed: {}", e),
                }
            }
        })
    }
}

fn placeholder(key_field: &str, key: &str) -> Record {
    let mut record = Record::new();
    record.insert(key_field.to_string(), Value::String(key.to_string()));
    record.insert("placeholder".to_string(), Value::Bool(true));
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::storage::{SqliteStore, StoreError, StoreResult};
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn limiter() -> RateLimiter {
        RateLimiter::from_config(&RateLimitConfig::default(), RateLimiter::shared_gate(4))
    }

    fn create_test_config() -> WriterConfig {
        WriterConfig {
            batch_size: 10,
            chunk_size: 3,
            max_failed_backlog: 2,
            ..WriterConfig::default()
        }
    }

    fn build_writer(store: Arc<dyn RecordStore>, breaker: Arc<CircuitBreaker>) -> BatchWriter {
        BatchWriter::new(store, breaker, limiter(), &create_test_config())
            .with_collection(CollectionSpec::new("communities", &["name"]))
            .with_collection(CollectionSpec::new("posts", &["id"]))
            .with_parent_rule(ParentRule::new("posts", "community", "communities", "name"))
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(5, Duration::from_secs(60)))
    }

    /// Store that rejects any write containing a record marked `poison`,
    /// or every write while `down` is set
    struct FlakyStore {
        inner: SqliteStore,
        down: bool,
    }

    impl FlakyStore {
        fn new(down: bool) -> Self {
            Self {
                inner: SqliteStore::new_in_memory().unwrap(),
                down,
            }
        }

        fn check(&self, records: &[Record]) -> StoreResult<()> {
            if self.down || records.iter().any(|r| r.contains_key("poison")) {
                return Err(StoreError::Database("write rejected".to_string()));
            }
            Ok(())
        }
    }

    impl RecordStore for FlakyStore {
        fn select(&self, collection: &str, keys: &[String]) -> StoreResult<Vec<Record>> {
            self.inner.select(collection, keys)
        }

        fn insert(&self, c: &str, k: &[String], records: &[Record]) -> StoreResult<usize> {
            self.check(records)?;
            self.inner.insert(c, k, records)
        }

        fn update(&self, c: &str, k: &[String], record: &Record) -> StoreResult<bool> {
            self.check(std::slice::from_ref(record))?;
            self.inner.update(c, k, record)
        }

        fn upsert(&self, c: &str, k: &[String], records: &[Record]) -> StoreResult<usize> {
            self.check(records)?;
            self.inner.upsert(c, k, records)
        }

        fn delete(&self, c: &str, keys: &[String]) -> StoreResult<usize> {
            self.inner.delete(c, keys)
        }

        fn count(&self, c: &str) -> StoreResult<u64> {
            self.inner.count(c)
        }

        fn collections(&self) -> StoreResult<Vec<(String, u64)>> {
            self.inner.collections()
        }
    }

    #[tokio::test]
    async fn test_protected_fields_survive_omission() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let writer = build_writer(store.clone(), breaker());
        let keys = vec!["name".to_string()];

        store
            .upsert(
                "communities",
                &keys,
                &[record(json!({"name": "rust", "category": "tech", "subscribers": 1}))],
            )
            .unwrap();

        // omitted and explicit null both keep the persisted value
        writer
            .add("communities", record(json!({"name": "rust", "subscribers": 2})))
            .await
            .unwrap();
        writer.flush("communities").await.unwrap();
        let row = &store.select("communities", &["rust".to_string()]).unwrap()[0];
        assert_eq!(row["category"], json!("tech"));
        assert_eq!(row["subscribers"], json!(2));

        writer
            .add("communities", record(json!({"name": "rust", "category": null})))
            .await
            .unwrap();
        writer.flush("communities").await.unwrap();
        let row = &store.select("communities", &["rust".to_string()]).unwrap()[0];
        assert_eq!(row["category"], json!("tech"));

        // an explicit value replaces it
        writer
            .add("communities", record(json!({"name": "rust", "category": "science"})))
            .await
            .unwrap();
        writer.flush("communities").await.unwrap();
        let row = &store.select("communities", &["rust".to_string()]).unwrap()[0];
        assert_eq!(row["category"], json!("science"));
    }

    #[tokio::test]
    async fn test_placeholder_parents_created_with_children() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let writer = build_writer(store.clone(), breaker());

        store
            .upsert(
                "communities",
                &["name".to_string()],
                &[record(json!({"name": "known"}))],
            )
            .unwrap();

        writer
            .add("posts", record(json!({"id": "p1", "community": "fresh"})))
            .await
            .unwrap();
        writer
            .add("posts", record(json!({"id": "p2", "community": "known"})))
            .await
            .unwrap();

        let report = writer.flush_all().await.unwrap();
        assert_eq!(report.placeholders, 1);
        assert_eq!(report.written, 2);

        let fresh = store.select("communities", &["fresh".to_string()]).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0]["placeholder"], json!(true));
        assert_eq!(store.count("posts").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_chunk_falls_back_to_single_records() {
        let store = Arc::new(FlakyStore::new(false));
        let writer = build_writer(store.clone(), breaker());

        writer.add("posts", record(json!({"id": "a"}))).await.unwrap();
        writer
            .add("posts", record(json!({"id": "b", "poison": true})))
            .await
            .unwrap();
        writer.add("posts", record(json!({"id": "c"}))).await.unwrap();
        writer.add("posts", record(json!({"id": "d"}))).await.unwrap();

        let report = writer.flush("posts").await.unwrap();

        // chunk [a, b, c] fails and is retried one by one, chunk [d] succeeds
        assert_eq!(report.written, 3);
        assert_eq!(report.retried_individually, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(writer.failed_backlog_len(), 1);
        assert_eq!(writer.failed_records()[0].record["id"], json!("b"));
        assert_eq!(store.count("posts").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_backlog_is_bounded() {
        let store = Arc::new(FlakyStore::new(false));
        let writer = build_writer(store, breaker());

        for id in ["x", "y", "z"] {
            writer
                .add("posts", record(json!({"id": id, "poison": true})))
                .await
                .unwrap();
        }
        writer.flush("posts").await.unwrap();

        let backlog: Vec<Value> = writer
            .failed_records()
            .into_iter()
            .map(|f| f.record["id"].clone())
            .collect();
        assert_eq!(backlog, vec![json!("y"), json!("z")]);
        assert_eq!(writer.purge_failed(), 2);
        assert_eq!(writer.failed_backlog_len(), 0);
    }

    #[tokio::test]
    async fn test_open_circuit_defers_instead_of_dropping() {
        let store = Arc::new(FlakyStore::new(true));
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        let writer = build_writer(store.clone(), breaker.clone());

        for id in ["a", "b", "c", "d"] {
            writer.add("posts", record(json!({"id": id}))).await.unwrap();
        }

        let report = writer.flush("posts").await.unwrap();
        assert!(!breaker.should_allow());
        assert_eq!(report.written, 0);
        assert_eq!(report.deferred, 4);
        assert_eq!(writer.buffered("posts"), 4);

        // while open nothing reaches the store and nothing is lost
        let report = writer.flush("posts").await.unwrap();
        assert_eq!(report.deferred, 4);
        assert_eq!(writer.buffered("posts"), 4);
        assert_eq!(writer.failed_backlog_len(), 0);
    }

    #[tokio::test]
    async fn test_size_triggered_flush() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let config = WriterConfig {
            batch_size: 2,
            ..WriterConfig::default()
        };
        let writer = BatchWriter::new(store.clone(), breaker(), limiter(), &config)
            .with_collection(CollectionSpec::new("users", &["username"]));

        let first = writer
            .add("users", record(json!({"username": "alice"})))
            .await
            .unwrap();
        assert!(first.is_none());

        let second = writer
            .add("users", record(json!({"username": "bob"})))
            .await
            .unwrap();
        assert_eq!(second.map(|r| r.written), Some(2));
        assert_eq!(writer.buffered_total(), 0);
        assert_eq!(store.count("users").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unknown_collection_is_rejected() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let writer = build_writer(store, breaker());
        let result = writer.add("comments", record(json!({"id": "1"}))).await;
        assert!(matches!(result, Err(HarvestError::Payload { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_cancelled_while_waiting_for_permit_keeps_records() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let limits = RateLimitConfig {
            write_cap: 1,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::from_config(&limits, RateLimiter::shared_gate(4));
        let writer = BatchWriter::new(store.clone(), breaker(), limiter, &create_test_config())
            .with_collection(CollectionSpec::new("users", &["username"]));

        writer
            .add("users", record(json!({"username": "a"})))
            .await
            .unwrap();
        writer.flush("users").await.unwrap();
        assert_eq!(store.count("users").unwrap(), 1);

        for name in ["b", "c", "d"] {
            writer
                .add("users", record(json!({"username": name})))
                .await
                .unwrap();
        }

        // the write window is spent, so the flush is dropped while waiting
        let cancelled =
            tokio::time::timeout(Duration::from_secs(1), writer.flush("users")).await;
        assert!(cancelled.is_err());
        assert_eq!(writer.buffered("users"), 3);
        assert_eq!(store.count("users").unwrap(), 1);

        let report = writer.flush_all().await.unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(writer.buffered("users"), 0);
        assert_eq!(store.count("users").unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_wakes_auto_flush() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let config = WriterConfig {
            batch_size: 2,
            ..create_test_config()
        };
        let writer = Arc::new(
            BatchWriter::new(store.clone(), breaker(), limiter(), &config)
                .with_collection(CollectionSpec::new("users", &["username"])),
        );
        let task = writer.spawn_auto_flush(Duration::from_secs(3600));

        assert!(!writer
            .enqueue("users", record(json!({"username": "alice"})))
            .unwrap());
        assert!(writer
            .enqueue("users", record(json!({"username": "bob"})))
            .unwrap());
        assert_eq!(store.count("users").unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.count("users").unwrap(), 2);
        assert_eq!(writer.buffered_total(), 0);

        task.stop().await;
    }

    #[tokio::test]
    async fn test_buffer_overflow_moves_oldest_to_backlog() {
        let store = Arc::new(FlakyStore::new(true));
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        let config = WriterConfig {
            max_buffered: 3,
            max_failed_backlog: 10,
            ..create_test_config()
        };
        let writer = BatchWriter::new(store, breaker.clone(), limiter(), &config)
            .with_collection(CollectionSpec::new("posts", &["id"]));

        for id in ["a", "b", "c", "d", "e"] {
            writer.enqueue("posts", record(json!({"id": id}))).unwrap();
        }
        assert_eq!(writer.buffered("posts"), 3);
        let overflow: Vec<Value> = writer
            .failed_records()
            .into_iter()
            .map(|f| f.record["id"].clone())
            .collect();
        assert_eq!(overflow, vec![json!("a"), json!("b")]);
        assert_eq!(writer.failed_records()[0].error, "buffer full");

        // a deferred flush puts its records back without exceeding the cap
        let report = writer.flush("posts").await.unwrap();
        assert!(!breaker.should_allow());
        assert_eq!(report.deferred, 3);
        writer.enqueue("posts", record(json!({"id": "f"}))).unwrap();
        assert_eq!(writer.buffered("posts"), 3);
        assert_eq!(writer.failed_backlog_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_flush_runs_on_interval() {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let writer = Arc::new(build_writer(store.clone(), breaker()));

        writer
            .add("communities", record(json!({"name": "rust"})))
            .await
            .unwrap();
        let task = writer.spawn_auto_flush(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.count("communities").unwrap(), 1);

        task.stop().await;
    }
}
