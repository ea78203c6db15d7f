// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory collaborators.
//!
//! Implementations of [`SourceRegion`], [`TargetStore`],
//! [`ChangeStreamClient`] and [`AgentGroup`] that keep everything in process
//! memory. They back standalone runs and every test in the crate, and each
//! one can be told to misbehave:
//!
//! | Type | Fault knobs |
//! |------|-------------|
//! | [`MemoryRegion`] | unreachable for N calls, store timeouts, fatal scans, scan delay, drop/recreate |
//! | [`MemoryTarget`] | failing puts, incompatible schemas |
//! | [`MemoryStreamClient`] | unreachable, rejected subscribe, lost position, slow/hung/rejected changes |
//! | [`StaticGroup`] | tables not yet streaming on every agent, unreachable for N checks |

use crate::region::{AgentGroup, BoxFuture, RegionError, SourceRegion, TargetStore};
use crate::stream::{
    ChangeHandle, ChangeStreamClient, StreamConfig, StreamError, StreamFuture, StreamMode,
    Subscription,
};
use crate::types::{Row, ShardId, StreamPosition, TableInfo};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrement a fault counter, returning true if the fault fires.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Source region
// =============================================================================

#[derive(Debug)]
struct MemTable {
    info: TableInfo,
    rows: BTreeMap<Vec<u8>, Row>,
}

/// Source region with ordered rows per table.
#[derive(Debug, Default)]
pub struct MemoryRegion {
    tables: Mutex<BTreeMap<String, MemTable>>,
    unavailable: AtomicUsize,
    scan_timeouts: AtomicUsize,
    fatal_scan: Mutex<Option<String>>,
    scan_delay: Mutex<Duration>,
    scan_calls: AtomicU64,
    scans_in_flight: Mutex<HashMap<String, usize>>,
    max_scans_in_flight: Mutex<HashMap<String, usize>>,
}

impl MemoryRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a table.
    pub fn create_table(&self, name: &str, id: u64, schema_version: u32) -> TableInfo {
        let info = TableInfo::new(name, id, schema_version);
        lock(&self.tables).insert(
            name.to_string(),
            MemTable {
                info: info.clone(),
                rows: BTreeMap::new(),
            },
        );
        info
    }

    pub fn drop_table(&self, name: &str) {
        lock(&self.tables).remove(name);
    }

    /// Drop and recreate `name` with a new id, keeping no rows.
    pub fn recreate_table(&self, name: &str, new_id: u64) -> TableInfo {
        let version = lock(&self.tables)
            .get(name)
            .map(|t| t.info.schema_version)
            .unwrap_or(1);
        self.create_table(name, new_id, version)
    }

    pub fn insert(&self, table: &str, row: Row) {
        if let Some(t) = lock(&self.tables).get_mut(table) {
            t.rows.insert(row.key.clone(), row);
        }
    }

    /// Insert `count` rows keyed `k000000`, `k000001`, ...
    pub fn insert_rows(&self, table: &str, count: usize) {
        let mut tables = lock(&self.tables);
        if let Some(t) = tables.get_mut(table) {
            for i in 0..count {
                let key = format!("k{:06}", i).into_bytes();
                let row = Row {
                    key: key.clone(),
                    value: format!("v{}", i).into_bytes(),
                    tombstone: false,
                    modified_at: i as i64,
                };
                t.rows.insert(key, row);
            }
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.tables).get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.tables)
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fail the next `n` calls with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.unavailable.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` scans with a store timeout.
    pub fn timeout_next_scans(&self, n: usize) {
        self.scan_timeouts.store(n, Ordering::SeqCst);
    }

    /// Fail every scan with a permanent error until cleared.
    pub fn set_fatal_scan(&self, message: Option<&str>) {
        *lock(&self.fatal_scan) = message.map(str::to_string);
    }

    pub fn set_scan_delay(&self, delay: Duration) {
        *lock(&self.scan_delay) = delay;
    }

    pub fn scan_calls(&self) -> u64 {
        self.scan_calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping scans seen for `table`.
    pub fn max_concurrent_scans(&self, table: &str) -> usize {
        lock(&self.max_scans_in_flight).get(table).copied().unwrap_or(0)
    }

    fn enter_scan(&self, table: &str) {
        let mut in_flight = lock(&self.scans_in_flight);
        let n = in_flight.entry(table.to_string()).or_insert(0);
        *n += 1;
        let mut max = lock(&self.max_scans_in_flight);
        let m = max.entry(table.to_string()).or_insert(0);
        *m = (*m).max(*n);
    }

    fn exit_scan(&self, table: &str) {
        if let Some(n) = lock(&self.scans_in_flight).get_mut(table) {
            *n = n.saturating_sub(1);
        }
    }

    fn scan_now(
        &self,
        table: &TableInfo,
        after: Option<&[u8]>,
        limit: usize,
        include_tombstones: bool,
    ) -> Result<Vec<Row>, RegionError> {
        if take_fault(&self.scan_timeouts) {
            return Err(RegionError::Timeout(format!("scan of {}", table.name)));
        }
        if let Some(msg) = lock(&self.fatal_scan).clone() {
            return Err(RegionError::Fatal(msg));
        }
        let tables = lock(&self.tables);
        let t = match tables.get(&table.name) {
            Some(t) if t.info.id == table.id => t,
            _ => return Err(RegionError::TableNotFound(table.name.clone())),
        };
        let iter: Box<dyn Iterator<Item = &Row>> = match after {
            Some(k) => Box::new(
                t.rows
                    .range::<[u8], _>((std::ops::Bound::Excluded(k), std::ops::Bound::Unbounded))
                    .map(|(_, r)| r),
            ),
            None => Box::new(t.rows.values()),
        };
        Ok(iter
            .filter(|r| include_tombstones || !r.tombstone)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Tracks overlapping scans; released on drop so aborted scans are counted out.
struct ScanGuard<'a> {
    region: &'a MemoryRegion,
    table: String,
}

impl<'a> ScanGuard<'a> {
    fn enter(region: &'a MemoryRegion, table: &str) -> Self {
        region.enter_scan(table);
        Self {
            region,
            table: table.to_string(),
        }
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.region.exit_scan(&self.table);
    }
}

impl SourceRegion for MemoryRegion {
    fn table_info(&self, name: &str) -> BoxFuture<'_, Option<TableInfo>> {
        let name = name.to_string();
        Box::pin(async move {
            if take_fault(&self.unavailable) {
                return Err(RegionError::Unavailable("injected".into()));
            }
            Ok(lock(&self.tables).get(&name).map(|t| t.info.clone()))
        })
    }

    fn scan(
        &self,
        table: &TableInfo,
        after: Option<Vec<u8>>,
        limit: usize,
        include_tombstones: bool,
    ) -> BoxFuture<'_, Vec<Row>> {
        let table = table.clone();
        Box::pin(async move {
            self.scan_calls.fetch_add(1, Ordering::SeqCst);
            if take_fault(&self.unavailable) {
                return Err(RegionError::Unavailable("injected".into()));
            }
            let _guard = ScanGuard::enter(self, &table.name);
            let delay = *lock(&self.scan_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.scan_now(&table, after.as_deref(), limit, include_tombstones)
        })
    }
}

// =============================================================================
// Target store
// =============================================================================

/// Local region receiving copied rows.
#[derive(Debug, Default)]
pub struct MemoryTarget {
    tables: Mutex<HashMap<String, BTreeMap<Vec<u8>, Row>>>,
    definitions: Mutex<HashMap<String, TableInfo>>,
    incompatible: Mutex<HashSet<String>>,
    failing_puts: AtomicUsize,
    fail_at_put: Mutex<Option<u64>>,
    puts: AtomicU64,
    /// Schema version each successful put was written with, per table.
    put_versions: Mutex<HashMap<String, Vec<u32>>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_table(&self, info: TableInfo) {
        lock(&self.definitions).insert(info.name.clone(), info);
    }

    /// Mark a source table as not replicable into the local schema.
    pub fn set_compatible(&self, name: &str, compatible: bool) {
        let mut set = lock(&self.incompatible);
        if compatible {
            set.remove(name);
        } else {
            set.insert(name.to_string());
        }
    }

    /// Fail the next `n` puts with `Unavailable`.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Fail the one put attempted after `puts` successful puts.
    pub fn fail_after_puts(&self, puts: u64) {
        *lock(&self.fail_at_put) = Some(puts);
    }

    pub fn put_versions(&self, table: &str) -> Vec<u32> {
        lock(&self.put_versions).get(table).cloned().unwrap_or_default()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        lock(&self.tables)
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.tables).get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Total successful puts across all tables, counting overwrites.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn clear(&self, table: &str) {
        lock(&self.tables).remove(table);
    }
}

impl TargetStore for MemoryTarget {
    fn put(&self, table: &TableInfo, row: Row) -> BoxFuture<'_, ()> {
        let name = table.name.clone();
        let version = table.schema_version;
        Box::pin(async move {
            if take_fault(&self.failing_puts) {
                return Err(RegionError::Unavailable("injected put failure".into()));
            }
            {
                let mut fail_at = lock(&self.fail_at_put);
                if *fail_at == Some(self.puts.load(Ordering::SeqCst)) {
                    *fail_at = None;
                    return Err(RegionError::Unavailable("injected put failure".into()));
                }
            }
            lock(&self.put_versions)
                .entry(name.clone())
                .or_default()
                .push(version);
            lock(&self.tables)
                .entry(name)
                .or_default()
                .insert(row.key.clone(), row);
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn table_info(&self, name: &str) -> BoxFuture<'_, Option<TableInfo>> {
        let found = lock(&self.definitions).get(name).cloned();
        Box::pin(async move { Ok(found) })
    }

    fn is_compatible(&self, source: &TableInfo) -> BoxFuture<'_, bool> {
        let ok = !lock(&self.incompatible).contains(&source.name);
        Box::pin(async move { Ok(ok) })
    }
}

// =============================================================================
// Change stream
// =============================================================================

#[derive(Debug, Default)]
struct StreamKnobs {
    change_delay: Duration,
    hang_changes: bool,
    reject_changes: bool,
}

/// Change stream client for a fixed set of shards.
#[derive(Debug)]
pub struct MemoryStreamClient {
    shards: Vec<ShardId>,
    head: Mutex<StreamPosition>,
    knobs: Arc<Mutex<StreamKnobs>>,
    unreachable: AtomicUsize,
    reject_subscribe: AtomicUsize,
    position_unavailable: AtomicUsize,
    subscriptions: Mutex<Vec<Arc<MemorySubscription>>>,
    configs: Mutex<Vec<StreamConfig>>,
}

impl MemoryStreamClient {
    pub fn new(shard_count: u32) -> Self {
        let shards: Vec<ShardId> = (0..shard_count.max(1)).collect();
        let head = StreamPosition::from_shards(shards.iter().map(|s| (*s, "0".to_string())));
        Self {
            shards,
            head: Mutex::new(head),
            knobs: Arc::new(Mutex::new(StreamKnobs::default())),
            unreachable: AtomicUsize::new(0),
            reject_subscribe: AtomicUsize::new(0),
            position_unavailable: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        }
    }

    /// Move the stream head of one shard.
    pub fn advance(&self, shard: ShardId, token: &str) {
        lock(&self.head).set(shard, token);
        if let Some(sub) = self.current() {
            lock(&sub.position).set(shard, token);
        }
    }

    pub fn set_change_delay(&self, delay: Duration) {
        lock(&self.knobs).change_delay = delay;
    }

    /// Membership changes never complete while set.
    pub fn set_hang_changes(&self, hang: bool) {
        lock(&self.knobs).hang_changes = hang;
    }

    /// Membership changes complete with `Rejected` while set.
    pub fn set_reject_changes(&self, reject: bool) {
        lock(&self.knobs).reject_changes = reject;
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        self.unreachable.store(n, Ordering::SeqCst);
    }

    pub fn reject_next_subscribes(&self, n: usize) {
        self.reject_subscribe.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` resume-mode subscribes with `PositionUnavailable`.
    pub fn lose_position_next(&self, n: usize) {
        self.position_unavailable.store(n, Ordering::SeqCst);
    }

    /// Latest subscription, canceled or not.
    pub fn current(&self) -> Option<Arc<MemorySubscription>> {
        lock(&self.subscriptions).last().cloned()
    }

    pub fn subscribe_count(&self) -> usize {
        lock(&self.subscriptions).len()
    }

    /// Every config passed to `subscribe`, including failed attempts.
    pub fn configs(&self) -> Vec<StreamConfig> {
        lock(&self.configs).clone()
    }
}

impl ChangeStreamClient for MemoryStreamClient {
    fn subscribe(&self, config: StreamConfig) -> StreamFuture<'_, Arc<dyn Subscription>> {
        Box::pin(async move {
            lock(&self.configs).push(config.clone());

            if take_fault(&self.unreachable) {
                return Err(StreamError::Unreachable("injected".into()));
            }
            if take_fault(&self.reject_subscribe) {
                return Err(StreamError::Rejected("injected".into()));
            }
            if config.mode == StreamMode::ResumeFromCheckpoint && take_fault(&self.position_unavailable) {
                return Err(StreamError::PositionUnavailable("injected".into()));
            }
            if config.shards.is_empty() {
                return Err(StreamError::Config("no shards assigned".into()));
            }

            let head = lock(&self.head).clone();
            let mut position = StreamPosition::new();
            for shard in &config.shards {
                let token = match (&config.mode, &config.start) {
                    (StreamMode::ResumeFromCheckpoint, Some(start)) => {
                        start.get(*shard).unwrap_or("0").to_string()
                    }
                    (StreamMode::ResumeFromCheckpoint, None) => "0".to_string(),
                    (StreamMode::FromNow, _) => head.get(*shard).unwrap_or("0").to_string(),
                };
                position.set(*shard, token);
            }

            let sub = Arc::new(MemorySubscription {
                mode: config.mode,
                tables: Arc::new(Mutex::new(
                    config.tables.iter().map(|t| (t.name.clone(), t.clone())).collect(),
                )),
                canceled: AtomicBool::new(false),
                position: Arc::new(Mutex::new(position)),
                checkpoints: Mutex::new(Vec::new()),
                knobs: self.knobs.clone(),
                hung: Mutex::new(Vec::new()),
                changes_in_flight: Arc::new(AtomicUsize::new(0)),
                max_changes_in_flight: Arc::new(AtomicUsize::new(0)),
                change_calls: AtomicUsize::new(0),
            });
            lock(&self.subscriptions).push(sub.clone());
            Ok(sub as Arc<dyn Subscription>)
        })
    }

    fn source_shards(&self) -> StreamFuture<'_, Vec<ShardId>> {
        let shards = self.shards.clone();
        Box::pin(async move { Ok(shards) })
    }
}

type ChangeSender = oneshot::Sender<Result<StreamPosition, StreamError>>;

/// Subscription handed out by [`MemoryStreamClient`].
#[derive(Debug)]
pub struct MemorySubscription {
    mode: StreamMode,
    tables: Arc<Mutex<BTreeMap<String, TableInfo>>>,
    canceled: AtomicBool,
    position: Arc<Mutex<StreamPosition>>,
    checkpoints: Mutex<Vec<StreamPosition>>,
    knobs: Arc<Mutex<StreamKnobs>>,
    hung: Mutex<Vec<ChangeSender>>,
    changes_in_flight: Arc<AtomicUsize>,
    max_changes_in_flight: Arc<AtomicUsize>,
    change_calls: AtomicUsize,
}

enum Membership {
    Add(TableInfo),
    Remove(String),
}

impl MemorySubscription {
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn table_names(&self) -> Vec<String> {
        lock(&self.tables).keys().cloned().collect()
    }

    /// Positions acknowledged through `checkpoint`.
    pub fn checkpoints(&self) -> Vec<StreamPosition> {
        lock(&self.checkpoints).clone()
    }

    /// Highest number of overlapping membership changes.
    pub fn max_changes_in_flight(&self) -> usize {
        self.max_changes_in_flight.load(Ordering::SeqCst)
    }

    /// Number of add/remove calls that started a change.
    pub fn change_calls(&self) -> usize {
        self.change_calls.load(Ordering::SeqCst)
    }

    /// Complete every hung change successfully.
    pub fn release_hung(&self) {
        let senders: Vec<_> = lock(&self.hung).drain(..).collect();
        let position = lock(&self.position).clone();
        for tx in senders {
            self.changes_in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(Ok(position.clone()));
        }
    }

    fn start_change(&self, name: &str, change: Membership) -> Result<ChangeHandle, StreamError> {
        if self.is_canceled() {
            return Err(StreamError::Canceled);
        }
        self.change_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.changes_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_changes_in_flight.fetch_max(now, Ordering::SeqCst);

        let (handle, tx) = ChangeHandle::channel(name);
        let (delay, hang, reject) = {
            let k = lock(&self.knobs);
            (k.change_delay, k.hang_changes, k.reject_changes)
        };

        if hang {
            lock(&self.hung).push(tx);
            return Ok(handle);
        }

        let tables = self.tables.clone();
        let position = self.position.clone();
        let in_flight = self.changes_in_flight.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = if reject {
                Err(StreamError::Rejected("injected change failure".into()))
            } else {
                let mut tables = lock(&tables);
                match change {
                    Membership::Add(info) => {
                        tables.insert(info.name.clone(), info);
                    }
                    Membership::Remove(name) => {
                        tables.remove(&name);
                    }
                }
                Ok(lock(&position).clone())
            };
            in_flight.fetch_sub(1, Ordering::SeqCst);
            let _ = tx.send(result);
        });
        Ok(handle)
    }
}

impl Subscription for MemorySubscription {
    fn add_table(&self, table: &TableInfo) -> Result<ChangeHandle, StreamError> {
        if self.contains(table) && !self.is_canceled() {
            return Ok(ChangeHandle::completed(
                table.name.clone(),
                self.current_position(),
            ));
        }
        self.start_change(&table.name, Membership::Add(table.clone()))
    }

    fn remove_table(&self, table: &TableInfo) -> Result<ChangeHandle, StreamError> {
        self.start_change(&table.name, Membership::Remove(table.name.clone()))
    }

    fn contains(&self, table: &TableInfo) -> bool {
        lock(&self.tables)
            .get(&table.name)
            .map(|t| t.id == table.id)
            .unwrap_or(false)
    }

    fn tables(&self) -> Vec<TableInfo> {
        lock(&self.tables).values().cloned().collect()
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn current_position(&self) -> StreamPosition {
        lock(&self.position).clone()
    }

    fn checkpoint(&self, position: &StreamPosition) -> StreamFuture<'_, ()> {
        let position = position.clone();
        Box::pin(async move {
            if self.is_canceled() {
                return Err(StreamError::Canceled);
            }
            lock(&self.checkpoints).push(position);
            Ok(())
        })
    }
}

// =============================================================================
// Agent group
// =============================================================================

/// Group view where tables can be held back as "not yet streaming on
/// every agent".
#[derive(Debug, Default)]
pub struct StaticGroup {
    not_ready: Mutex<HashSet<String>>,
    unavailable: AtomicUsize,
}

impl StaticGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, table: &str, ready: bool) {
        let mut set = lock(&self.not_ready);
        if ready {
            set.remove(table);
        } else {
            set.insert(table.to_string());
        }
    }

    /// Fail the next `n` readiness checks with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.unavailable.store(n, Ordering::SeqCst);
    }
}

impl AgentGroup for StaticGroup {
    fn is_streaming_everywhere(&self, table: &TableInfo) -> BoxFuture<'_, bool> {
        if take_fault(&self.unavailable) {
            return Box::pin(async {
                Err(RegionError::Unavailable("agent group unreachable".into()))
            });
        }
        let ready = !lock(&self.not_ready).contains(&table.name);
        Box::pin(async move { Ok(ready) })
    }
}
