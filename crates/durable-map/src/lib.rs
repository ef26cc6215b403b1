//! Durable keyed store: the in-memory bucket map wrapped with a
//! write-ahead log, a background flush worker, checkpoints, and crash
//! recovery.
//!
//! The in-memory map is authoritative for reads that hit; the storage
//! backend is authoritative for reads that miss and for reconstruction
//! after a crash. Every mutating call appends a log record before it
//! returns; the durability mode decides whether the record is flushed
//! inline or handed to the worker together with owned key/value copies.
//!
//! Lock order: `persistence` → `checkpoint` → `wal`. The async queue
//! mutex is leaf-level and is never held across another acquisition.

#![deny(unsafe_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use blob_store::{frame, Backend, DirBackend};
use hivemap::{BucketMap, MapMetrics};
use hivemap_core::config::{DurabilityMode, MapConfig, PersistConfig};
use hivemap_core::error::StoreError;
use hivemap_core::ids::{now_ns, IdSource};
use hivemap_core::key::{KeyDigester, Sha256Digester};
use hivemap_core::value::ValueKind;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use wal::{LogSink, OpKind, WalReader, WalRecord, WalWriter};

/// Persistence counters. All fields are per-instance atomics; a
/// [`StatsSnapshot`] view is taken under no lock.
#[derive(Debug, Default)]
struct PersistenceStats {
    total_ops: AtomicU64,
    successful_ops: AtomicU64,
    failed_ops: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    wal_records: AtomicU64,
    sync_count: AtomicU64,
    checkpoint_count: AtomicU64,
    recovered_entries: AtomicU64,
    replayed_records: AtomicU64,
    wal_corruptions: AtomicU64,
}

impl PersistenceStats {
    fn op_ok(&self, bytes_written: u64) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        self.successful_ops.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes_written, Ordering::Relaxed);
    }

    fn op_failed(&self) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        self.failed_ops.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the persistence counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSnapshot {
    /// Persistence operations attempted (sync applies plus worker applies).
    pub total_ops: u64,
    /// Operations that reached the backend successfully.
    pub successful_ops: u64,
    /// Operations that failed against the backend.
    pub failed_ops: u64,
    /// Key plus payload bytes written across the persistence boundary.
    pub bytes_written: u64,
    /// Key plus payload bytes read back across the persistence boundary.
    pub bytes_read: u64,
    /// Log records appended over the instance lifetime.
    pub wal_records: u64,
    /// Completed storage syncs.
    pub sync_count: u64,
    /// Completed checkpoints.
    pub checkpoint_count: u64,
    /// Entries loaded from the backend during recovery.
    pub recovered_entries: u64,
    /// Log records applied during recovery replay.
    pub replayed_records: u64,
    /// Torn tails observed during recovery.
    pub wal_corruptions: u64,
    /// Async ops currently queued.
    pub queue_depth: u64,
    /// Timestamp of the last completed sync, nanoseconds.
    pub last_sync_ns: u64,
    /// Timestamp of the last completed checkpoint, nanoseconds.
    pub last_checkpoint_ns: u64,
}

/// Queued mutation carrying owned copies of the bytes to persist. The
/// worker never dereferences live map entries.
struct AsyncOp {
    op: OpKind,
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    value_tag: u8,
    enqueued_at_ns: u64,
}

impl AsyncOp {
    fn boundary_bytes(&self) -> u64 {
        let k = self.key.as_ref().map_or(0, Vec::len) as u64;
        let v = self.value.as_ref().map_or(0, Vec::len) as u64;
        k + v
    }
}

struct BackendSink {
    backend: Arc<dyn Backend>,
}

impl LogSink for BackendSink {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.backend.append_log(bytes).map_err(io::Error::other)
    }
}

/// State shared between API threads and the worker.
struct PersistCore {
    cfg: PersistConfig,
    backend: Arc<dyn Backend>,
    digester: Arc<dyn KeyDigester>,
    persistence: RwLock<()>,
    checkpoint: Mutex<()>,
    wal: Mutex<WalWriter>,
    queue: Mutex<VecDeque<AsyncOp>>,
    queue_cond: Condvar,
    txn_ids: IdSource,
    last_sync_ns: AtomicU64,
    last_checkpoint_ns: AtomicU64,
    shutting_down: AtomicBool,
    wal_size_warned: AtomicBool,
    stats: PersistenceStats,
}

impl PersistCore {
    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.lock_timeout_ms.max(1))
    }

    fn entry_name(&self, key: &[u8]) -> String {
        self.digester.digest(key).to_hex()
    }

    /// Append one record to the log buffer under the wal mutex.
    fn append_record(
        &self,
        op: OpKind,
        value_tag: u8,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        let txn_id = self.txn_ids.next();
        let mut wal = self
            .wal
            .try_lock_for(self.lock_timeout())
            .ok_or(StoreError::LockTimeout(self.cfg.lock_timeout_ms))?;
        wal.append(txn_id, now_ns(), op, value_tag, key, value).map_err(StoreError::backend)?;
        self.stats.wal_records.fetch_add(1, Ordering::Relaxed);
        let cap = self.cfg.max_wal_size_mb.saturating_mul(1024 * 1024);
        if cap > 0 && wal.appended_bytes() > cap && !self.wal_size_warned.swap(true, Ordering::Relaxed)
        {
            warn!(appended = wal.appended_bytes(), cap, "log exceeded advisory size cap");
        }
        Ok(())
    }

    /// Flush buffered records and perform the backend side of one op.
    /// Shared by the sync path and the worker.
    fn apply_op(&self, op: &AsyncOp) -> Result<(), StoreError> {
        {
            let mut wal = self
                .wal
                .try_lock_for(self.lock_timeout())
                .ok_or(StoreError::LockTimeout(self.cfg.lock_timeout_ms))?;
            wal.flush().map_err(StoreError::backend)?;
        }
        match op.op {
            OpKind::Put => {
                let key = op.key.as_deref().unwrap_or_default();
                let value = op.value.as_deref().unwrap_or_default();
                let blob = frame::encode_entry(key, op.value_tag, value);
                self.backend
                    .write_entry(&self.entry_name(key), &blob)
                    .map_err(StoreError::backend)?;
            }
            OpKind::Remove => {
                let key = op.key.as_deref().unwrap_or_default();
                self.backend.remove_entry(&self.entry_name(key)).map_err(StoreError::backend)?;
            }
            OpKind::Clear => {
                self.backend.remove_all_entries().map_err(StoreError::backend)?;
            }
            OpKind::Checkpoint => {}
        }
        Ok(())
    }

    fn persist_now(&self, op: AsyncOp) -> Result<(), StoreError> {
        let bytes = op.boundary_bytes();
        match self.apply_op(&op) {
            Ok(()) => {
                self.stats.op_ok(bytes);
                Ok(())
            }
            Err(e) => {
                self.stats.op_failed();
                Err(e)
            }
        }
    }

    fn enqueue(&self, op: AsyncOp) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.cfg.max_concurrent_ops {
            warn!(depth = queue.len(), "async queue above soft ceiling");
        }
        queue.push_back(op);
        self.queue_cond.notify_one();
    }

    /// Pop and apply queued ops until the queue is empty. Backend
    /// failures are counted and logged; draining continues.
    fn drain_queue(&self) {
        loop {
            let op = self.queue.lock().pop_front();
            let Some(op) = op else { return };
            let bytes = op.boundary_bytes();
            match self.apply_op(&op) {
                Ok(()) => {
                    self.stats.op_ok(bytes);
                    debug!(
                        queued_ns = now_ns().saturating_sub(op.enqueued_at_ns),
                        "queued op applied"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "queued op failed");
                    self.stats.op_failed();
                }
            }
        }
    }

    /// Drain, flush, and stamp the sync time. Callers hold the
    /// persistence lock in write mode.
    fn sync_locked(&self) -> Result<(), StoreError> {
        self.drain_queue();
        {
            let mut wal = self
                .wal
                .try_lock_for(self.lock_timeout())
                .ok_or(StoreError::LockTimeout(self.cfg.lock_timeout_ms))?;
            wal.flush().map_err(StoreError::backend)?;
        }
        self.last_sync_ns.store(now_ns(), Ordering::Relaxed);
        self.stats.sync_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sync, then append and flush a checkpoint marker. Callers hold the
    /// persistence lock in write mode.
    fn checkpoint_locked(&self) -> Result<(), StoreError> {
        let _cp = self
            .checkpoint
            .try_lock_for(self.lock_timeout())
            .ok_or(StoreError::LockTimeout(self.cfg.lock_timeout_ms))?;
        self.sync_locked()?;
        self.append_record(OpKind::Checkpoint, 0, &[], &[])?;
        {
            let mut wal = self
                .wal
                .try_lock_for(self.lock_timeout())
                .ok_or(StoreError::LockTimeout(self.cfg.lock_timeout_ms))?;
            wal.flush().map_err(StoreError::backend)?;
        }
        self.last_checkpoint_ns.store(now_ns(), Ordering::Relaxed);
        self.stats.checkpoint_count.fetch_add(1, Ordering::Relaxed);
        debug!("checkpoint complete");
        Ok(())
    }
}

/// Background worker: waits on the queue with a bounded timeout so it
/// can re-check liveness and the checkpoint deadline, then drains.
fn worker_loop(core: &Arc<PersistCore>) {
    info!("persistence worker started");
    loop {
        {
            let mut queue = core.queue.lock();
            while queue.is_empty() && !core.shutting_down.load(Ordering::Relaxed) {
                let wait = Duration::from_millis(core.cfg.sync_interval_ms.max(1));
                if core.queue_cond.wait_for(&mut queue, wait).timed_out() {
                    break;
                }
            }
            if core.shutting_down.load(Ordering::Relaxed) && queue.is_empty() {
                break;
            }
        }
        {
            let _read = core.persistence.read();
            core.drain_queue();
        }
        let age_ms =
            now_ns().saturating_sub(core.last_checkpoint_ns.load(Ordering::Relaxed)) / 1_000_000;
        if age_ms > core.cfg.checkpoint_interval_ms {
            let _write = core.persistence.write();
            if let Err(e) = core.checkpoint_locked() {
                warn!(error = %e, "periodic checkpoint failed");
            }
        }
    }
    info!("persistence worker stopped");
}

/// Keyed store with configurable durability. All methods take `&self`;
/// the instance is shared across threads behind an `Arc`.
pub struct DurableMap {
    map: Mutex<BucketMap>,
    core: Option<Arc<PersistCore>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    mode: DurabilityMode,
    lock_timeout_ms: u64,
    shut: AtomicBool,
}

impl DurableMap {
    /// Open a store with a directory backend built from the config.
    /// With mode `Disabled` no backend is touched and the store is a
    /// plain in-memory map.
    pub fn open(map_cfg: &MapConfig, cfg: PersistConfig) -> Result<Self, StoreError> {
        if cfg.mode == DurabilityMode::Disabled {
            return Ok(Self {
                map: Mutex::new(BucketMap::new(map_cfg)),
                core: None,
                worker: Mutex::new(None),
                mode: DurabilityMode::Disabled,
                lock_timeout_ms: cfg.lock_timeout_ms,
                shut: AtomicBool::new(false),
            });
        }
        let backend = DirBackend::from_config(&cfg).map_err(StoreError::backend)?;
        let removed = backend.cleanup_incomplete().map_err(StoreError::backend)?;
        if removed > 0 {
            warn!(removed, "dropped incomplete entry artifacts");
        }
        Self::with_backend(map_cfg, cfg, Arc::new(backend))
    }

    /// Open a store over a caller-provided backend.
    pub fn with_backend(
        map_cfg: &MapConfig,
        cfg: PersistConfig,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, StoreError> {
        backend.ensure_container().map_err(StoreError::backend)?;
        let digester: Arc<dyn KeyDigester> = Arc::new(Sha256Digester);
        let mut map = BucketMap::with_digester(map_cfg, Arc::clone(&digester));
        let sink = BackendSink { backend: Arc::clone(&backend) };
        let lock_timeout_ms = cfg.lock_timeout_ms;
        let mode = cfg.mode;
        let recover = cfg.enable_crash_recovery;
        let core = Arc::new(PersistCore {
            cfg,
            backend,
            digester,
            persistence: RwLock::new(()),
            checkpoint: Mutex::new(()),
            wal: Mutex::new(WalWriter::new(Box::new(sink))),
            queue: Mutex::new(VecDeque::new()),
            queue_cond: Condvar::new(),
            txn_ids: IdSource::new(),
            last_sync_ns: AtomicU64::new(0),
            last_checkpoint_ns: AtomicU64::new(now_ns()),
            shutting_down: AtomicBool::new(false),
            wal_size_warned: AtomicBool::new(false),
            stats: PersistenceStats::default(),
        });

        if recover {
            recover_state(&mut map, &core);
        }

        let worker = {
            let core = Arc::clone(&core);
            std::thread::Builder::new()
                .name("hivemap-persist".into())
                .spawn(move || worker_loop(&core))
                .map_err(|e| StoreError::backend(format!("worker spawn: {e}")))?
        };

        Ok(Self {
            map: Mutex::new(map),
            core: Some(core),
            worker: Mutex::new(Some(worker)),
            mode,
            lock_timeout_ms,
            shut: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.shut.load(Ordering::Acquire) {
            Err(StoreError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.max(1))
    }

    fn map_guard(&self) -> Result<parking_lot::MutexGuard<'_, BucketMap>, StoreError> {
        self.map.try_lock_for(self.timeout()).ok_or(StoreError::LockTimeout(self.lock_timeout_ms))
    }

    fn read_guard<'a>(
        &self,
        core: &'a PersistCore,
    ) -> Result<parking_lot::RwLockReadGuard<'a, ()>, StoreError> {
        core.persistence
            .try_read_for(self.timeout())
            .ok_or(StoreError::LockTimeout(self.lock_timeout_ms))
    }

    fn write_guard<'a>(
        &self,
        core: &'a PersistCore,
    ) -> Result<parking_lot::RwLockWriteGuard<'a, ()>, StoreError> {
        core.persistence
            .try_write_for(self.timeout())
            .ok_or(StoreError::LockTimeout(self.lock_timeout_ms))
    }

    fn wants_sync(&self, value_tag: u8, force_sync: bool) -> bool {
        force_sync
            || self.mode == DurabilityMode::Sync
            || (self.mode == DurabilityMode::Hybrid && value_tag == ValueKind::Numeric.tag())
    }

    /// Insert or replace a value. With persistence enabled a log record
    /// is appended before the call returns; sync-policy mutations are
    /// flushed and stored inline, the rest are queued for the worker.
    pub fn put(
        &self,
        key: &[u8],
        value: &[u8],
        kind: ValueKind,
        force_sync: bool,
    ) -> Result<(), StoreError> {
        self.ensure_live()?;
        let Some(core) = &self.core else {
            return self.map_guard()?.put(key, value, kind);
        };
        let _read = self.read_guard(core)?;
        self.map_guard()?.put(key, value, kind)?;
        core.append_record(OpKind::Put, kind.tag(), key, value)?;
        let op = AsyncOp {
            op: OpKind::Put,
            key: Some(key.to_vec()),
            value: Some(value.to_vec()),
            value_tag: kind.tag(),
            enqueued_at_ns: now_ns(),
        };
        if self.wants_sync(kind.tag(), force_sync) {
            core.persist_now(op)
        } else {
            core.enqueue(op);
            Ok(())
        }
    }

    /// Look up a key: memory first, then the backend. A backend hit is
    /// written through into memory so the next lookup is fast.
    pub fn get(&self, key: &[u8]) -> Result<(Vec<u8>, ValueKind), StoreError> {
        self.ensure_live()?;
        match self.map_guard()?.get(key) {
            Ok(found) => return Ok(found),
            Err(StoreError::KeyNotFound) => {}
            Err(e) => return Err(e),
        }
        let Some(core) = &self.core else { return Err(StoreError::KeyNotFound) };
        let _read = self.read_guard(core)?;
        let name = core.entry_name(key);
        match core.backend.read_entry(&name) {
            Ok(blob) => {
                let (stored_key, tag, value) =
                    frame::decode_entry(&blob).map_err(StoreError::backend)?;
                if stored_key != key {
                    return Err(StoreError::KeyNotFound);
                }
                let kind = ValueKind::from_tag(tag).unwrap_or(ValueKind::Opaque);
                core.stats
                    .bytes_read
                    .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
                core.stats.op_ok(0);
                if let Err(e) = self.map_guard()?.put(key, &value, kind) {
                    warn!(error = %e, "write-through into memory failed");
                }
                Ok((value, kind))
            }
            Err(blob_store::Error::NotFound) => Err(StoreError::KeyNotFound),
            Err(e) => {
                core.stats.op_failed();
                Err(StoreError::backend(e))
            }
        }
    }

    /// Remove a key, logging the removal. Sync policy follows
    /// `force_sync` and the durability mode.
    pub fn remove(&self, key: &[u8], force_sync: bool) -> Result<(), StoreError> {
        self.ensure_live()?;
        let Some(core) = &self.core else {
            return self.map_guard()?.remove(key);
        };
        let _read = self.read_guard(core)?;
        self.map_guard()?.remove(key)?;
        core.append_record(OpKind::Remove, 0, key, &[])?;
        let op = AsyncOp {
            op: OpKind::Remove,
            key: Some(key.to_vec()),
            value: None,
            value_tag: 0,
            enqueued_at_ns: now_ns(),
        };
        if self.wants_sync(0, force_sync) {
            core.persist_now(op)
        } else {
            core.enqueue(op);
            Ok(())
        }
    }

    /// True when the key is resident in memory or stored in the backend.
    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.ensure_live()?;
        if self.map_guard()?.contains(key)? {
            return Ok(true);
        }
        let Some(core) = &self.core else { return Ok(false) };
        let _read = self.read_guard(core)?;
        Ok(core.backend.entry_exists(&core.entry_name(key)))
    }

    /// Drop every entry, logging the clear.
    pub fn clear(&self, force_sync: bool) -> Result<(), StoreError> {
        self.ensure_live()?;
        let Some(core) = &self.core else {
            self.map_guard()?.clear();
            return Ok(());
        };
        let _write = self.write_guard(core)?;
        self.map_guard()?.clear();
        core.append_record(OpKind::Clear, 0, &[], &[])?;
        let op = AsyncOp {
            op: OpKind::Clear,
            key: None,
            value: None,
            value_tag: 0,
            enqueued_at_ns: now_ns(),
        };
        if self.wants_sync(0, force_sync) {
            core.persist_now(op)
        } else {
            core.enqueue(op);
            Ok(())
        }
    }

    /// Drain the async queue and flush the log buffer.
    pub fn sync_to_storage(&self) -> Result<(), StoreError> {
        self.ensure_live()?;
        let Some(core) = &self.core else { return Ok(()) };
        let _write = self.write_guard(core)?;
        core.sync_locked()
    }

    /// Sync, then append a checkpoint marker superseding all prior
    /// records with current backend state.
    pub fn create_checkpoint(&self) -> Result<(), StoreError> {
        self.ensure_live()?;
        let Some(core) = &self.core else { return Ok(()) };
        let _write = self.write_guard(core)?;
        core.checkpoint_locked()
    }

    /// Snapshot of the persistence counters. Empty when persistence is
    /// disabled.
    pub fn stats(&self) -> StatsSnapshot {
        let Some(core) = &self.core else { return StatsSnapshot::default() };
        let s = &core.stats;
        StatsSnapshot {
            total_ops: s.total_ops.load(Ordering::Relaxed),
            successful_ops: s.successful_ops.load(Ordering::Relaxed),
            failed_ops: s.failed_ops.load(Ordering::Relaxed),
            bytes_written: s.bytes_written.load(Ordering::Relaxed),
            bytes_read: s.bytes_read.load(Ordering::Relaxed),
            wal_records: s.wal_records.load(Ordering::Relaxed),
            sync_count: s.sync_count.load(Ordering::Relaxed),
            checkpoint_count: s.checkpoint_count.load(Ordering::Relaxed),
            recovered_entries: s.recovered_entries.load(Ordering::Relaxed),
            replayed_records: s.replayed_records.load(Ordering::Relaxed),
            wal_corruptions: s.wal_corruptions.load(Ordering::Relaxed),
            queue_depth: core.queue.lock().len() as u64,
            last_sync_ns: core.last_sync_ns.load(Ordering::Relaxed),
            last_checkpoint_ns: core.last_checkpoint_ns.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the in-memory map's counters.
    pub fn map_metrics(&self) -> Result<MapMetrics, StoreError> {
        Ok(self.map_guard()?.metrics())
    }

    /// Number of entries resident in memory.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.map_guard()?.len())
    }

    /// True when no entries are resident in memory.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.map_guard()?.is_empty())
    }

    /// Stop the worker, drain the queue synchronously, take a final
    /// sync and checkpoint, and refuse further operations. Idempotent;
    /// also runs on drop.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        if self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(core) = &self.core else { return Ok(()) };
        core.shutting_down.store(true, Ordering::Relaxed);
        core.queue_cond.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let _write = core.persistence.write();
        core.drain_queue();
        core.sync_locked()?;
        core.checkpoint_locked()?;
        info!("store shut down");
        Ok(())
    }
}

impl Drop for DurableMap {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "shutdown on drop failed");
        }
    }
}

/// Two-stage recovery: load stored entries, then replay log records
/// written after the most recent checkpoint. Both stages tolerate
/// missing data; a torn tail truncates replay and is counted, never
/// fatal.
fn recover_state(map: &mut BucketMap, core: &Arc<PersistCore>) {
    let mut loaded = 0u64;
    match core.backend.list_entries() {
        Ok(names) => {
            for name in names {
                let blob = match core.backend.read_entry(&name) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(name = %name, error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                match frame::decode_entry(&blob) {
                    Ok((key, tag, value)) => {
                        let kind = ValueKind::from_tag(tag).unwrap_or(ValueKind::Opaque);
                        core.stats
                            .bytes_read
                            .fetch_add((key.len() + value.len()) as u64, Ordering::Relaxed);
                        match map.put(&key, &value, kind) {
                            Ok(()) => loaded += 1,
                            Err(e) => warn!(error = %e, "could not load entry"),
                        }
                    }
                    Err(e) => warn!(name = %name, error = %e, "skipping undecodable entry"),
                }
            }
        }
        Err(e) => warn!(error = %e, "entry enumeration failed"),
    }
    core.stats.recovered_entries.store(loaded, Ordering::Relaxed);

    let log = match core.backend.read_log() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "log read failed; skipping replay");
            return;
        }
    };
    let mut reader = WalReader::with_verification(&log, core.cfg.enable_checksums);
    let records: Vec<WalRecord> = reader.by_ref().collect();
    if let Some(err) = reader.corruption() {
        warn!(offset = reader.offset(), error = %err, "torn log tail; replay truncated");
        core.stats.wal_corruptions.fetch_add(1, Ordering::Relaxed);
    }
    let max_txn = records.iter().map(|r| r.txn_id).max().unwrap_or(0);
    let cursor =
        records.iter().rposition(|r| r.op == OpKind::Checkpoint).map_or(0, |i| i + 1);
    let mut replayed = 0u64;
    for rec in &records[cursor..] {
        match rec.op {
            OpKind::Put => {
                let kind = rec.value_kind().unwrap_or(ValueKind::Opaque);
                if let Err(e) = map.put(&rec.key, &rec.value, kind) {
                    warn!(error = %e, "replayed put failed");
                    continue;
                }
            }
            OpKind::Remove => {
                // Removing a key the backend never stored is fine.
                let _ = map.remove(&rec.key);
            }
            OpKind::Clear => map.clear(),
            OpKind::Checkpoint => {}
        }
        replayed += 1;
    }
    core.stats.replayed_records.store(replayed, Ordering::Relaxed);
    core.txn_ids.advance_past(max_txn);
    if let Some(mut wal) = core.wal.try_lock() {
        wal.set_sequence(records.len() as u64);
    }
    info!(loaded, replayed, records = records.len(), "recovery complete");
}
