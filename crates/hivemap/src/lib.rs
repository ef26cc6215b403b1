//! In-memory keyed map over a 256-bit bucket-address space.
//!
//! Keys are digested to 256 bits; each digest selects a bucket in a
//! fixed-capacity table. Buckets chain entries in insertion order and are
//! compared by full key on collision, so digest collisions degrade into
//! longer chains, never data loss. Ownership is a strict tree: the map
//! owns buckets, a bucket owns its entries, an entry owns its key copy
//! and value cell, the cell owns the payload bytes.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use hivemap_core::config::MapConfig;
use hivemap_core::error::StoreError;
use hivemap_core::ids::{new_map_id, now_ns, IdSource};
use hivemap_core::key::{
    derive_addr, validate_key, validate_value, BucketAddr, Digest256, KeyDigester, Sha256Digester,
    DIGEST_LEN,
};
use hivemap_core::value::ValueKind;
use tracing::debug;

/// Sole owner of a stored payload, with a kind tag and access bookkeeping.
#[derive(Debug)]
pub struct ValueCell {
    kind: ValueKind,
    bytes: Vec<u8>,
    created_at_ns: u64,
    last_accessed_ns: u64,
    access_count: u64,
}

impl ValueCell {
    fn new(kind: ValueKind, bytes: Vec<u8>) -> Self {
        let now = now_ns();
        Self { kind, bytes, created_at_ns: now, last_accessed_ns: now, access_count: 0 }
    }

    /// Release the old payload and adopt the new one.
    fn replace(&mut self, kind: ValueKind, bytes: Vec<u8>) {
        self.kind = kind;
        self.bytes = bytes;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_accessed_ns = now_ns();
        self.access_count += 1;
    }

    /// Payload kind tag.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the payload is empty (never the case for stored cells).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow the payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of successful reads and replacements.
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Creation timestamp in nanoseconds.
    pub fn created_at_ns(&self) -> u64 {
        self.created_at_ns
    }

    /// Last access timestamp in nanoseconds.
    pub fn last_accessed_ns(&self) -> u64 {
        self.last_accessed_ns
    }
}

/// Bucket-owned record: an owned key copy, its digest and address, the
/// value cell, and a map-unique entry id.
#[derive(Debug)]
pub struct Entry {
    key: Vec<u8>,
    digest: Digest256,
    cell: ValueCell,
    entry_id: u64,
}

impl Entry {
    /// Borrow the key bytes.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Digest of the key.
    pub fn digest(&self) -> Digest256 {
        self.digest
    }

    /// Borrow the value cell.
    pub fn cell(&self) -> &ValueCell {
        &self.cell
    }

    /// Map-unique id assigned at creation.
    pub fn entry_id(&self) -> u64 {
        self.entry_id
    }
}

/// One slot of the bucket table. Entries stay in insertion order; a
/// replace keeps the entry's position.
#[derive(Debug)]
pub struct Bucket {
    addr: BucketAddr,
    entries: Vec<Entry>,
    total_value_bytes: u64,
    last_access_ns: u64,
}

impl Bucket {
    fn new(addr: BucketAddr) -> Self {
        Self { addr, entries: Vec::new(), total_value_bytes: 0, last_access_ns: now_ns() }
    }

    /// Bucket address.
    pub fn addr(&self) -> BucketAddr {
        self.addr
    }

    /// Number of chained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of payload sizes over all chained entries.
    pub fn value_bytes(&self) -> u64 {
        self.total_value_bytes
    }

    /// Timestamp of the last access through this bucket.
    pub fn last_access_ns(&self) -> u64 {
        self.last_access_ns
    }

    /// Iterate entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    fn position_of(&self, key: &[u8]) -> Option<usize> {
        self.entries.iter().position(|e| e.key == key)
    }
}

/// Operation counters for one map instance. Reset to zero by `clear`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MapMetrics {
    /// Total operations attempted.
    pub total_ops: u64,
    /// Operations that returned success.
    pub successful_ops: u64,
    /// Operations that returned an error (lookup misses included).
    pub failed_ops: u64,
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found none.
    pub misses: u64,
    /// Successful puts.
    pub puts: u64,
    /// Cumulative payload bytes accepted by successful puts.
    pub put_bytes: u64,
}

impl MapMetrics {
    /// Running average payload size over successful puts.
    pub fn avg_value_bytes(&self) -> u64 {
        if self.puts == 0 {
            0
        } else {
            self.put_bytes / self.puts
        }
    }
}

/// Fixed-capacity keyed map. Not internally synchronized; callers that
/// share one across threads put it behind a lock.
pub struct BucketMap {
    map_id: String,
    capacity: usize,
    buckets: Vec<Bucket>,
    index: HashMap<[u8; DIGEST_LEN], usize>,
    digester: Arc<dyn KeyDigester>,
    entry_ids: IdSource,
    metrics: MapMetrics,
}

impl BucketMap {
    /// Create a map sized by `cfg`, digesting keys with SHA-256.
    pub fn new(cfg: &MapConfig) -> Self {
        Self::with_digester(cfg, Arc::new(Sha256Digester))
    }

    /// Create a map with an injected digest function.
    pub fn with_digester(cfg: &MapConfig, digester: Arc<dyn KeyDigester>) -> Self {
        let capacity = cfg.initial_bucket_capacity.max(1);
        debug!(capacity, "bucket map created");
        Self {
            map_id: new_map_id(),
            capacity,
            buckets: Vec::new(),
            index: HashMap::new(),
            digester,
            entry_ids: IdSource::new(),
            metrics: MapMetrics::default(),
        }
    }

    /// Unique id of this map instance.
    pub fn map_id(&self) -> &str {
        &self.map_id
    }

    /// Number of live entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Fixed bucket-table capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the operation counters.
    pub fn metrics(&self) -> MapMetrics {
        self.metrics
    }

    /// Insert or replace the value for `key`. A replace keeps the entry's
    /// position and adjusts the bucket's byte total by the size delta.
    pub fn put(&mut self, key: &[u8], value: &[u8], kind: ValueKind) -> Result<(), StoreError> {
        self.metrics.total_ops += 1;
        match self.put_inner(key, value, kind) {
            Ok(()) => {
                self.metrics.successful_ops += 1;
                self.metrics.puts += 1;
                self.metrics.put_bytes += value.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.metrics.failed_ops += 1;
                Err(e)
            }
        }
    }

    fn put_inner(&mut self, key: &[u8], value: &[u8], kind: ValueKind) -> Result<(), StoreError> {
        validate_key(key)?;
        validate_value(value)?;
        let digest = self.digester.digest(key);
        let addr = derive_addr(&digest);

        let slot = match self.index.get(&addr.addr) {
            Some(&slot) => slot,
            None => {
                if self.buckets.len() == self.capacity {
                    return Err(StoreError::CapacityExceeded);
                }
                let slot = self.buckets.len();
                self.buckets.push(Bucket::new(addr));
                self.index.insert(addr.addr, slot);
                slot
            }
        };

        let now = now_ns();
        let bucket = &mut self.buckets[slot];
        bucket.last_access_ns = now;
        if let Some(pos) = bucket.position_of(key) {
            let entry = &mut bucket.entries[pos];
            let old = entry.cell.len() as u64;
            entry.cell.replace(kind, value.to_vec());
            bucket.total_value_bytes = bucket.total_value_bytes - old + value.len() as u64;
        } else {
            let entry = Entry {
                key: key.to_vec(),
                digest,
                cell: ValueCell::new(kind, value.to_vec()),
                entry_id: self.entry_ids.next(),
            };
            bucket.total_value_bytes += value.len() as u64;
            bucket.entries.push(entry);
        }
        Ok(())
    }

    /// Return an owned copy of the payload and its kind. Bumps the
    /// entry's access count and last-accessed timestamp.
    pub fn get(&mut self, key: &[u8]) -> Result<(Vec<u8>, ValueKind), StoreError> {
        self.metrics.total_ops += 1;
        match self.get_inner(key) {
            Ok(found) => {
                self.metrics.successful_ops += 1;
                self.metrics.hits += 1;
                Ok(found)
            }
            Err(e) => {
                if matches!(e, StoreError::KeyNotFound) {
                    self.metrics.misses += 1;
                }
                self.metrics.failed_ops += 1;
                Err(e)
            }
        }
    }

    fn get_inner(&mut self, key: &[u8]) -> Result<(Vec<u8>, ValueKind), StoreError> {
        validate_key(key)?;
        let addr = derive_addr(&self.digester.digest(key));
        let slot = *self.index.get(&addr.addr).ok_or(StoreError::KeyNotFound)?;
        let bucket = &mut self.buckets[slot];
        let pos = bucket.position_of(key).ok_or(StoreError::KeyNotFound)?;
        bucket.last_access_ns = now_ns();
        let cell = &mut bucket.entries[pos].cell;
        cell.touch();
        Ok((cell.bytes.clone(), cell.kind))
    }

    /// Unlink and free the entry for `key`.
    pub fn remove(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.metrics.total_ops += 1;
        match self.remove_inner(key) {
            Ok(()) => {
                self.metrics.successful_ops += 1;
                Ok(())
            }
            Err(e) => {
                self.metrics.failed_ops += 1;
                Err(e)
            }
        }
    }

    fn remove_inner(&mut self, key: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        let addr = derive_addr(&self.digester.digest(key));
        let slot = *self.index.get(&addr.addr).ok_or(StoreError::KeyNotFound)?;
        let bucket = &mut self.buckets[slot];
        let pos = bucket.position_of(key).ok_or(StoreError::KeyNotFound)?;
        let entry = bucket.entries.remove(pos);
        bucket.total_value_bytes -= entry.cell.len() as u64;
        bucket.last_access_ns = now_ns();
        Ok(())
    }

    /// True when an entry with byte-equal key exists. Does not bump
    /// access bookkeeping.
    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        validate_key(key)?;
        let addr = derive_addr(&self.digester.digest(key));
        Ok(self
            .index
            .get(&addr.addr)
            .is_some_and(|&slot| self.buckets[slot].position_of(key).is_some()))
    }

    /// Free every entry and bucket and reset the counters to zero.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.index.clear();
        self.metrics = MapMetrics::default();
    }

    /// Bucket holding `key`'s address, if one exists.
    pub fn bucket_for_key(&self, key: &[u8]) -> Option<&Bucket> {
        let addr = derive_addr(&self.digester.digest(key));
        self.index.get(&addr.addr).map(|&slot| &self.buckets[slot])
    }

    /// Iterate all live entries, bucket by bucket in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.buckets.iter().flat_map(|b| b.entries.iter())
    }
}

impl std::fmt::Debug for BucketMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketMap")
            .field("map_id", &self.map_id)
            .field("capacity", &self.capacity)
            .field("buckets", &self.buckets.len())
            .field("entries", &self.len())
            .finish()
    }
}
