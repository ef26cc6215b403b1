// Crash-recovery behavior: backend loads, replay from the latest
// checkpoint, torn tails, and read-through after a cold start.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use durable_map::DurableMap;
use hivemap_core::config::{DurabilityMode, MapConfig, PersistConfig};
use hivemap_core::value::ValueKind;
use wal::{LogSink, OpKind, WalWriter};

fn map_cfg() -> MapConfig {
    MapConfig { initial_bucket_capacity: 512, ..MapConfig::default() }
}

fn persist_cfg(dir: &Path, mode: DurabilityMode) -> PersistConfig {
    PersistConfig {
        sync_interval_ms: 25,
        checkpoint_interval_ms: 3_600_000,
        ..PersistConfig::at(dir, mode)
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl LogSink for SharedBuf {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.0.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }
}

/// Hand-build a log stream and drop it at the store's wal path.
fn seed_wal(dir: &Path, build: impl FnOnce(&mut WalWriter)) {
    let sink = SharedBuf::default();
    let mut writer = WalWriter::new(Box::new(sink.clone()));
    build(&mut writer);
    writer.flush().unwrap();
    std::fs::write(dir.join("store.wal"), sink.bytes()).unwrap();
}

#[test]
fn replay_rebuilds_state_from_wal_alone() {
    let dir = tempfile::tempdir().unwrap();
    seed_wal(dir.path(), |w| {
        w.append(1, 10, OpKind::Put, ValueKind::Opaque.tag(), b"k1", &[1]).unwrap();
        w.append(2, 20, OpKind::Put, ValueKind::Text.tag(), b"k2", b"two").unwrap();
        w.append(3, 30, OpKind::Remove, 0, b"k1", &[]).unwrap();
    });

    let store = DurableMap::open(&map_cfg(), persist_cfg(dir.path(), DurabilityMode::Sync)).unwrap();
    assert!(matches!(store.get(b"k1"), Err(hivemap_core::error::StoreError::KeyNotFound)));
    let (value, kind) = store.get(b"k2").unwrap();
    assert_eq!(value, b"two");
    assert_eq!(kind, ValueKind::Text);
    let s = store.stats();
    assert_eq!(s.replayed_records, 3);
    assert_eq!(s.recovered_entries, 0);
    assert_eq!(s.wal_corruptions, 0);
}

#[test]
fn torn_tail_truncates_replay_without_failing_open() {
    let dir = tempfile::tempdir().unwrap();
    seed_wal(dir.path(), |w| {
        w.append(1, 10, OpKind::Put, 0, b"k1", &[1]).unwrap();
        w.append(2, 20, OpKind::Put, 0, b"k2", &[2]).unwrap();
        w.append(3, 30, OpKind::Put, 0, b"k3", &[3]).unwrap();
    });
    // Corrupt the third record's header.
    let wal_path = dir.path().join("store.wal");
    let mut bytes = std::fs::read(&wal_path).unwrap();
    let third = 2 * (wal::HEADER_LEN + 2 + 1);
    bytes[third + 8] ^= 0xff;
    std::fs::write(&wal_path, &bytes).unwrap();

    let store = DurableMap::open(&map_cfg(), persist_cfg(dir.path(), DurabilityMode::Sync)).unwrap();
    assert!(store.contains(b"k1").unwrap());
    assert!(store.contains(b"k2").unwrap());
    assert!(!store.contains(b"k3").unwrap());
    let s = store.stats();
    assert_eq!(s.wal_corruptions, 1);
    assert_eq!(s.replayed_records, 2);
}

#[test]
fn disabled_checksums_skip_verification_on_replay() {
    let dir = tempfile::tempdir().unwrap();
    seed_wal(dir.path(), |w| {
        w.append(1, 10, OpKind::Put, 0, b"k1", &[5]).unwrap();
    });
    // Damage only the CRC field; framing stays valid.
    let wal_path = dir.path().join("store.wal");
    let mut bytes = std::fs::read(&wal_path).unwrap();
    bytes[37] ^= 0x55;
    std::fs::write(&wal_path, &bytes).unwrap();

    let mut cfg = persist_cfg(dir.path(), DurabilityMode::Sync);
    cfg.enable_checksums = false;
    let store = DurableMap::open(&map_cfg(), cfg).unwrap();
    assert_eq!(store.get(b"k1").unwrap().0, vec![5]);
    assert_eq!(store.stats().wal_corruptions, 0);
}

#[test]
fn checkpoint_moves_the_replay_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        DurableMap::open(&map_cfg(), persist_cfg(dir.path(), DurabilityMode::Async)).unwrap();
    for i in 0..100u32 {
        store.put(format!("pre-{i}").as_bytes(), &i.to_le_bytes(), ValueKind::Opaque, false).unwrap();
    }
    store.create_checkpoint().unwrap();
    for i in 0..50u32 {
        store
            .put(format!("post-{i}").as_bytes(), &i.to_le_bytes(), ValueKind::Opaque, false)
            .unwrap();
    }
    store.sync_to_storage().unwrap();
    std::mem::forget(store);

    let reopened =
        DurableMap::open(&map_cfg(), persist_cfg(dir.path(), DurabilityMode::Async)).unwrap();
    assert_eq!(reopened.len().unwrap(), 150);
    let s = reopened.stats();
    // Everything flushed before the crash is loadable from storage; only
    // the records after the checkpoint replay on top.
    assert_eq!(s.recovered_entries, 150);
    assert_eq!(s.replayed_records, 50);
    assert_eq!(reopened.get(b"pre-42").unwrap().0, 42u32.to_le_bytes().to_vec());
    assert_eq!(reopened.get(b"post-7").unwrap().0, 7u32.to_le_bytes().to_vec());
}

#[test]
fn cold_start_reads_through_and_repopulates_memory() {
    let dir = tempfile::tempdir().unwrap();
    let store = DurableMap::open(&map_cfg(), persist_cfg(dir.path(), DurabilityMode::Sync)).unwrap();
    store.put(b"cold", b"stored", ValueKind::Text, false).unwrap();
    drop(store);

    let mut cfg = persist_cfg(dir.path(), DurabilityMode::Sync);
    cfg.enable_crash_recovery = false;
    let store = DurableMap::open(&map_cfg(), cfg).unwrap();
    assert_eq!(store.len().unwrap(), 0);

    // An existence probe consults the backend without populating memory.
    assert!(store.contains(b"cold").unwrap());
    assert_eq!(store.len().unwrap(), 0);

    // A read miss falls through to the backend and writes back.
    let (value, kind) = store.get(b"cold").unwrap();
    assert_eq!(value, b"stored");
    assert_eq!(kind, ValueKind::Text);
    assert_eq!(store.len().unwrap(), 1);
    assert!(store.stats().bytes_read > 0);

    // The second read is a memory hit.
    store.get(b"cold").unwrap();
    assert!(store.map_metrics().unwrap().hits >= 1);
}

#[test]
fn replay_preserves_clear_semantics() {
    let dir = tempfile::tempdir().unwrap();
    seed_wal(dir.path(), |w| {
        w.append(1, 10, OpKind::Put, 0, b"a", &[1]).unwrap();
        w.append(2, 20, OpKind::Put, 0, b"b", &[2]).unwrap();
        w.append(3, 30, OpKind::Clear, 0, &[], &[]).unwrap();
        w.append(4, 40, OpKind::Put, 0, b"c", &[3]).unwrap();
    });

    let store = DurableMap::open(&map_cfg(), persist_cfg(dir.path(), DurabilityMode::Sync)).unwrap();
    assert!(!store.contains(b"a").unwrap());
    assert!(!store.contains(b"b").unwrap());
    assert_eq!(store.get(b"c").unwrap().0, vec![3]);
}

#[test]
fn new_transaction_ids_continue_past_the_log() {
    let dir = tempfile::tempdir().unwrap();
    seed_wal(dir.path(), |w| {
        w.append(17, 10, OpKind::Put, 0, b"seed", &[1]).unwrap();
    });

    let store = DurableMap::open(&map_cfg(), persist_cfg(dir.path(), DurabilityMode::Sync)).unwrap();
    store.put(b"next", &[2], ValueKind::Opaque, false).unwrap();
    store.sync_to_storage().unwrap();
    drop(store);

    let log = std::fs::read(dir.path().join("store.wal")).unwrap();
    let recs: Vec<_> = wal::WalReader::new(&log).collect();
    // The new record's transaction id is strictly above the replayed one.
    let new_rec = recs.iter().find(|r| r.key == b"next").unwrap();
    assert!(new_rec.txn_id > 17);
}
