//! Core primitives and shared types for the bucket-addressed store.

#![deny(unsafe_code)]

/// Version of the core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum accepted key length in bytes.
pub const MAX_KEY_LEN: usize = 4096;

/// Maximum accepted value payload size in bytes.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

pub mod error {
    //! Closed error set shared across the store crates.

    use thiserror::Error;

    /// Errors returned by map and persistence operations.
    #[derive(Debug, Error)]
    pub enum StoreError {
        /// Empty, oversized, or policy-rejected key.
        #[error("invalid key: {0}")]
        InvalidKey(&'static str),
        /// Zero-length or oversized value payload.
        #[error("invalid value: {0}")]
        InvalidValue(&'static str),
        /// Lookup missed both the in-memory map and the backend.
        #[error("key not found")]
        KeyNotFound,
        /// The bucket table is full and the key maps to no existing bucket.
        #[error("bucket table full")]
        CapacityExceeded,
        /// Allocation failure reported by a fallible adapter.
        #[error("allocation failed")]
        OutOfMemory,
        /// A lock could not be acquired within the configured wait limit.
        #[error("lock wait exceeded {0} ms")]
        LockTimeout(u64),
        /// Opaque storage backend failure.
        #[error("backend: {0}")]
        Backend(String),
        /// Log record failed verification during recovery.
        #[error("wal corruption at sequence {sequence}: {detail}")]
        WalCorruption {
            /// Sequence number of the record that failed verification.
            sequence: u64,
            /// Human-readable failure description.
            detail: String,
        },
        /// Operation attempted after shutdown.
        #[error("store is shut down")]
        Shutdown,
    }

    impl StoreError {
        /// Wrap an arbitrary backend failure.
        pub fn backend(err: impl std::fmt::Display) -> Self {
            Self::Backend(err.to_string())
        }
    }
}

pub mod ids {
    //! Id utilities: per-context monotonic counters, timestamps, instance ids.

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    /// Per-context monotonic id source (entry ids, transaction ids).
    #[derive(Debug)]
    pub struct IdSource {
        next: AtomicU64,
    }

    impl IdSource {
        /// Source whose first issued id is 1.
        pub fn new() -> Self {
            Self::starting_at(1)
        }

        /// Source whose first issued id is `first`.
        pub fn starting_at(first: u64) -> Self {
            Self { next: AtomicU64::new(first) }
        }

        /// Issue the next id.
        pub fn next(&self) -> u64 {
            self.next.fetch_add(1, Ordering::Relaxed)
        }

        /// Ensure future ids are strictly greater than `seen`.
        ///
        /// Used after replay so new transaction ids continue past the log.
        pub fn advance_past(&self, seen: u64) {
            self.next.fetch_max(seen.saturating_add(1), Ordering::Relaxed);
        }
    }

    impl Default for IdSource {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Nanoseconds since UNIX epoch (for timestamps).
    pub fn now_ns() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
    }

    /// Opaque map instance identifier (UUID v4 string).
    pub fn new_map_id() -> String {
        Uuid::new_v4().to_string()
    }

}

pub mod key {
    //! Key digests and bucket addressing over a 256-bit space.

    use super::error::StoreError;
    use super::{MAX_KEY_LEN, MAX_VALUE_SIZE};
    use sha2::{Digest as _, Sha256};
    use std::fmt;

    /// Length of a key digest in bytes.
    pub const DIGEST_LEN: usize = 32;

    /// 256-bit deterministic summary of a key.
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Digest256(pub [u8; DIGEST_LEN]);

    impl Digest256 {
        /// Hex-encoded lowercase string.
        pub fn to_hex(&self) -> String {
            hex::encode(self.0)
        }
    }

    impl fmt::Debug for Digest256 {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Digest256({})", self.to_hex())
        }
    }

    /// Bucket address derived from a key digest: the 256-bit slot address
    /// plus a 64-bit advisory verification tag.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BucketAddr {
        /// 256-bit bucket slot address.
        pub addr: [u8; DIGEST_LEN],
        /// XOR-fold of a secondary digest projection. Advisory only; it
        /// does not detect all collisions.
        pub tag: u64,
    }

    /// Digest function at the keying seam. The default is SHA-256; tests
    /// inject colliding digesters to exercise bucket chaining.
    pub trait KeyDigester: Send + Sync {
        /// Map key bytes to a 256-bit digest. Equal keys yield equal digests.
        fn digest(&self, key: &[u8]) -> Digest256;
    }

    /// SHA-256 digester used by default.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct Sha256Digester;

    impl KeyDigester for Sha256Digester {
        fn digest(&self, key: &[u8]) -> Digest256 {
            let mut out = [0u8; DIGEST_LEN];
            out.copy_from_slice(&Sha256::digest(key));
            Digest256(out)
        }
    }

    /// Derive the bucket address for a digest. The slot address is the
    /// digest itself; the tag XOR-folds the u64 lanes of a second
    /// SHA-256 pass over the digest.
    pub fn derive_addr(digest: &Digest256) -> BucketAddr {
        let second = Sha256::digest(digest.0);
        let mut tag = 0u64;
        for lane in second.chunks_exact(8) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(lane);
            tag ^= u64::from_le_bytes(buf);
        }
        BucketAddr { addr: digest.0, tag }
    }

    /// Validate a key: non-empty, bounded length, well-formed UTF-8.
    pub fn validate_key(key: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey("empty"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(StoreError::InvalidKey("exceeds maximum length"));
        }
        if std::str::from_utf8(key).is_err() {
            return Err(StoreError::InvalidKey("malformed utf-8"));
        }
        Ok(())
    }

    /// Validate a value payload: non-empty and bounded.
    pub fn validate_value(value: &[u8]) -> Result<(), StoreError> {
        if value.is_empty() {
            return Err(StoreError::InvalidValue("empty"));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(StoreError::InvalidValue("exceeds maximum size"));
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn digest_is_deterministic() {
            let d = Sha256Digester;
            assert_eq!(d.digest(b"alpha"), d.digest(b"alpha"));
            assert_ne!(d.digest(b"alpha"), d.digest(b"beta"));
        }

        #[test]
        fn addr_tag_folds_secondary_projection() {
            let d = Sha256Digester;
            let a1 = derive_addr(&d.digest(b"alpha"));
            let a2 = derive_addr(&d.digest(b"alpha"));
            assert_eq!(a1, a2);
            assert_eq!(a1.addr, d.digest(b"alpha").0);
            assert_ne!(a1.tag, 0);
        }

        #[test]
        fn key_bounds() {
            assert!(validate_key(b"").is_err());
            assert!(validate_key(&vec![b'k'; MAX_KEY_LEN]).is_ok());
            assert!(validate_key(&vec![b'k'; MAX_KEY_LEN + 1]).is_err());
            assert!(validate_key(&[0xff, 0xfe]).is_err());
        }

        #[test]
        fn value_bounds() {
            assert!(validate_value(b"").is_err());
            assert!(validate_value(&vec![0u8; MAX_VALUE_SIZE]).is_ok());
            assert!(validate_value(&vec![0u8; MAX_VALUE_SIZE + 1]).is_err());
        }

        #[test]
        fn digest_dispersion_over_small_corpus() {
            let d = Sha256Digester;
            let mut seen = std::collections::HashSet::new();
            for i in 0..1000u32 {
                let key = format!("key-{i}");
                assert!(seen.insert(d.digest(key.as_bytes()).0));
            }
        }
    }
}

pub mod value {
    //! Payload classification tags.

    use serde::{Deserialize, Serialize};

    /// Kind of payload held by a value cell. Affects typed validation and
    /// durability policy, not in-memory layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ValueKind {
        /// Uninterpreted bytes.
        Opaque,
        /// UTF-8 text.
        Text,
        /// Fixed-width numeric blob.
        Numeric,
        /// Application-reserved tag in `0x80..=0xff`.
        User(u8),
    }

    impl ValueKind {
        /// Wire tag for this kind.
        pub fn tag(self) -> u8 {
            match self {
                Self::Opaque => 0,
                Self::Text => 1,
                Self::Numeric => 2,
                Self::User(t) => t,
            }
        }

        /// Decode a wire tag. Tags `3..=0x7f` are reserved.
        pub fn from_tag(tag: u8) -> Option<Self> {
            match tag {
                0 => Some(Self::Opaque),
                1 => Some(Self::Text),
                2 => Some(Self::Numeric),
                0x80..=0xff => Some(Self::User(tag)),
                _ => None,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn tag_round_trip() {
            for kind in [ValueKind::Opaque, ValueKind::Text, ValueKind::Numeric, ValueKind::User(0x9a)] {
                assert_eq!(ValueKind::from_tag(kind.tag()), Some(kind));
            }
        }

        #[test]
        fn reserved_tags_rejected() {
            assert_eq!(ValueKind::from_tag(3), None);
            assert_eq!(ValueKind::from_tag(0x7f), None);
        }
    }
}

pub mod config {
    //! Configuration surface for the map and its persistence layer.

    use serde::{Deserialize, Serialize};
    use std::path::Path;

    /// Sizing for the in-memory map.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct MapConfig {
        /// Fixed capacity of the bucket table.
        pub initial_bucket_capacity: usize,
        /// Advisory memory ceiling; the map does not evict.
        pub max_memory_bytes: u64,
    }

    impl Default for MapConfig {
        fn default() -> Self {
            Self { initial_bucket_capacity: 1024, max_memory_bytes: 256 * 1024 * 1024 }
        }
    }

    /// When mutations become durable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DurabilityMode {
        /// No log, no worker; the store degrades to the in-memory map.
        Disabled,
        /// Every mutation is logged and flushed before the call returns.
        Sync,
        /// Mutations are logged and handed to the background worker.
        Async,
        /// Sync for numeric payloads, async for everything else.
        Hybrid,
    }

    /// Persistence configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PersistConfig {
        /// Durability mode, fixed at open time.
        pub mode: DurabilityMode,
        /// Backend location for per-key entry blobs.
        pub storage_path: String,
        /// Backend location for the log stream.
        pub wal_path: String,
        /// Maximum wait between worker wake-ups, in milliseconds.
        pub sync_interval_ms: u64,
        /// Maximum age of the latest checkpoint before the worker creates
        /// a new one, in milliseconds.
        pub checkpoint_interval_ms: u64,
        /// Advisory cap on log size before rotation, in MiB.
        pub max_wal_size_mb: u64,
        /// zstd level `0..=9`; 0 disables compression of stored blobs.
        pub compression_level: i32,
        /// Encrypt stored blobs at rest (AES-256-GCM).
        pub enable_encryption: bool,
        /// Hex-encoded 32-byte key; required when encryption is enabled.
        pub encryption_key_hex: Option<String>,
        /// When false, record CRCs are still written but never verified.
        pub enable_checksums: bool,
        /// Replay the log and load stored entries at open time.
        pub enable_crash_recovery: bool,
        /// Soft ceiling on the async op queue length.
        pub max_concurrent_ops: usize,
        /// Per-lock wait limit in milliseconds.
        pub lock_timeout_ms: u64,
    }

    impl Default for PersistConfig {
        fn default() -> Self {
            Self {
                mode: DurabilityMode::Disabled,
                storage_path: String::new(),
                wal_path: String::new(),
                sync_interval_ms: 1000,
                checkpoint_interval_ms: 60_000,
                max_wal_size_mb: 64,
                compression_level: 0,
                enable_encryption: false,
                encryption_key_hex: None,
                enable_checksums: true,
                enable_crash_recovery: true,
                max_concurrent_ops: 4096,
                lock_timeout_ms: 5000,
            }
        }
    }

    impl PersistConfig {
        /// Config rooted under `dir` with the given mode: entry blobs in
        /// `dir/entries`, log stream at `dir/store.wal`.
        pub fn at(dir: &Path, mode: DurabilityMode) -> Self {
            Self {
                mode,
                storage_path: dir.join("entries").to_string_lossy().into_owned(),
                wal_path: dir.join("store.wal").to_string_lossy().into_owned(),
                ..Self::default()
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn defaults_are_sane() {
            let cfg = PersistConfig::default();
            assert_eq!(cfg.mode, DurabilityMode::Disabled);
            assert!(cfg.enable_checksums);
            assert_eq!(cfg.lock_timeout_ms, 5000);
        }

        #[test]
        fn config_deserializes_with_partial_fields() {
            let cfg: PersistConfig =
                serde_json::from_str(r#"{"mode":"sync","wal_path":"/tmp/x.wal"}"#).unwrap();
            assert_eq!(cfg.mode, DurabilityMode::Sync);
            assert_eq!(cfg.wal_path, "/tmp/x.wal");
            assert_eq!(cfg.sync_interval_ms, 1000);
        }

        #[test]
        fn rooted_paths() {
            let cfg = PersistConfig::at(Path::new("/data/store"), DurabilityMode::Async);
            assert!(cfg.storage_path.ends_with("entries"));
            assert!(cfg.wal_path.ends_with("store.wal"));
        }
    }
}
