//! Directory-backed storage for the persistence layer: per-key entry
//! blobs plus an append-only log stream.
//!
//! Overview
//! - Entry blobs are named by the key's digest hex and sharded `aa/bb/<name>`.
//! - Atomicity: entry writes go to a `.incomplete` temp file, `fsync`,
//!   atomic rename, then directory `fsync`.
//! - At rest, entry blobs are zstd-compressed (fixed level from config;
//!   0 disables) and AES-256-GCM sealed when encryption is enabled. The
//!   nonce is derived as SHA-256(key || name || SHA-256(payload))[..12],
//!   so rewrites of the same name with new content never reuse a nonce.
//! - The log stream is stored verbatim; its records carry their own CRCs.
//!
//! Blobs are readable only under the codec configuration that wrote
//! them; changing the compression level or key between runs requires a
//! migration pass this crate does not provide.

#![warn(missing_docs)]

use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use hivemap_core::config::PersistConfig;
use sha2::{Digest as _, Sha256};

/// Error type for storage operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Underlying IO failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Cryptographic failure (AEAD, key, nonce).
    #[error("crypto: {0}")]
    Crypto(String),
    /// Stored blob failed structural or authentication checks.
    #[error("integrity: stored blob failed verification")]
    Integrity,
    /// Entry blob not found.
    #[error("not found")]
    NotFound,
    /// Configuration rejected at construction.
    #[error("config: {0}")]
    Config(&'static str),
}

/// Seal/open transform applied to entry blobs at rest.
pub struct BlobCodec {
    zstd_level: i32,
    key: Option<[u8; 32]>,
}

impl BlobCodec {
    /// Codec that stores payloads verbatim.
    pub fn plain() -> Self {
        Self { zstd_level: 0, key: None }
    }

    /// Codec with a zstd level (`0` disables compression) and an
    /// optional AES-256-GCM key.
    pub fn new(zstd_level: i32, key: Option<[u8; 32]>) -> Self {
        Self { zstd_level: zstd_level.clamp(0, 9), key }
    }

    fn derive_nonce(key: &[u8; 32], name: &str, payload: &[u8]) -> [u8; 12] {
        let content = Sha256::digest(payload);
        let mut h = Sha256::new();
        h.update(key);
        h.update(name.as_bytes());
        h.update(content);
        let full = h.finalize();
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&full[..12]);
        nonce
    }

    /// Transform plaintext into its at-rest form.
    pub fn seal(&self, name: &str, plain: &[u8]) -> Result<Vec<u8>, Error> {
        let data = if self.zstd_level > 0 {
            zstd::stream::encode_all(Cursor::new(plain), self.zstd_level)?
        } else {
            plain.to_vec()
        };
        match &self.key {
            None => Ok(data),
            Some(key) => {
                let nonce_bytes = Self::derive_nonce(key, name, &data);
                #[allow(deprecated)]
                let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key));
                #[allow(deprecated)]
                let nonce = Nonce::from_slice(&nonce_bytes);
                let ct = cipher
                    .encrypt(nonce, data.as_ref())
                    .map_err(|_| Error::Crypto("encrypt".into()))?;
                let mut out = Vec::with_capacity(12 + ct.len());
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    /// Reverse [`BlobCodec::seal`].
    pub fn open(&self, _name: &str, stored: &[u8]) -> Result<Vec<u8>, Error> {
        let data = match &self.key {
            None => stored.to_vec(),
            Some(key) => {
                if stored.len() < 12 {
                    return Err(Error::Integrity);
                }
                let (nonce_bytes, ct) = stored.split_at(12);
                #[allow(deprecated)]
                let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key));
                #[allow(deprecated)]
                let nonce = Nonce::from_slice(nonce_bytes);
                cipher.decrypt(nonce, ct).map_err(|_| Error::Crypto("decrypt".into()))?
            }
        };
        if self.zstd_level > 0 {
            zstd::stream::decode_all(Cursor::new(data)).map_err(|_| Error::Integrity)
        } else {
            Ok(data)
        }
    }
}

pub mod frame {
    //! Framing for per-key entry blobs: key bytes, kind tag, payload.

    use super::Error;

    const FRAME_MAGIC: [u8; 4] = *b"HEN1";
    const FRAME_HEADER_LEN: usize = 16;

    /// Encode an entry blob: magic, key length, value length, kind tag,
    /// then key and value bytes.
    pub fn encode_entry(key: &[u8], kind_tag: u8, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + key.len() + value.len());
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        out.push(kind_tag);
        out.extend_from_slice(&[0, 0, 0]);
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        out
    }

    /// Decode an entry blob into `(key, kind_tag, value)`.
    pub fn decode_entry(bytes: &[u8]) -> Result<(Vec<u8>, u8, Vec<u8>), Error> {
        if bytes.len() < FRAME_HEADER_LEN || bytes[0..4] != FRAME_MAGIC {
            return Err(Error::Integrity);
        }
        let key_len =
            u32::from_le_bytes(bytes[4..8].try_into().unwrap_or_default()) as usize;
        let value_len =
            u32::from_le_bytes(bytes[8..12].try_into().unwrap_or_default()) as usize;
        let kind_tag = bytes[12];
        if bytes.len() != FRAME_HEADER_LEN + key_len + value_len {
            return Err(Error::Integrity);
        }
        let key = bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + key_len].to_vec();
        let value = bytes[FRAME_HEADER_LEN + key_len..].to_vec();
        Ok((key, kind_tag, value))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn entry_frame_round_trip() {
            let blob = encode_entry(b"key", 2, &[9, 9, 9]);
            let (key, tag, value) = decode_entry(&blob).unwrap();
            assert_eq!(key, b"key");
            assert_eq!(tag, 2);
            assert_eq!(value, vec![9, 9, 9]);
        }

        #[test]
        fn bad_magic_rejected() {
            let mut blob = encode_entry(b"key", 0, &[1]);
            blob[0] ^= 0xff;
            assert!(matches!(decode_entry(&blob), Err(Error::Integrity)));
        }

        #[test]
        fn length_mismatch_rejected() {
            let mut blob = encode_entry(b"key", 0, &[1, 2, 3]);
            blob.truncate(blob.len() - 1);
            assert!(matches!(decode_entry(&blob), Err(Error::Integrity)));
        }
    }
}

/// Byte-level contract the persistence layer requires from storage:
/// an append-only log stream plus random-access per-key entry blobs.
pub trait Backend: Send + Sync {
    /// Create the storage container. Idempotent.
    fn ensure_container(&self) -> Result<(), Error>;
    /// Append bytes to the end of the log stream.
    fn append_log(&self, bytes: &[u8]) -> Result<(), Error>;
    /// Read the whole log stream; a missing stream yields empty bytes.
    fn read_log(&self) -> Result<Vec<u8>, Error>;
    /// Truncate the log stream to empty.
    fn reset_log(&self) -> Result<(), Error>;
    /// Create or overwrite the entry blob named `name`.
    fn write_entry(&self, name: &str, bytes: &[u8]) -> Result<(), Error>;
    /// Read the entry blob named `name`.
    fn read_entry(&self, name: &str) -> Result<Vec<u8>, Error>;
    /// True when the entry blob `name` exists.
    fn entry_exists(&self, name: &str) -> bool;
    /// Remove the entry blob `name`; missing is not an error.
    fn remove_entry(&self, name: &str) -> Result<(), Error>;
    /// Remove every entry blob.
    fn remove_all_entries(&self) -> Result<(), Error>;
    /// Names of all stored entry blobs.
    fn list_entries(&self) -> Result<Vec<String>, Error>;
}

/// Filesystem-backed [`Backend`].
pub struct DirBackend {
    entries_root: PathBuf,
    wal_path: PathBuf,
    codec: BlobCodec,
}

impl DirBackend {
    /// Backend rooted at the given entry and log paths.
    pub fn new(
        storage_path: impl Into<PathBuf>,
        wal_path: impl Into<PathBuf>,
        codec: BlobCodec,
    ) -> Result<Self, Error> {
        let backend =
            Self { entries_root: storage_path.into(), wal_path: wal_path.into(), codec };
        backend.ensure_container()?;
        Ok(backend)
    }

    /// Backend built from a persistence config (paths, compression
    /// level, encryption key).
    pub fn from_config(cfg: &PersistConfig) -> Result<Self, Error> {
        if cfg.storage_path.is_empty() || cfg.wal_path.is_empty() {
            return Err(Error::Config("storage_path and wal_path are required"));
        }
        let key = if cfg.enable_encryption {
            let hex_key = cfg
                .encryption_key_hex
                .as_deref()
                .ok_or(Error::Config("encryption enabled without a key"))?;
            let raw = hex::decode(hex_key).map_err(|_| Error::Config("key is not valid hex"))?;
            let key: [u8; 32] =
                raw.try_into().map_err(|_| Error::Config("key must be 32 bytes"))?;
            Some(key)
        } else {
            None
        };
        Self::new(&cfg.storage_path, &cfg.wal_path, BlobCodec::new(cfg.compression_level, key))
    }

    /// Sharded path for an entry name (`aa/bb/<name>`).
    pub fn path_for(&self, name: &str) -> PathBuf {
        if name.len() >= 4 {
            self.entries_root.join(&name[0..2]).join(&name[2..4]).join(name)
        } else {
            self.entries_root.join(name)
        }
    }

    /// Remove `.incomplete` artifacts left by interrupted writes; returns
    /// the count removed.
    pub fn cleanup_incomplete(&self) -> Result<usize, Error> {
        fn walk(dir: &Path, count: &mut usize) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    let _ = walk(&path, count);
                } else if path.extension().is_some_and(|e| e == "incomplete") {
                    fs::remove_file(&path)?;
                    *count += 1;
                }
            }
            Ok(())
        }
        let mut removed = 0usize;
        if self.entries_root.exists() {
            let _ = walk(&self.entries_root, &mut removed);
        }
        Ok(removed)
    }

    fn write_atomic(&self, final_path: &Path, bytes: &[u8]) -> Result<(), Error> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = final_path.with_extension("incomplete");
        {
            let mut out = fs::File::create(&tmp_path)?;
            out.write_all(bytes)?;
            out.sync_all()?;
        }
        fs::rename(&tmp_path, final_path)?;
        if let Some(parent) = final_path.parent() {
            if let Ok(dirf) = fs::File::open(parent) {
                let _ = dirf.sync_all();
            }
        }
        Ok(())
    }
}

impl Backend for DirBackend {
    fn ensure_container(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.entries_root)?;
        if let Some(parent) = self.wal_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn append_log(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut f = fs::OpenOptions::new().create(true).append(true).open(&self.wal_path)?;
        f.write_all(bytes)?;
        f.sync_data()?;
        Ok(())
    }

    fn read_log(&self) -> Result<Vec<u8>, Error> {
        match fs::File::open(&self.wal_path) {
            Ok(mut f) => {
                let mut out = Vec::new();
                f.read_to_end(&mut out)?;
                Ok(out)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn reset_log(&self) -> Result<(), Error> {
        match fs::OpenOptions::new().write(true).truncate(true).open(&self.wal_path) {
            Ok(f) => {
                f.sync_all()?;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write_entry(&self, name: &str, bytes: &[u8]) -> Result<(), Error> {
        let sealed = self.codec.seal(name, bytes)?;
        self.write_atomic(&self.path_for(name), &sealed)
    }

    fn read_entry(&self, name: &str) -> Result<Vec<u8>, Error> {
        let stored = match fs::read(self.path_for(name)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(Error::Io(e)),
        };
        self.codec.open(name, &stored)
    }

    fn entry_exists(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    fn remove_entry(&self, name: &str) -> Result<(), Error> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn remove_all_entries(&self) -> Result<(), Error> {
        if self.entries_root.exists() {
            fs::remove_dir_all(&self.entries_root)?;
        }
        fs::create_dir_all(&self.entries_root)?;
        Ok(())
    }

    fn list_entries(&self) -> Result<Vec<String>, Error> {
        fn walk(dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    walk(&path, out)?;
                } else if path.extension().map_or(true, |e| e != "incomplete") {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        out.push(name.to_string());
                    }
                }
            }
            Ok(())
        }
        let mut names = Vec::new();
        if self.entries_root.exists() {
            walk(&self.entries_root, &mut names)?;
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_plain_is_identity() {
        let codec = BlobCodec::plain();
        let sealed = codec.seal("n", b"payload").unwrap();
        assert_eq!(sealed, b"payload");
        assert_eq!(codec.open("n", &sealed).unwrap(), b"payload");
    }

    #[test]
    fn codec_compression_round_trip() {
        let codec = BlobCodec::new(3, None);
        let plain = vec![7u8; 32 * 1024];
        let sealed = codec.seal("n", &plain).unwrap();
        assert!(sealed.len() < plain.len());
        assert_eq!(codec.open("n", &sealed).unwrap(), plain);
    }

    #[test]
    fn codec_encryption_round_trip_and_tamper() {
        let codec = BlobCodec::new(0, Some([0x11; 32]));
        let sealed = codec.seal("name", b"secret bytes").unwrap();
        assert_ne!(&sealed[12..], b"secret bytes");
        assert_eq!(codec.open("name", &sealed).unwrap(), b"secret bytes");

        let mut tampered = sealed.clone();
        let mid = tampered.len() / 2;
        tampered[mid] ^= 0xaa;
        assert!(matches!(codec.open("name", &tampered), Err(Error::Crypto(_))));
    }

    #[test]
    fn rewrites_never_reuse_a_nonce() {
        let codec = BlobCodec::new(0, Some([0x22; 32]));
        let a = codec.seal("same-name", b"first contents").unwrap();
        let b = codec.seal("same-name", b"second contents").unwrap();
        assert_ne!(&a[..12], &b[..12]);
    }

    #[test]
    fn wrong_key_fails_closed() {
        let good = BlobCodec::new(0, Some([0x33; 32]));
        let bad = BlobCodec::new(0, Some([0x44; 32]));
        let sealed = good.seal("n", b"data").unwrap();
        assert!(bad.open("n", &sealed).is_err());
    }
}
