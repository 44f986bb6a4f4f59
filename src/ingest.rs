//! Evidence intake: content hashing and record construction.
//!
//! An unreadable or missing evidence file is fatal for that case and is
//! surfaced before any ledger append is attempted; every downstream claim
//! depends on the custody row existing.

use anyhow::{anyhow, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::EvidenceRecord;

const HASH_CHUNK_BYTES: usize = 8192;

/// Streaming SHA-256 of a file, hex-encoded.
pub fn hash_file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path)
        .map_err(|e| anyhow!("evidence file unreadable {}: {}", path.display(), e))?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; HASH_CHUNK_BYTES];
    loop {
        let read = file
            .read(&mut chunk)
            .map_err(|e| anyhow!("evidence read failed {}: {}", path.display(), e))?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, hex-encoded. Deterministic: identical
/// bytes always hash identically.
pub fn hash_bytes_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl EvidenceRecord {
    /// Hash the file and build an immutable record with the current UTC
    /// ingest time. Filesystem facts (size, mtime) land in the metadata map
    /// alongside whatever the caller supplies.
    pub fn from_file(
        path: impl AsRef<Path>,
        camera_id: &str,
        duration_seconds: Option<f64>,
        mut metadata: BTreeMap<String, String>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let content_hash = hash_file_sha256(path)?;
        let filename = path
            .file_name()
            .ok_or_else(|| anyhow!("evidence path has no filename: {}", path.display()))?
            .to_string_lossy()
            .into_owned();

        let stat = std::fs::metadata(path)
            .map_err(|e| anyhow!("evidence file unreadable {}: {}", path.display(), e))?;
        metadata.insert("file_size_bytes".to_string(), stat.len().to_string());
        if let Ok(modified) = stat.modified() {
            let modified: chrono::DateTime<Utc> = modified.into();
            metadata.insert("modified_time".to_string(), modified.to_rfc3339());
        }

        Ok(Self {
            filename,
            content_hash,
            ingest_time: Utc::now(),
            camera_id: camera_id.to_string(),
            duration_seconds,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hashing_is_deterministic() {
        let bytes = b"the same bytes";
        assert_eq!(hash_bytes_sha256(bytes), hash_bytes_sha256(bytes));
        assert_ne!(hash_bytes_sha256(bytes), hash_bytes_sha256(b"other bytes"));
    }

    #[test]
    fn file_hash_matches_buffer_hash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.mp4");
        let payload = vec![0xABu8; 20_000];
        std::fs::File::create(&path)?.write_all(&payload)?;
        assert_eq!(hash_file_sha256(&path)?, hash_bytes_sha256(&payload));
        Ok(())
    }

    #[test]
    fn missing_file_is_a_fatal_error() {
        let err = hash_file_sha256("/nonexistent/evidence.mp4").unwrap_err();
        assert!(err.to_string().contains("unreadable"));
    }

    #[test]
    fn record_carries_filename_hash_and_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cam02_night.mp4");
        std::fs::File::create(&path)?.write_all(b"footage")?;
        let record =
            EvidenceRecord::from_file(&path, "cam02", Some(12.0), BTreeMap::new())?;
        assert_eq!(record.filename, "cam02_night.mp4");
        assert_eq!(record.content_hash, hash_bytes_sha256(b"footage"));
        assert_eq!(record.metadata.get("file_size_bytes").map(String::as_str), Some("7"));
        assert_eq!(record.camera_id, "cam02");
        Ok(())
    }
}
