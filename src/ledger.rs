//! Append-only chain-of-custody ledger.
//!
//! Every evidence file is recorded here before analysis runs on it. The
//! ledger is content-addressed through the SHA-256 column: `verify` answers
//! whether a hash has ever been appended. Rows are never mutated or removed,
//! and the same hash may legitimately appear more than once (the same
//! footage re-ingested under a new case).
//!
//! The file store writes one complete row per append and syncs it to stable
//! storage before returning, so readers observe either the pre- or
//! post-state of an append, never a partial row.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::EvidenceRecord;

const LEDGER_HEADER: &str =
    "filename,content_hash,ingest_time,camera_id,duration_seconds,metadata_json";
const LEDGER_COLUMNS: usize = 6;

/// One appended row, with its zero-based position in the ledger.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LedgerEntry {
    pub index: u64,
    pub record: EvidenceRecord,
}

pub trait EvidenceLedger: Send {
    /// Append one record as a new row, durable before returning. Duplicate
    /// hashes are valid and always accepted.
    fn append(&mut self, record: &EvidenceRecord) -> Result<LedgerEntry>;

    /// True iff `hash` has ever appeared as a content hash in this ledger,
    /// including rows appended earlier in the same run.
    fn verify(&mut self, hash: &str) -> Result<bool>;
}

/// Ledger handle shared across concurrent case pipelines. Appends are
/// single-writer by construction.
pub type SharedLedger = Arc<Mutex<Box<dyn EvidenceLedger>>>;

pub fn shared(ledger: impl EvidenceLedger + 'static) -> SharedLedger {
    Arc::new(Mutex::new(Box::new(ledger)))
}

// -------------------- CSV file store --------------------

/// Append-only CSV file, one row per ingestion, header row on creation.
pub struct CsvEvidenceLedger {
    path: PathBuf,
    file: File,
    rows_written: u64,
}

impl CsvEvidenceLedger {
    /// Open (or create) the ledger file. A new or empty file gets the header
    /// row, synced before the handle is handed out.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("failed to create ledger directory {}: {}", parent.display(), e)
                })?;
            }
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .read(true)
            .open(&path)
            .map_err(|e| anyhow!("failed to open ledger {}: {}", path.display(), e))?;

        let len = file
            .metadata()
            .map_err(|e| anyhow!("failed to stat ledger {}: {}", path.display(), e))?
            .len();
        let rows_written;
        if len == 0 {
            file.write_all(LEDGER_HEADER.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .and_then(|_| file.sync_all())
                .map_err(|e| anyhow!("failed to write ledger header {}: {}", path.display(), e))?;
            rows_written = 0;
        } else {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| anyhow!("failed to read ledger {}: {}", path.display(), e))?;
            rows_written = parse_rows(&contents)?.len() as u64;
        }

        Ok(Self {
            path,
            file,
            rows_written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read every row from disk. Used by `verify` and the external
    /// auditor; the writer keeps rows line-atomic so this sees only whole
    /// rows.
    pub fn read_entries(&self) -> Result<Vec<LedgerEntry>> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| anyhow!("failed to read ledger {}: {}", self.path.display(), e))?;
        let rows = parse_rows(&contents)?;
        rows.into_iter()
            .enumerate()
            .map(|(index, fields)| row_to_entry(index as u64, fields))
            .collect()
    }
}

impl EvidenceLedger for CsvEvidenceLedger {
    fn append(&mut self, record: &EvidenceRecord) -> Result<LedgerEntry> {
        let metadata_json = serde_json::to_string(&record.metadata)?;
        let duration = record
            .duration_seconds
            .map(|d| format!("{d:.3}"))
            .unwrap_or_default();
        let mut row = String::new();
        for (i, field) in [
            record.filename.as_str(),
            record.content_hash.as_str(),
            &record.ingest_time.to_rfc3339(),
            record.camera_id.as_str(),
            duration.as_str(),
            metadata_json.as_str(),
        ]
        .into_iter()
        .enumerate()
        {
            if i > 0 {
                row.push(',');
            }
            push_csv_field(&mut row, field);
        }
        row.push('\n');

        // One write_all per row, then sync: a crash leaves either the whole
        // row or none of it visible to line-oriented readers.
        self.file
            .write_all(row.as_bytes())
            .and_then(|_| self.file.sync_all())
            .map_err(|e| anyhow!("ledger append failed for {}: {}", self.path.display(), e))?;

        let entry = LedgerEntry {
            index: self.rows_written,
            record: record.clone(),
        };
        self.rows_written += 1;
        Ok(entry)
    }

    fn verify(&mut self, hash: &str) -> Result<bool> {
        let entries = self.read_entries()?;
        Ok(entries.iter().any(|entry| entry.record.content_hash == hash))
    }
}

// -------------------- In-memory store --------------------

/// Vec-backed ledger for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryEvidenceLedger {
    entries: Vec<LedgerEntry>,
}

impl InMemoryEvidenceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }
}

impl EvidenceLedger for InMemoryEvidenceLedger {
    fn append(&mut self, record: &EvidenceRecord) -> Result<LedgerEntry> {
        let entry = LedgerEntry {
            index: self.entries.len() as u64,
            record: record.clone(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    fn verify(&mut self, hash: &str) -> Result<bool> {
        Ok(self
            .entries
            .iter()
            .any(|entry| entry.record.content_hash == hash))
    }
}

// -------------------- Row format --------------------

fn push_csv_field(out: &mut String, field: &str) {
    let needs_quotes = field.contains(',') || field.contains('"') || field.contains('\n');
    if needs_quotes {
        out.push('"');
        for ch in field.chars() {
            if ch == '"' {
                out.push('"');
            }
            out.push(ch);
        }
        out.push('"');
    } else {
        out.push_str(field);
    }
}

/// Parse the ledger file into data rows (header excluded). Quote-aware, so
/// commas and quotes inside the metadata JSON round-trip.
fn parse_rows(contents: &str) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = contents.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
            }
            '\n' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut fields));
            }
            '\r' if !in_quotes => {}
            _ => field.push(ch),
        }
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        rows.push(fields);
    }

    let mut data = Vec::new();
    for (line, row) in rows.into_iter().enumerate() {
        if line == 0 {
            if row.first().map(String::as_str) != Some("filename") {
                return Err(anyhow!("ledger is missing its header row"));
            }
            continue;
        }
        if row.len() != LEDGER_COLUMNS {
            return Err(anyhow!(
                "ledger row {} has {} columns, expected {}",
                line,
                row.len(),
                LEDGER_COLUMNS
            ));
        }
        data.push(row);
    }
    Ok(data)
}

fn row_to_entry(index: u64, fields: Vec<String>) -> Result<LedgerEntry> {
    let [filename, content_hash, ingest_time, camera_id, duration, metadata_json]: [String; 6] =
        fields
            .try_into()
            .map_err(|_| anyhow!("ledger row {} has wrong arity", index))?;
    let ingest_time = chrono::DateTime::parse_from_rfc3339(&ingest_time)
        .map_err(|e| anyhow!("ledger row {}: bad ingest_time: {}", index, e))?
        .with_timezone(&chrono::Utc);
    let duration_seconds = if duration.is_empty() {
        None
    } else {
        Some(
            duration
                .parse::<f64>()
                .map_err(|e| anyhow!("ledger row {}: bad duration: {}", index, e))?,
        )
    };
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|e| anyhow!("ledger row {}: bad metadata json: {}", index, e))?;
    Ok(LedgerEntry {
        index,
        record: EvidenceRecord {
            filename,
            content_hash,
            ingest_time,
            camera_id,
            duration_seconds,
            metadata,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(hash: &str) -> EvidenceRecord {
        let mut metadata = BTreeMap::new();
        metadata.insert("file_size_bytes".to_string(), "1024".to_string());
        metadata.insert("note".to_string(), "comma, \"quote\"".to_string());
        EvidenceRecord {
            filename: "cam01_2026-08-28.mp4".to_string(),
            content_hash: hash.to_string(),
            ingest_time: Utc::now(),
            camera_id: "cam01".to_string(),
            duration_seconds: Some(62.5),
            metadata,
        }
    }

    #[test]
    fn verify_false_before_append_true_after() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ledger = CsvEvidenceLedger::open(dir.path().join("ledger.csv"))?;
        assert!(!ledger.verify("abc123")?);
        ledger.append(&record("abc123"))?;
        assert!(ledger.verify("abc123")?);
        assert!(!ledger.verify("def456")?);
        Ok(())
    }

    #[test]
    fn duplicate_hashes_are_accepted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut ledger = CsvEvidenceLedger::open(dir.path().join("ledger.csv"))?;
        let first = ledger.append(&record("abc123"))?;
        let second = ledger.append(&record("abc123"))?;
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_eq!(ledger.read_entries()?.len(), 2);
        Ok(())
    }

    #[test]
    fn rows_round_trip_through_the_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.csv");
        let original = record("feedbeef");
        {
            let mut ledger = CsvEvidenceLedger::open(&path)?;
            ledger.append(&original)?;
        }
        let ledger = CsvEvidenceLedger::open(&path)?;
        let entries = ledger.read_entries()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.filename, original.filename);
        assert_eq!(entries[0].record.content_hash, original.content_hash);
        assert_eq!(entries[0].record.metadata, original.metadata);
        assert_eq!(entries[0].record.duration_seconds, Some(62.5));
        Ok(())
    }

    #[test]
    fn reopen_preserves_row_count_and_header() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ledger.csv");
        {
            let mut ledger = CsvEvidenceLedger::open(&path)?;
            ledger.append(&record("one"))?;
        }
        {
            let mut ledger = CsvEvidenceLedger::open(&path)?;
            let entry = ledger.append(&record("two"))?;
            assert_eq!(entry.index, 1);
        }
        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(contents.matches("filename,content_hash").count(), 1);
        Ok(())
    }

    #[test]
    fn in_memory_ledger_matches_contract() -> Result<()> {
        let mut ledger = InMemoryEvidenceLedger::new();
        assert!(!ledger.verify("abc")?);
        ledger.append(&record("abc"))?;
        ledger.append(&record("abc"))?;
        assert!(ledger.verify("abc")?);
        assert_eq!(ledger.entries().len(), 2);
        Ok(())
    }
}
