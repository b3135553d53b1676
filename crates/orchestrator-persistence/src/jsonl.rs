//! Append-only JSON-lines files.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::atomic::ensure_dir;
use crate::error::{PersistenceError, Result};

/// Appends one record as a single line.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');

    let write_err = |source| PersistenceError::WriteError {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(write_err)?;
    // One write call per record keeps concurrent appenders from interleaving.
    file.write_all(&line).map_err(write_err)?;
    file.sync_data().map_err(write_err)?;
    Ok(())
}

/// Reads every record from a JSON-lines file.
///
/// A missing file is an empty log. A torn final line (the process died
/// mid-append) is skipped with a warning; any other undecodable line is an
/// error.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(path).map_err(|source| PersistenceError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;

    let lines: Vec<&str> = data.lines().collect();
    let mut records = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if i + 1 == lines.len() && !data.ends_with('\n') => {
                warn!(path = %path.display(), error = %e, "skipping torn trailing record");
            }
            Err(e) => {
                return Err(PersistenceError::Corrupt {
                    path: path.to_path_buf(),
                    line: i + 1,
                    reason: e.to_string(),
                })
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Entry {
        seq: u32,
        text: String,
    }

    fn entry(seq: u32) -> Entry {
        Entry {
            seq,
            text: format!("line {}", seq),
        }
    }

    #[test]
    fn test_append_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/events.jsonl");

        for seq in 0..5 {
            append_record(&path, &entry(seq)).unwrap();
        }

        let records: Vec<Entry> = read_records(&path).unwrap();
        let seqs: Vec<u32> = records.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let records: Vec<Entry> = read_records(&dir.path().join("none.jsonl")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_torn_trailing_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        append_record(&path, &entry(1)).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,\"te").unwrap();

        let records: Vec<Entry> = read_records(&path).unwrap();
        assert_eq!(records, vec![entry(1)]);
    }

    #[test]
    fn test_corrupt_middle_line_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        fs::write(&path, "garbage\n{\"seq\":1,\"text\":\"ok\"}\n").unwrap();

        let result: Result<Vec<Entry>> = read_records(&path);
        assert!(matches!(result, Err(PersistenceError::Corrupt { line: 1, .. })));
    }
}
