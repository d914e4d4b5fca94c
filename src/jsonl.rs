// Journal file operations

use eyre::{Context, Result};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Append a batch of entries to a journal file under an exclusive lock.
///
/// All lines go out in a single write followed by an fsync. Returns the file
/// length before the append so a failed transaction can truncate back to it.
pub fn append_jsonl_batch(path: &Path, entries: &[&Value]) -> Result<u64> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open JSONL file for appending")?;

    // Acquire exclusive lock before writing
    file.lock_exclusive().context("Failed to acquire file lock")?;

    let previous_len = file.metadata()?.len();

    let mut buf = String::new();
    for entry in entries {
        buf.push_str(&serde_json::to_string(entry)?);
        buf.push('\n');
    }

    file.write_all(buf.as_bytes())
        .context("Failed to append to JSONL file")?;
    file.sync_all()?;

    debug!(file = ?path, lines = entries.len(), "append_jsonl_batch: appended");

    // Lock is automatically released when file is dropped
    Ok(previous_len)
}

/// Cut a journal back to `len` bytes, undoing an append
pub fn truncate_to(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .context("Failed to open JSONL file for truncation")?;
    file.lock_exclusive().context("Failed to acquire file lock")?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

/// What the cache remembers about a journal file to detect outside changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    /// Modification time in milliseconds since epoch
    pub mtime_ms: i64,
    /// Length in bytes
    pub len: i64,
}

impl FileStamp {
    pub fn of(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        let mtime_ms = metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(Self {
            mtime_ms,
            len: metadata.len() as i64,
        })
    }

    /// True if `self` (the file now) differs from `recorded`.
    ///
    /// Appends always change the length, so lines written within the same
    /// mtime tick as the recorded stamp are still caught.
    pub fn changed_since(&self, recorded: &FileStamp) -> bool {
        self.len != recorded.len || self.mtime_ms > recorded.mtime_ms
    }
}

/// Read all entries from a journal, returning the latest version per ID
///
/// When two lines share an ID the one with the higher updated_at wins; on a
/// tie the later line wins, since it was written later.
pub fn read_jsonl_latest<T>(path: &Path) -> Result<HashMap<String, T>>
where
    T: DeserializeOwned + HasId + HasUpdatedAt,
{
    if !path.exists() {
        // File doesn't exist yet, return empty map
        return Ok(HashMap::new());
    }

    let file = File::open(path).context("Failed to open JSONL file")?;
    let reader = BufReader::new(file);
    let mut entries: HashMap<String, T> = HashMap::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to read line, skipping"
                );
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let entry: T = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    file = ?path,
                    line = line_num + 1,
                    error = ?e,
                    "Failed to parse JSON, skipping"
                );
                continue;
            }
        };

        let Some(id) = entry.id() else {
            warn!(file = ?path, line = line_num + 1, "Entry has no id, skipping");
            continue;
        };

        let newer = entries
            .get(&id)
            .is_none_or(|existing| entry.updated_at() >= existing.updated_at());
        if newer {
            entries.insert(id, entry);
        }
    }

    info!(
        file = ?path,
        count = entries.len(),
        "Loaded latest entries from JSONL"
    );

    Ok(entries)
}

/// Trait for journal entries that carry an ID
pub trait HasId {
    fn id(&self) -> Option<String>;
}

/// Trait for journal entries that carry an updated_at timestamp
pub trait HasUpdatedAt {
    fn updated_at(&self) -> i64;
}

impl HasId for Value {
    fn id(&self) -> Option<String> {
        self.get("id").and_then(|v| v.as_str()).map(str::to_string)
    }
}

impl HasUpdatedAt for Value {
    fn updated_at(&self) -> i64 {
        self.get("updated_at").and_then(|v| v.as_i64()).unwrap_or(0)
    }
}

/// True for the deletion markers written by `Transaction::delete`
pub fn is_tombstone(entry: &Value) -> bool {
    entry.get("deleted").and_then(|v| v.as_bool()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_append_batch_writes_one_line_per_entry() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.jsonl");

        let milk = json!({"id": "t-1", "title": "Milk", "updated_at": 1000});
        let bread = json!({"id": "t-2", "title": "Bread", "updated_at": 1000});

        let before = append_jsonl_batch(&path, &[&milk, &bread]).unwrap();
        assert_eq!(before, 0);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"title\":\"Milk\""));
    }

    #[test]
    fn test_truncate_undoes_append() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.jsonl");

        let first = json!({"id": "t-1", "updated_at": 1});
        let second = json!({"id": "t-2", "updated_at": 2});

        append_jsonl_batch(&path, &[&first]).unwrap();
        let len = append_jsonl_batch(&path, &[&second]).unwrap();
        truncate_to(&path, len).unwrap();

        let entries: HashMap<String, Value> = read_jsonl_latest(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("t-1"));
    }

    #[test]
    fn test_read_jsonl_latest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.jsonl");

        let v1 = json!({"id": "t-1", "title": "Version 1", "updated_at": 1000});
        let v2 = json!({"id": "t-1", "title": "Version 2", "updated_at": 2000});
        append_jsonl_batch(&path, &[&v1, &v2]).unwrap();

        let entries: HashMap<String, Value> = read_jsonl_latest(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries["t-1"]["title"], "Version 2");
    }

    #[test]
    fn test_read_jsonl_later_line_wins_tie() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.jsonl");

        let done = json!({"id": "t-1", "is_complete": true, "updated_at": 5});
        let undone = json!({"id": "t-1", "is_complete": false, "updated_at": 5});
        append_jsonl_batch(&path, &[&done, &undone]).unwrap();

        let entries: HashMap<String, Value> = read_jsonl_latest(&path).unwrap();
        assert_eq!(entries["t-1"]["is_complete"], false);
    }

    #[test]
    fn test_read_jsonl_nonexistent_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.jsonl");

        let entries: HashMap<String, Value> = read_jsonl_latest(&path).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_read_jsonl_skips_malformed_and_idless_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.jsonl");

        fs::write(
            &path,
            r#"{"id":"t-1","title":"Valid","updated_at":1000}
{malformed json}
{"title":"No id","updated_at":1000}
{"id":"t-2","title":"Also Valid","updated_at":1000}
"#,
        )
        .unwrap();

        let entries: HashMap<String, Value> = read_jsonl_latest(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("t-1"));
        assert!(entries.contains_key("t-2"));
    }

    #[test]
    fn test_file_stamp_sees_append_in_same_tick() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.jsonl");

        append_jsonl_batch(&path, &[&json!({"id": "t-1", "updated_at": 1})]).unwrap();
        let recorded = FileStamp::of(&path).unwrap();

        append_jsonl_batch(&path, &[&json!({"id": "t-2", "updated_at": 1})]).unwrap();
        let mut now = FileStamp::of(&path).unwrap();
        // Pretend the filesystem clock did not move
        now.mtime_ms = recorded.mtime_ms;

        assert!(now.changed_since(&recorded));
        assert!(!recorded.changed_since(&recorded));
    }

    #[test]
    fn test_is_tombstone() {
        assert!(is_tombstone(&json!({"id": "t-1", "deleted": true})));
        assert!(!is_tombstone(&json!({"id": "t-1", "title": "Milk"})));
    }
}
