// Record engine: JSONL journal as source of truth, SQLite as queryable cache

use crate::filter::Filter;
use crate::jsonl::{self, FileStamp};
use crate::live::{Change, ChangeKind, ChangeSet};
use crate::record::{IndexValue, Record};
use eyre::{Context, Result, eyre};
use rusqlite::{Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info, warn};

const CURRENT_VERSION: u32 = 1;
const STORE_DIR: &str = ".tasklists";
const DB_FILE: &str = "tasklists.db";

/// Persistent record store with an SQLite cache and JSONL source of truth
pub struct Store {
    base_path: PathBuf,
    db: Connection,
    revision: u64,
    subscribers: Vec<Sender<ChangeSet>>,
}

impl Store {
    /// Open or create a store at the given path
    ///
    /// The store will be created in a `.tasklists` subdirectory of the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let base_path = path.as_ref().join(STORE_DIR);

        fs::create_dir_all(&base_path).context("Failed to create store directory")?;

        let db_path = base_path.join(DB_FILE);
        let db = Connection::open(&db_path).context("Failed to open SQLite database")?;

        let mut store = Self {
            base_path,
            db,
            revision: 0,
            subscribers: Vec::new(),
        };

        store.create_schema()?;
        store.create_gitignore()?;
        store.write_version()?;

        if store.is_stale()? {
            info!("Database is stale, syncing from JSONL files");
            store.sync()?;
        }

        Ok(store)
    }

    /// Get the base path of this store
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Number of commits (and reloads) this handle has seen
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Receive a `ChangeSet` for every commit made through this handle
    pub fn subscribe(&mut self) -> Receiver<ChangeSet> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    fn create_schema(&self) -> Result<()> {
        debug!("Creating database schema");

        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection);
            CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(collection, updated_at);

            CREATE TABLE IF NOT EXISTS record_indexes (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                field_name TEXT NOT NULL,
                field_value_str TEXT,
                field_value_int INTEGER,
                field_value_bool INTEGER,
                PRIMARY KEY (collection, id, field_name)
            );

            CREATE INDEX IF NOT EXISTS idx_record_indexes_field_str ON record_indexes(collection, field_name, field_value_str);
            CREATE INDEX IF NOT EXISTS idx_record_indexes_field_int ON record_indexes(collection, field_name, field_value_int);
            CREATE INDEX IF NOT EXISTS idx_record_indexes_field_bool ON record_indexes(collection, field_name, field_value_bool);

            -- Staleness detection against the journal files
            CREATE TABLE IF NOT EXISTS sync_metadata (
                collection TEXT PRIMARY KEY,
                last_sync_time INTEGER NOT NULL,
                file_mtime INTEGER NOT NULL,
                file_len INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(())
    }

    fn create_gitignore(&self) -> Result<()> {
        let gitignore_path = self.base_path.join(".gitignore");
        if !gitignore_path.exists() {
            fs::write(
                gitignore_path,
                "tasklists.db\ntasklists.db-shm\ntasklists.db-wal\ntasklists.db-journal\n",
            )?;
        }
        Ok(())
    }

    fn write_version(&self) -> Result<()> {
        let version_path = self.base_path.join(".version");
        if !version_path.exists() {
            fs::write(version_path, CURRENT_VERSION.to_string())?;
        }
        Ok(())
    }

    /// Check if the cache needs rebuilding from the journal
    ///
    /// Returns true if any JSONL file has been modified since it was last
    /// synced or written through this store, or was never synced at all.
    pub fn is_stale(&self) -> Result<bool> {
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();

            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }

            let collection = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| eyre!("Invalid JSONL filename: {:?}", path))?;

            let current = FileStamp::of(&path)?;

            let recorded: Option<FileStamp> = self
                .db
                .query_row(
                    "SELECT file_mtime, file_len FROM sync_metadata WHERE collection = ?1",
                    [collection],
                    |row| {
                        Ok(FileStamp {
                            mtime_ms: row.get(0)?,
                            len: row.get(1)?,
                        })
                    },
                )
                .optional()?;

            match recorded {
                None => return Ok(true),                                           // Never synced
                Some(recorded) if current.changed_since(&recorded) => return Ok(true), // File modified
                _ => continue,
            }
        }

        Ok(false)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Get a record by ID
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        fetch_one(&self.db, id)
    }

    /// List records with optional filtering, most recently updated first
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        fetch_many(&self.db, filters)
    }

    /// Number of records in a collection
    pub fn count<T: Record>(&self) -> Result<usize> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            [T::collection_name()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Run `f` inside one write transaction.
    ///
    /// If `f` returns `Ok`, its staged records are appended to the journal and
    /// the SQLite transaction commits. Any error, from `f`, the journal append
    /// or the commit, rolls the SQLite transaction back and truncates whatever
    /// was already appended, so neither side keeps a partial write.
    pub fn write<F, R, E>(&mut self, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<R, E>,
        E: From<eyre::Report> + std::fmt::Display,
    {
        let tx = self.db.transaction().context("Failed to begin transaction")?;
        let mut txn = Transaction {
            tx,
            staged: Vec::new(),
        };

        let value = match f(&mut txn) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "write: rolled back");
                return Err(e);
            }
        };

        let Transaction { tx, staged } = txn;
        if staged.is_empty() {
            tx.commit().context("Failed to commit transaction")?;
            return Ok(value);
        }

        let mut appended: Vec<(PathBuf, u64)> = Vec::new();
        let outcome = Self::journal_staged(&self.base_path, &tx, &staged, &mut appended)
            .and_then(|()| tx.commit().context("Failed to commit transaction"));

        if let Err(e) = outcome {
            for (path, len) in appended.iter().rev() {
                if let Err(undo) = jsonl::truncate_to(path, *len) {
                    warn!(file = ?path, error = %undo, "write: failed to truncate journal");
                }
            }
            warn!(error = %e, "write: rolled back");
            return Err(e.into());
        }

        self.revision += 1;
        let changes: Vec<Change> = staged.into_iter().map(|s| s.change).collect();
        debug!(revision = self.revision, changes = changes.len(), "write: committed");
        broadcast(
            &mut self.subscribers,
            ChangeSet {
                revision: self.revision,
                changes,
            },
        );

        Ok(value)
    }

    fn journal_staged(
        base_path: &Path,
        tx: &Connection,
        staged: &[Staged],
        appended: &mut Vec<(PathBuf, u64)>,
    ) -> Result<()> {
        let mut by_collection: BTreeMap<&'static str, Vec<&serde_json::Value>> = BTreeMap::new();
        for s in staged {
            by_collection.entry(s.change.collection).or_default().push(&s.entry);
        }

        for (collection, entries) in by_collection {
            let path = base_path.join(format!("{}.jsonl", collection));
            let previous_len = jsonl::append_jsonl_batch(&path, &entries)?;
            appended.push((path.clone(), previous_len));

            // Our own appends must not make the cache look stale on reopen
            Self::record_stamp(tx, collection, &FileStamp::of(&path)?)?;
        }

        Ok(())
    }

    fn record_stamp(tx: &Connection, collection: &str, stamp: &FileStamp) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO sync_metadata (collection, last_sync_time, file_mtime, file_len)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![collection, now_ms(), stamp.mtime_ms, stamp.len],
        )?;
        Ok(())
    }

    fn update_indexes_tx(
        tx: &Connection,
        collection: &str,
        id: &str,
        fields: &HashMap<String, IndexValue>,
    ) -> Result<()> {
        debug!(collection, id, field_count = fields.len(), "update_indexes_tx: called");

        tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
        )?;

        for (field_name, value) in fields {
            Self::validate_field_name(field_name)?;

            match value {
                IndexValue::String(s) => {
                    tx.execute(
                        "INSERT INTO record_indexes (collection, id, field_name, field_value_str, field_value_int, field_value_bool)
                         VALUES (?1, ?2, ?3, ?4, NULL, NULL)",
                        rusqlite::params![collection, id, field_name, s],
                    )?;
                }
                IndexValue::Int(i) => {
                    tx.execute(
                        "INSERT INTO record_indexes (collection, id, field_name, field_value_str, field_value_int, field_value_bool)
                         VALUES (?1, ?2, ?3, NULL, ?4, NULL)",
                        rusqlite::params![collection, id, field_name, i],
                    )?;
                }
                IndexValue::Bool(b) => {
                    tx.execute(
                        "INSERT INTO record_indexes (collection, id, field_name, field_value_str, field_value_int, field_value_bool)
                         VALUES (?1, ?2, ?3, NULL, NULL, ?4)",
                        rusqlite::params![collection, id, field_name, *b as i64],
                    )?;
                }
            }
        }

        Ok(())
    }

    fn validate_collection_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(eyre!("Collection name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(eyre!("Collection name too long: {} (max 64 chars)", name));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(eyre!(
                "Invalid collection name: {} (must be alphanumeric with _/-)",
                name
            ));
        }
        Ok(())
    }

    fn validate_field_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(eyre!("Field name cannot be empty"));
        }
        if name.len() > 64 {
            return Err(eyre!("Field name too long: {} (max 64 chars)", name));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(eyre!("Invalid field name: {} (must be alphanumeric with _)", name));
        }
        Ok(())
    }

    fn validate_id(id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(eyre!("Record ID cannot be empty or whitespace-only"));
        }
        if id.len() > 256 {
            return Err(eyre!("Record ID too long: {} chars (max 256)", id.len()));
        }
        Ok(())
    }

    // ========================================================================
    // Sync operations
    // ========================================================================

    /// Rebuild the SQLite cache from the JSONL files
    ///
    /// After sync, call `rebuild_indexes::<T>()` for each record type to restore indexes.
    pub fn sync(&mut self) -> Result<()> {
        info!("Syncing database from JSONL files");

        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM record_indexes", [])?;
        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM sync_metadata", [])?;

        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();

            if path.extension().and_then(|s| s.to_str()) != Some("jsonl") {
                continue;
            }

            let collection = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| eyre!("Invalid JSONL filename: {:?}", path))?;

            debug!("Syncing collection: {}", collection);

            let stamp = FileStamp::of(&path)?;
            let entries = jsonl::read_jsonl_latest::<serde_json::Value>(&path)?;

            for (id, entry) in entries {
                if jsonl::is_tombstone(&entry) {
                    continue;
                }

                let updated_at = entry.get("updated_at").and_then(|v| v.as_i64()).unwrap_or(0);

                tx.execute(
                    "INSERT OR REPLACE INTO records (collection, id, data_json, updated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![collection, &id, entry.to_string(), updated_at],
                )?;
            }

            Self::record_stamp(&tx, collection, &stamp)?;
        }

        tx.commit()?;

        self.revision += 1;
        broadcast(
            &mut self.subscribers,
            ChangeSet {
                revision: self.revision,
                changes: Vec::new(),
            },
        );

        info!("Sync complete");
        Ok(())
    }

    /// Rebuild indexes for a specific record type
    ///
    /// Records that don't deserialize to `T` are skipped with a warning.
    /// Returns the number of records indexed.
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        let collection = T::collection_name();

        let records_data: Vec<(String, String)> = {
            let mut stmt = self
                .db
                .prepare("SELECT id, data_json FROM records WHERE collection = ?1")?;

            let rows = stmt.query_map([collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let tx = self.db.transaction()?;
        let mut count = 0;

        for (id, data_json) in records_data {
            let record: T = match serde_json::from_str(&data_json) {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        collection = collection,
                        id = &id,
                        error = ?e,
                        "Skipping record that doesn't match type"
                    );
                    continue;
                }
            };

            Self::update_indexes_tx(&tx, collection, &id, &record.indexed_fields())?;
            count += 1;
        }

        tx.commit()?;
        debug!(collection = collection, count = count, "Rebuilt indexes for collection");
        Ok(count)
    }
}

// Dropped receivers unsubscribe themselves
fn broadcast(subscribers: &mut Vec<Sender<ChangeSet>>, change_set: ChangeSet) {
    subscribers.retain(|s| s.send(change_set.clone()).is_ok());
}

struct Staged {
    entry: serde_json::Value,
    change: Change,
}

/// A write transaction handed to the closure of [`Store::write`].
///
/// Reads through the transaction see its own uncommitted writes.
pub struct Transaction<'conn> {
    tx: rusqlite::Transaction<'conn>,
    staged: Vec<Staged>,
}

impl Transaction<'_> {
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        fetch_one(&self.tx, id)
    }

    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>> {
        fetch_many(&self.tx, filters)
    }

    /// Insert or replace a record
    pub fn put<T: Record>(&mut self, record: &T) -> Result<()> {
        let collection = T::collection_name();
        Store::validate_collection_name(collection)?;

        let id = record.id().to_string();
        Store::validate_id(&id)?;

        let entry = serde_json::to_value(record).context("Failed to serialize record")?;

        let existed = self
            .tx
            .query_row(
                "SELECT 1 FROM records WHERE collection = ?1 AND id = ?2",
                rusqlite::params![collection, &id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        self.tx.execute(
            "INSERT OR REPLACE INTO records (collection, id, data_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![collection, &id, entry.to_string(), record.updated_at()],
        )?;

        Store::update_indexes_tx(&self.tx, collection, &id, &record.indexed_fields())?;

        let kind = if existed { ChangeKind::Updated } else { ChangeKind::Created };
        self.staged.push(Staged {
            entry,
            change: Change { collection, id, kind },
        });

        Ok(())
    }

    /// Delete a record; returns false if it did not exist
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool> {
        let collection = T::collection_name();

        self.tx.execute(
            "DELETE FROM record_indexes WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
        )?;
        let removed = self.tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
        )?;

        if removed == 0 {
            return Ok(false);
        }

        let tombstone = serde_json::json!({
            "id": id,
            "deleted": true,
            "updated_at": now_ms(),
        });
        self.staged.push(Staged {
            entry: tombstone,
            change: Change {
                collection,
                id: id.to_string(),
                kind: ChangeKind::Deleted,
            },
        });

        Ok(true)
    }

    /// Delete every record matching the filters. Returns the number deleted.
    pub fn delete_where<T: Record>(&mut self, filters: &[Filter]) -> Result<usize> {
        let records: Vec<T> = self.list(filters)?;

        let mut count = 0;
        for record in records {
            if self.delete::<T>(record.id())? {
                count += 1;
            }
        }

        Ok(count)
    }
}

fn fetch_one<T: Record>(conn: &Connection, id: &str) -> Result<Option<T>> {
    let collection = T::collection_name();

    let json: Option<String> = conn
        .query_row(
            "SELECT data_json FROM records WHERE collection = ?1 AND id = ?2",
            rusqlite::params![collection, id],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => {
            let record: T = serde_json::from_str(&json).context("Failed to deserialize record from database")?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

fn fetch_many<T: Record>(conn: &Connection, filters: &[Filter]) -> Result<Vec<T>> {
    let collection = T::collection_name();

    let mut query = String::from(
        "SELECT r.data_json
         FROM records r
         WHERE r.collection = ?1",
    );

    // ?1 is the collection, then one (field, value) pair per filter
    for (i, filter) in filters.iter().enumerate() {
        Store::validate_field_name(&filter.field)?;

        let alias = format!("idx{}", i);
        let column = match &filter.value {
            IndexValue::String(_) => "field_value_str",
            IndexValue::Int(_) => "field_value_int",
            IndexValue::Bool(_) => "field_value_bool",
        };

        query.push_str(&format!(
            " AND EXISTS (
                SELECT 1 FROM record_indexes {a}
                WHERE {a}.collection = r.collection
                  AND {a}.id = r.id
                  AND {a}.field_name = ?{field}
                  AND {a}.{column} {op} ?{value})",
            a = alias,
            field = 2 + i * 2,
            column = column,
            op = filter.op.to_sql(),
            value = 3 + i * 2,
        ));
    }

    query.push_str(" ORDER BY r.updated_at DESC, r.id");

    let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    params.push(Box::new(collection.to_string()));
    for filter in filters {
        params.push(Box::new(filter.field.clone()));
        params.push(filter.bind_value());
    }
    let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt.query_map(params_refs.as_slice(), |row| row.get::<_, String>(0))?;

    let mut results = Vec::new();
    for row_result in rows {
        let data_json = row_result?;
        let record: T = serde_json::from_str(&data_json).context("Failed to deserialize record")?;
        results.push(record);
    }

    Ok(results)
}

/// Current time in milliseconds since epoch
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
