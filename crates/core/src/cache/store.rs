//! Journal-backed on-disk blob store.
//!
//! A single SQLite file in WAL mode holds one blob per disk key. Writes go
//! through an [`Editor`]: at most one editor may be pending per key, and its
//! bytes only become visible once [`Editor::commit`] returns. Commits trim the
//! least recently read entries until the store fits its byte budget; an entry
//! larger than the whole budget is refused instead.

use super::hash::DiskKey;
use super::migrations;
use crate::Error;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_rusqlite::{Connection, params, rusqlite};

/// File name of the journal inside the store directory.
pub const JOURNAL_FILE: &str = "journal.sqlite";

const PRAGMAS: &str = "PRAGMA journal_mode=WAL;
     PRAGMA synchronous=NORMAL;
     PRAGMA temp_store=MEMORY;";

/// Handle to an open journal store.
///
/// Clones share the same connection; closing one closes all of them.
#[derive(Clone, Debug)]
pub struct JournalStore {
    conn: Connection,
    dir: PathBuf,
    max_bytes: u64,
    pending: Arc<Mutex<HashSet<String>>>,
    closed: Arc<AtomicBool>,
}

/// Committed bytes of one entry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    key: DiskKey,
    bytes: Vec<u8>,
}

impl Snapshot {
    pub fn key(&self) -> &DiskKey {
        &self.key
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl JournalStore {
    /// Open (or create) the store in `dir`.
    ///
    /// Entries written under a different `version` are discarded.
    pub async fn open(dir: impl AsRef<Path>, version: u32, max_bytes: u64) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let conn = Connection::open(dir.join(JOURNAL_FILE)).await.map_err(|e| Error::Database(e.into()))?;

        conn.call(|conn| conn.execute_batch(PRAGMAS)).await.map_err(Error::Database)?;

        migrations::run(&conn).await?;

        let discarded = conn
            .call(move |conn| -> Result<usize, Error> {
                let tx = conn.transaction()?;
                let stored: Option<String> = match tx.query_row(
                    "SELECT value FROM store_meta WHERE key = 'version'",
                    [],
                    |row| row.get(0),
                ) {
                    Ok(v) => Some(v),
                    Err(rusqlite::Error::QueryReturnedNoRows) => None,
                    Err(e) => return Err(e.into()),
                };

                let mut discarded = 0;
                if stored.as_deref() != Some(version.to_string().as_str()) {
                    discarded = tx.execute("DELETE FROM entries", [])?;
                    tx.execute(
                        "INSERT INTO store_meta (key, value) VALUES ('version', ?1)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![version.to_string()],
                    )?;
                }
                tx.commit()?;
                Ok(discarded)
            })
            .await
            .map_err(Error::from)?;

        if discarded > 0 {
            tracing::info!(dir = %dir.display(), discarded, version, "Discarded entries from older store version");
        }

        Ok(Self {
            conn,
            dir,
            max_bytes,
            pending: Arc::new(Mutex::new(HashSet::new())),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() { Err(Error::StoreClosed) } else { Ok(()) }
    }

    /// Read the committed bytes for `key`, marking the entry as recently used.
    pub async fn get(&self, key: &DiskKey) -> Result<Option<Snapshot>, Error> {
        self.ensure_open()?;
        let disk_key = key.as_str().to_string();
        let bytes = self
            .conn
            .call(move |conn| -> Result<Option<Vec<u8>>, Error> {
                let tx = conn.transaction()?;
                let result = tx.query_row("SELECT payload FROM entries WHERE disk_key = ?1", params![disk_key], |row| {
                    row.get::<_, Vec<u8>>(0)
                });

                let bytes = match result {
                    Ok(b) => b,
                    Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };

                tx.execute(
                    "UPDATE entries SET accessed_seq = (SELECT COALESCE(MAX(accessed_seq), 0) + 1 FROM entries)
                     WHERE disk_key = ?1",
                    params![disk_key],
                )?;
                tx.commit()?;
                Ok(Some(bytes))
            })
            .await
            .map_err(Error::from)?;

        Ok(bytes.map(|bytes| Snapshot { key: key.clone(), bytes }))
    }

    /// Whether a committed entry exists for `key`. Does not affect recency.
    pub async fn contains(&self, key: &DiskKey) -> Result<bool, Error> {
        self.ensure_open()?;
        let disk_key = key.as_str().to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let exists =
                    conn.query_row("SELECT EXISTS(SELECT 1 FROM entries WHERE disk_key = ?1)", params![disk_key], |row| {
                        row.get(0)
                    })?;
                Ok(exists)
            })
            .await
            .map_err(Error::from)
    }

    /// Start writing `key`.
    ///
    /// Returns `None` if another editor for the same key is still pending.
    pub fn edit(&self, key: &DiskKey) -> Result<Option<Editor>, Error> {
        self.ensure_open()?;
        if !self.pending.lock().insert(key.as_str().to_string()) {
            return Ok(None);
        }
        Ok(Some(Editor { store: self.clone(), key: key.clone(), buf: Vec::new() }))
    }

    /// Total payload bytes currently stored.
    pub async fn size_bytes(&self) -> Result<u64, Error> {
        self.ensure_open()?;
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let size: i64 = conn.query_row("SELECT COALESCE(SUM(size), 0) FROM entries", [], |row| row.get(0))?;
                Ok(size as u64)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn entry_count(&self) -> Result<u64, Error> {
        self.ensure_open()?;
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Checkpoint the write-ahead log into the main database file.
    pub async fn flush(&self) -> Result<(), Error> {
        self.ensure_open()?;
        self.conn
            .call(|conn| conn.execute_batch("PRAGMA wal_checkpoint(FULL);"))
            .await
            .map_err(Error::from)
    }

    /// Close the store. Later operations on any clone fail with `StoreClosed`.
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.conn.clone().close().await {
            Ok(()) | Err(tokio_rusqlite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Close the store and delete its files.
    pub async fn destroy(&self) -> Result<(), Error> {
        self.close().await?;
        for suffix in ["", "-wal", "-shm"] {
            let path = self.dir.join(format!("{JOURNAL_FILE}{suffix}"));
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Pending write of one entry.
///
/// Dropping an editor without committing aborts the write.
#[derive(Debug)]
pub struct Editor {
    store: JournalStore,
    key: DiskKey,
    buf: Vec<u8>,
}

impl Editor {
    pub fn key(&self) -> &DiskKey {
        &self.key
    }

    /// Bytes written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Publish the written bytes, replacing any previous entry for the key.
    ///
    /// Fails with [`Error::EntryTooLarge`] when the bytes alone exceed the
    /// store budget; nothing is written or trimmed in that case. The trim
    /// never removes the entry being committed.
    pub async fn commit(mut self) -> Result<(), Error> {
        self.store.ensure_open()?;
        if self.buf.len() as u64 > self.store.max_bytes {
            return Err(Error::EntryTooLarge { size: self.buf.len() as u64, budget: self.store.max_bytes });
        }
        let payload = std::mem::take(&mut self.buf);
        let disk_key = self.key.as_str().to_string();
        let trim_key = disk_key.clone();
        let max_bytes = i64::try_from(self.store.max_bytes).unwrap_or(i64::MAX);

        let trimmed = self
            .store
            .conn
            .call(move |conn| -> Result<usize, Error> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO entries (disk_key, payload, size, created_at, accessed_seq)
                     VALUES (?1, ?2, ?3, ?4, (SELECT COALESCE(MAX(accessed_seq), 0) + 1 FROM entries))
                     ON CONFLICT(disk_key) DO UPDATE SET
                        payload = excluded.payload,
                        size = excluded.size,
                        created_at = excluded.created_at,
                        accessed_seq = excluded.accessed_seq",
                    params![disk_key, payload, payload.len() as i64, chrono::Utc::now().to_rfc3339()],
                )?;
                let trimmed = tx.execute(
                    "DELETE FROM entries WHERE disk_key IN (
                        SELECT disk_key FROM (
                            SELECT disk_key, SUM(size) OVER (ORDER BY accessed_seq DESC) AS running
                            FROM entries
                        ) WHERE running > ?1
                    ) AND disk_key != ?2",
                    params![max_bytes, trim_key],
                )?;
                tx.commit()?;
                Ok(trimmed)
            })
            .await
            .map_err(Error::from)?;

        if trimmed > 0 {
            tracing::debug!(dir = %self.store.dir.display(), trimmed, "Trimmed store to budget");
        }
        Ok(())
    }

    /// Discard the written bytes.
    pub fn abort(self) {
        drop(self);
    }
}

impl Write for Editor {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        self.store.pending.lock().remove(self.key.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp(max_bytes: u64) -> (tempfile::TempDir, JournalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path(), 1, max_bytes).await.unwrap();
        (dir, store)
    }

    async fn put(store: &JournalStore, key: &DiskKey, bytes: &[u8]) {
        let mut editor = store.edit(key).unwrap().unwrap();
        editor.write_all(bytes).unwrap();
        editor.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_then_get() {
        let (_dir, store) = open_temp(1024).await;
        let key = DiskKey::derive("a");

        assert!(store.get(&key).await.unwrap().is_none());
        put(&store, &key, b"hello").await;

        let snapshot = store.get(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.bytes(), b"hello");
        assert!(store.contains(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_uncommitted_edit_is_invisible() {
        let (_dir, store) = open_temp(1024).await;
        let key = DiskKey::derive("a");

        let mut editor = store.edit(&key).unwrap().unwrap();
        editor.write_all(b"partial").unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        editor.abort();

        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_edit_while_pending() {
        let (_dir, store) = open_temp(1024).await;
        let key = DiskKey::derive("a");

        let first = store.edit(&key).unwrap();
        assert!(first.is_some());
        assert!(store.edit(&key).unwrap().is_none());

        drop(first);
        assert!(store.edit(&key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_trim_evicts_least_recently_read() {
        let (_dir, store) = open_temp(10).await;
        let a = DiskKey::derive("a");
        let b = DiskKey::derive("b");
        let c = DiskKey::derive("c");

        put(&store, &a, b"aaaa").await;
        put(&store, &b, b"bbbb").await;
        // reading `a` makes `b` the oldest
        store.get(&a).await.unwrap();
        put(&store, &c, b"cccc").await;

        assert!(store.get(&a).await.unwrap().is_some());
        assert!(store.get(&b).await.unwrap().is_none());
        assert!(store.get(&c).await.unwrap().is_some());
        assert!(store.size_bytes().await.unwrap() <= 10);
    }

    #[tokio::test]
    async fn test_oversized_commit_is_refused_and_keeps_store() {
        let (_dir, store) = open_temp(10).await;
        let a = DiskKey::derive("a");
        let big = DiskKey::derive("big");
        put(&store, &a, b"aaaa").await;

        let mut editor = store.edit(&big).unwrap().unwrap();
        editor.write_all(&[7u8; 20]).unwrap();
        let err = editor.commit().await.unwrap_err();
        assert!(matches!(err, Error::EntryTooLarge { size: 20, budget: 10 }));

        assert!(store.get(&big).await.unwrap().is_none());
        assert_eq!(store.get(&a).await.unwrap().unwrap().bytes(), b"aaaa");
        assert_eq!(store.entry_count().await.unwrap(), 1);
        // the pending slot was released
        assert!(store.edit(&big).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_commit_at_budget_keeps_new_entry() {
        let (_dir, store) = open_temp(10).await;
        let a = DiskKey::derive("a");
        let full = DiskKey::derive("full");
        put(&store, &a, b"aaaa").await;
        put(&store, &full, &[1u8; 10]).await;

        assert!(store.get(&a).await.unwrap().is_none());
        assert_eq!(store.get(&full).await.unwrap().unwrap().bytes().len(), 10);
    }

    #[tokio::test]
    async fn test_reopen_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let key = DiskKey::derive("a");
        {
            let store = JournalStore::open(dir.path(), 1, 1024).await.unwrap();
            put(&store, &key, b"persisted").await;
            store.close().await.unwrap();
        }

        let store = JournalStore::open(dir.path(), 1, 1024).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().unwrap().bytes(), b"persisted");
    }

    #[tokio::test]
    async fn test_version_change_discards_entries() {
        let dir = tempfile::tempdir().unwrap();
        let key = DiskKey::derive("a");
        {
            let store = JournalStore::open(dir.path(), 1, 1024).await.unwrap();
            put(&store, &key, b"old").await;
            store.close().await.unwrap();
        }

        let store = JournalStore::open(dir.path(), 2, 1024).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let (_dir, store) = open_temp(1024).await;
        let key = DiskKey::derive("a");
        store.close().await.unwrap();

        assert!(store.is_closed());
        assert!(matches!(store.get(&key).await, Err(Error::StoreClosed)));
        assert!(matches!(store.edit(&key), Err(Error::StoreClosed)));
        // closing twice is fine
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_removes_journal() {
        let (dir, store) = open_temp(1024).await;
        put(&store, &DiskKey::derive("a"), b"x").await;
        store.destroy().await.unwrap();

        assert!(!dir.path().join(JOURNAL_FILE).exists());
        let reopened = JournalStore::open(dir.path(), 1, 1024).await.unwrap();
        assert_eq!(reopened.entry_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_flush() {
        let (_dir, store) = open_temp(1024).await;
        put(&store, &DiskKey::derive("a"), b"x").await;
        store.flush().await.unwrap();
    }
}
