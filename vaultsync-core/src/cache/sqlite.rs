//! SQLite-backed cache store.

use crate::cache::{CacheError, CacheStore, CacheWrite, LocalItemStore, StoredMutation, SyncMetadataStore};
use crate::models::{ItemId, ItemState, Share, ShareId, SymmetricallyEncryptedItem, SyncCursor};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

type Result<T> = std::result::Result<T, CacheError>;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Cache store on a single SQLite connection.
///
/// Statements run on the blocking pool; every call holds the connection
/// lock for its whole duration, so multi-row writes are atomic.
#[derive(Clone)]
pub struct SqliteItemStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteItemStore {
    /// Open a cache database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create a new in-memory cache for testing
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| CacheError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
    }
}

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cache_metadata (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS shares (
            share_id TEXT PRIMARY KEY,
            data TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS items (
            share_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            key_rotation INTEGER NOT NULL,
            state TEXT NOT NULL,
            modify_time INTEGER NOT NULL,
            last_use_time INTEGER,
            pending INTEGER NOT NULL DEFAULT 0,
            encrypted_revision TEXT NOT NULL,
            PRIMARY KEY (share_id, item_id)
        );
        CREATE INDEX IF NOT EXISTS idx_items_share_state ON items(share_id, state);
        CREATE TABLE IF NOT EXISTS sync_cursors (
            share_id TEXT PRIMARY KEY,
            data TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS pending_mutations (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            share_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            base_revision INTEGER NOT NULL,
            payload TEXT NOT NULL,
            conflicted INTEGER NOT NULL DEFAULT 0,
            queued_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pending_share ON pending_mutations(share_id, seq);",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO cache_metadata (id, version) VALUES (1, ?1)",
        params![CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<SymmetricallyEncryptedItem> {
    let state: String = row.get(4)?;
    let state = ItemState::parse(&state).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, "state".to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(SymmetricallyEncryptedItem {
        share_id: ShareId(row.get(0)?),
        item_id: ItemId(row.get(1)?),
        revision: row.get(2)?,
        key_rotation: row.get(3)?,
        state,
        modify_time: row.get(5)?,
        last_use_time: row.get(6)?,
        pending: row.get::<_, i64>(7)? != 0,
        encrypted_revision: row.get(8)?,
    })
}

fn row_to_mutation(row: &Row<'_>) -> rusqlite::Result<StoredMutation> {
    Ok(StoredMutation {
        seq: row.get(0)?,
        share_id: ShareId(row.get(1)?),
        item_id: ItemId(row.get(2)?),
        base_revision: row.get(3)?,
        payload: row.get(4)?,
        conflicted: row.get::<_, i64>(5)? != 0,
        queued_at: row.get(6)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| CacheError::Serialization(e.to_string()))
}

fn upsert_items(conn: &Connection, items: &[SymmetricallyEncryptedItem]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO items (share_id, item_id, revision, key_rotation, state,
            modify_time, last_use_time, pending, encrypted_revision)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(share_id, item_id) DO UPDATE SET
            revision = excluded.revision,
            key_rotation = excluded.key_rotation,
            state = excluded.state,
            modify_time = excluded.modify_time,
            last_use_time = excluded.last_use_time,
            pending = excluded.pending,
            encrypted_revision = excluded.encrypted_revision",
    )?;
    for item in items {
        stmt.execute(params![
            item.share_id.0,
            item.item_id.0,
            item.revision,
            item.key_rotation,
            item.state.as_str(),
            item.modify_time,
            item.last_use_time,
            item.pending,
            item.encrypted_revision,
        ])?;
    }
    Ok(())
}

fn delete_items(conn: &Connection, share_id: &ShareId, item_ids: &[ItemId]) -> Result<()> {
    let mut stmt = conn.prepare_cached("DELETE FROM items WHERE share_id = ?1 AND item_id = ?2")?;
    for item_id in item_ids {
        stmt.execute(params![share_id.0, item_id.0])?;
    }
    Ok(())
}

fn insert_mutation(conn: &Connection, mutation: &StoredMutation) -> Result<i64> {
    conn.prepare_cached(
        "INSERT INTO pending_mutations
            (share_id, item_id, base_revision, payload, conflicted, queued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        mutation.share_id.0,
        mutation.item_id.0,
        mutation.base_revision,
        mutation.payload,
        mutation.conflicted,
        mutation.queued_at,
    ])?;
    Ok(conn.last_insert_rowid())
}

fn update_mutation_row(conn: &Connection, mutation: &StoredMutation) -> Result<()> {
    conn.prepare_cached(
        "UPDATE pending_mutations
         SET base_revision = ?2, payload = ?3, conflicted = ?4
         WHERE seq = ?1",
    )?
    .execute(params![
        mutation.seq,
        mutation.base_revision,
        mutation.payload,
        mutation.conflicted,
    ])?;
    Ok(())
}

fn delete_mutations(conn: &Connection, seqs: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare_cached("DELETE FROM pending_mutations WHERE seq = ?1")?;
    for seq in seqs {
        stmt.execute(params![seq])?;
    }
    Ok(())
}

const ITEM_COLUMNS: &str = "share_id, item_id, revision, key_rotation, state, modify_time, \
                            last_use_time, pending, encrypted_revision";

#[async_trait]
impl LocalItemStore for SqliteItemStore {
    async fn get(&self, share_id: &ShareId, item_id: &ItemId) -> Result<Option<SymmetricallyEncryptedItem>> {
        let share_id = share_id.0.clone();
        let item_id = item_id.0.clone();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM items WHERE share_id = ?1 AND item_id = ?2",
                ITEM_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![share_id, item_id], row_to_item)
                .optional()?)
        })
        .await
    }

    async fn upsert(&self, items: &[SymmetricallyEncryptedItem]) -> Result<()> {
        let items = items.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            upsert_items(&tx, &items)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, share_id: &ShareId, item_ids: &[ItemId]) -> Result<()> {
        let share_id = share_id.clone();
        let item_ids = item_ids.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            delete_items(&tx, &share_id, &item_ids)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn query(
        &self,
        share_id: Option<&ShareId>,
        state: Option<ItemState>,
    ) -> Result<Vec<SymmetricallyEncryptedItem>> {
        let share_id = share_id.map(|s| s.0.clone());
        let state = state.map(|s| s.as_str());
        self.run(move |conn| {
            let sql = format!(
                "SELECT {} FROM items
                 WHERE (?1 IS NULL OR share_id = ?1) AND (?2 IS NULL OR state = ?2)
                 ORDER BY share_id, modify_time DESC, item_id",
                ITEM_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![share_id, state], row_to_item)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn delete_share(&self, share_id: &ShareId) -> Result<()> {
        let share_id = share_id.0.clone();
        self.run(move |conn| {
            conn.execute("DELETE FROM items WHERE share_id = ?1", params![share_id])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SyncMetadataStore for SqliteItemStore {
    async fn list_shares(&self) -> Result<Vec<Share>> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT data FROM shares ORDER BY share_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut shares = Vec::new();
            for data in rows {
                shares.push(from_json(&data?)?);
            }
            Ok(shares)
        })
        .await
    }

    async fn upsert_share(&self, share: &Share) -> Result<()> {
        let share_id = share.share_id.0.clone();
        let data = to_json(share)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO shares (share_id, data) VALUES (?1, ?2)
                 ON CONFLICT(share_id) DO UPDATE SET data = excluded.data",
                params![share_id, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_share_metadata(&self, share_id: &ShareId) -> Result<()> {
        let share_id = share_id.0.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM shares WHERE share_id = ?1", params![share_id])?;
            tx.execute("DELETE FROM sync_cursors WHERE share_id = ?1", params![share_id])?;
            tx.execute("DELETE FROM pending_mutations WHERE share_id = ?1", params![share_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_cursor(&self, share_id: &ShareId) -> Result<Option<SyncCursor>> {
        let share_id = share_id.0.clone();
        self.run(move |conn| {
            let data: Option<String> = conn
                .query_row(
                    "SELECT data FROM sync_cursors WHERE share_id = ?1",
                    params![share_id],
                    |row| row.get(0),
                )
                .optional()?;
            data.map(|d| from_json(&d)).transpose()
        })
        .await
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let share_id = cursor.share_id.0.clone();
        let data = to_json(cursor)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sync_cursors (share_id, data) VALUES (?1, ?2)
                 ON CONFLICT(share_id) DO UPDATE SET data = excluded.data",
                params![share_id, data],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_cursors(&self) -> Result<()> {
        self.run(|conn| {
            conn.execute("DELETE FROM sync_cursors", [])?;
            Ok(())
        })
        .await
    }

    async fn enqueue_mutation(&self, mutation: &StoredMutation) -> Result<i64> {
        let mutation = mutation.clone();
        self.run(move |conn| insert_mutation(conn, &mutation)).await
    }

    async fn queued_mutations(&self, share_id: &ShareId) -> Result<Vec<StoredMutation>> {
        let share_id = share_id.0.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, share_id, item_id, base_revision, payload, conflicted, queued_at
                 FROM pending_mutations WHERE share_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![share_id], row_to_mutation)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_mutation(&self, mutation: &StoredMutation) -> Result<()> {
        let mutation = mutation.clone();
        self.run(move |conn| update_mutation_row(conn, &mutation)).await
    }

    async fn remove_mutations(&self, seqs: &[i64]) -> Result<()> {
        let seqs = seqs.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            delete_mutations(&tx, &seqs)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn clear_all(&self) -> Result<()> {
        self.run(|conn| {
            conn.execute_batch(
                "DELETE FROM items;
                 DELETE FROM shares;
                 DELETE FROM sync_cursors;
                 DELETE FROM pending_mutations;",
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CacheStore for SqliteItemStore {
    async fn commit(&self, write: CacheWrite) -> Result<Vec<i64>> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            delete_mutations(&tx, &write.complete)?;
            for mutation in &write.update {
                update_mutation_row(&tx, mutation)?;
            }
            let mut seqs = Vec::with_capacity(write.enqueue.len());
            for mutation in &write.enqueue {
                seqs.push(insert_mutation(&tx, mutation)?);
            }
            upsert_items(&tx, &write.upsert)?;
            delete_items(&tx, &write.share_id, &write.delete)?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE items SET pending = 0 WHERE share_id = ?1 AND item_id = ?2",
                )?;
                for item_id in &write.clear_pending {
                    stmt.execute(params![write.share_id.0, item_id.0])?;
                }
            }
            tx.commit()?;
            Ok(seqs)
        })
        .await
    }
}
