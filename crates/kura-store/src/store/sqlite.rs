//! SQLite-backed block store.
//!
//! One connection behind a mutex; each mutation is a single transaction so a
//! crash never leaves a snapshot without its batch. Patch lists are stored as
//! postcard blobs.

use std::path::Path;

use async_trait::async_trait;
use kura_types::{
    Batch, BatchDraft, Block, BlockId, KeyedMutex, Patch, SharedClock, Snapshot, system_clock,
};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::{Advance, BlockStore, OldestSet, StoreStats, expected_create_seq};
use crate::{Result, StoreError};

const SCHEMA: &str = r#"
-- Current snapshot per block
CREATE TABLE IF NOT EXISTS blocks (
    id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    uts INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    snapshot_ts INTEGER NOT NULL,
    snapshot BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blocks_uts ON blocks(uts);

-- History base, raised by compaction
CREATE TABLE IF NOT EXISTS starts (
    id TEXT PRIMARY KEY REFERENCES blocks(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    blob BLOB NOT NULL
);

-- Retained batches (append-only until compacted)
CREATE TABLE IF NOT EXISTS batches (
    id TEXT NOT NULL REFERENCES blocks(id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    ts INTEGER NOT NULL,
    cts INTEGER,
    patches BLOB NOT NULL,
    PRIMARY KEY (id, seq)
);
"#;

/// Block store persisted in a SQLite database.
pub struct SqliteBlockStore {
    conn: Mutex<Connection>,
    locks: KeyedMutex<BlockId>,
    clock: SharedClock,
}

impl SqliteBlockStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::debug!(mode = %mode, "opened block database");
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            locks: KeyedMutex::new(),
            clock: system_clock(),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    // =========================================================================
    // Row helpers
    // =========================================================================

    fn load_block(conn: &Connection, id: &BlockId) -> Result<Option<Block>> {
        let row = conn
            .query_row(
                "SELECT ts, uts, seq, snapshot_ts, snapshot FROM blocks WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(ts, uts, seq, snapshot_ts, blob)| Block {
            id: id.clone(),
            ts: ts as u64,
            uts: uts as u64,
            snapshot: Snapshot::new(id.clone(), seq, snapshot_ts as u64, blob),
            tip: Vec::new(),
        }))
    }

    fn load_start(conn: &Connection, id: &BlockId) -> Result<Option<Snapshot>> {
        let row = conn
            .query_row(
                "SELECT seq, ts, blob FROM starts WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(seq, ts, blob)| Snapshot::new(id.clone(), seq, ts as u64, blob)))
    }

    fn load_batches(conn: &Connection, id: &BlockId, min: i64, max: i64) -> Result<Vec<Batch>> {
        let mut stmt = conn.prepare(
            "SELECT seq, ts, cts, patches FROM batches
             WHERE id = ?1 AND seq >= ?2 AND seq <= ?3 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id.as_str(), min, max], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut batches = Vec::new();
        for row in rows {
            let (seq, ts, cts, patches) = row?;
            let patches: Vec<Patch> = postcard::from_bytes(&patches)?;
            batches.push(Batch {
                seq: seq as u64,
                ts: ts as u64,
                cts: cts.map(|c| c as u64),
                patches,
            });
        }
        Ok(batches)
    }

    fn insert_batch(conn: &Connection, id: &BlockId, batch: &Batch) -> Result<()> {
        conn.execute(
            "INSERT INTO batches (id, seq, ts, cts, patches) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.as_str(),
                batch.seq as i64,
                batch.ts as i64,
                batch.cts.map(|c| c as i64),
                postcard::to_stdvec(&batch.patches)?,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl BlockStore for SqliteBlockStore {
    async fn create(
        &self,
        start: Snapshot,
        end: Snapshot,
        batch: Option<BatchDraft>,
    ) -> Result<(Block, Option<Batch>)> {
        let id = end.id.clone();
        let expected = expected_create_seq(batch.is_some());
        if end.seq != expected || start.seq != -1 {
            return Err(StoreError::PatchSeqInv { id, expected, got: end.seq });
        }

        let _guard = self.locks.lock(&id).await;
        let now = self.clock.now_ms();
        let batch = batch.map(|b| b.commit(0, now));

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO blocks (id, ts, uts, seq, snapshot_ts, snapshot)
             VALUES (?1, ?2, ?2, ?3, ?2, ?4)",
            params![id.as_str(), now as i64, end.seq, end.blob],
        )?;
        if inserted == 0 {
            return Err(StoreError::Exists(id));
        }
        tx.execute(
            "INSERT INTO starts (id, seq, ts, blob) VALUES (?1, ?2, ?3, ?4)",
            params![id.as_str(), start.seq, now as i64, start.blob],
        )?;
        if let Some(b) = &batch {
            Self::insert_batch(&tx, &id, b)?;
        }
        tx.commit()?;

        let mut snapshot = end;
        snapshot.ts = now;
        let block = Block { id, ts: now, uts: now, snapshot, tip: Vec::new() };
        Ok((block, batch))
    }

    async fn push(&self, snapshot: Snapshot, batch: BatchDraft) -> Result<(Snapshot, Batch)> {
        let id = snapshot.id.clone();
        let _guard = self.locks.lock(&id).await;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let current: i64 = tx
            .query_row(
                "SELECT seq FROM blocks WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let expected = current + 1;
        if snapshot.seq != expected {
            return Err(StoreError::PatchSeqInv { id, expected, got: snapshot.seq });
        }
        let recorded: Option<i64> = tx.query_row(
            "SELECT MAX(seq) FROM batches WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        let recorded = match recorded {
            Some(seq) => seq,
            None => {
                tx.query_row(
                    "SELECT seq FROM starts WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )?
            }
        };
        if recorded + 1 != expected {
            return Err(StoreError::CorruptBlock {
                id,
                reason: format!("history ends at seq {recorded}, snapshot expects {expected}"),
            });
        }

        let now = self.clock.now_ms();
        let batch = batch.commit(snapshot.seq as u64, now);
        tx.execute(
            "UPDATE blocks SET uts = ?2, seq = ?3, snapshot_ts = ?2, snapshot = ?4 WHERE id = ?1",
            params![id.as_str(), now as i64, snapshot.seq, snapshot.blob],
        )?;
        Self::insert_batch(&tx, &id, &batch)?;
        tx.commit()?;

        let mut snapshot = snapshot;
        snapshot.ts = now;
        Ok((snapshot, batch))
    }

    async fn get(&self, id: &BlockId) -> Result<Option<Block>> {
        let conn = self.conn.lock();
        Self::load_block(&conn, id)
    }

    async fn get_snapshot(&self, id: &BlockId, seq: i64) -> Result<(Snapshot, Vec<Batch>)> {
        let conn = self.conn.lock();
        let start = Self::load_start(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let batches = Self::load_batches(&conn, id, start.seq + 1, seq)?;
        Ok((start, batches))
    }

    async fn scan(&self, id: &BlockId, min: u64, max: u64) -> Result<Vec<Batch>> {
        if min > max {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        Self::load_batches(&conn, id, min as i64, max.min(i64::MAX as u64) as i64)
    }

    async fn exists(&self, id: &BlockId) -> Result<bool> {
        Ok(self.seq(id).await?.is_some())
    }

    async fn seq(&self, id: &BlockId) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT seq FROM blocks WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn remove(&self, id: &BlockId) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM blocks WHERE id = ?1", params![id.as_str()])?;
        Ok(n > 0)
    }

    async fn remove_oldest(&self, x: usize) -> Result<Vec<BlockId>> {
        let candidates = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT uts, id FROM blocks")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
            let mut oldest = OldestSet::new(x);
            for row in rows {
                oldest.offer(row?);
            }
            oldest.into_sorted_vec()
        };

        let mut removed = Vec::with_capacity(candidates.len());
        for (uts, raw) in candidates {
            let id = match BlockId::new(raw.clone()) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(id = %raw, uts, error = %e, "skipping unreadable block id");
                    continue;
                }
            };
            match self.remove(&id).await {
                Ok(true) => removed.push(id),
                Ok(false) => {}
                Err(e) => tracing::warn!(id = %id, uts, error = %e, "eviction skipped block"),
            }
        }
        Ok(removed)
    }

    async fn compact(&self, id: &BlockId, to: u64, advance: Advance<'_>) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let (start, batches) = {
            let conn = self.conn.lock();
            let block = Self::load_block(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let start = Self::load_start(&conn, id)?.ok_or_else(|| StoreError::CorruptBlock {
                id: id.clone(),
                reason: "missing history base".into(),
            })?;
            if to as i64 <= start.seq {
                return Ok(());
            }
            if to as i64 > block.snapshot.seq {
                return Err(StoreError::validation(format!(
                    "cannot compact {id} to {to}, head is at {}",
                    block.snapshot.seq
                )));
            }
            let batches = Self::load_batches(&conn, id, start.seq + 1, to as i64)?;
            (start, batches)
        };

        let lo = (start.seq + 1) as u64;
        if batches.len() as u64 != to + 1 - lo {
            return Err(StoreError::CorruptBlock {
                id: id.clone(),
                reason: format!("history gap between seq {lo} and {to}"),
            });
        }

        // fold without holding the connection
        let blob = advance(start.blob, &mut batches.iter())?;

        let now = self.clock.now_ms();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE starts SET seq = ?2, ts = ?3, blob = ?4 WHERE id = ?1",
            params![id.as_str(), to as i64, now as i64, blob],
        )?;
        tx.execute(
            "DELETE FROM batches WHERE id = ?1 AND seq <= ?2",
            params![id.as_str(), to as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let blocks: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        let batches: i64 = conn.query_row("SELECT COUNT(*) FROM batches", [], |row| row.get(0))?;
        Ok(StoreStats { blocks: blocks as usize, batches: batches as usize })
    }
}
