use std::{
    path::Path,
    sync::Arc,
};

use anyhow::Context as _;
use async_trait::async_trait;
use errors::ErrorMetadata;
use metadata::BranchId;
use parking_lot::Mutex;
use rusqlite::{
    params,
    Connection,
    OptionalExtension,
};

use crate::log::LogPersistence;

const JOURNAL_DB_NAME: &str = "journal.sqlite3";

const INIT: &str = r#"
PRAGMA synchronous = FULL;
CREATE TABLE IF NOT EXISTS entries (
    idx INTEGER PRIMARY KEY,
    data BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS journal_globals (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const BRANCH_ID_KEY: &str = "branch_id";

/// Durable log over a single SQLite database inside the journal's directory.
/// Every operation runs as one SQLite transaction, which is what makes the
/// per-operation atomicity and crash-prefix recovery hold.
///
/// SQLite does not allow async calls on a connection, so operations take a
/// short synchronous critical section.
pub struct SqliteLogPersistence {
    inner: Arc<Mutex<Connection>>,
}

impl SqliteLogPersistence {
    /// Open (or create) the log inside `dir`.
    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating journal directory {}", dir.display()))?;
        let connection = Connection::open(dir.join(JOURNAL_DB_NAME))?;
        // Idempotent, so run unconditionally.
        connection.execute_batch(INIT)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(connection)),
        })
    }

    fn window(connection: &Connection) -> anyhow::Result<(Option<u64>, Option<u64>)> {
        let (min, max): (Option<i64>, Option<i64>) = connection.query_row(
            "SELECT MIN(idx), MAX(idx) FROM entries",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((min.map(|v| v as u64), max.map(|v| v as u64)))
    }

    fn read_branch_id(connection: &Connection) -> anyhow::Result<BranchId> {
        let value: Option<String> = connection
            .query_row(
                "SELECT value FROM journal_globals WHERE key = ?1",
                params![BRANCH_ID_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            None => Ok(BranchId::NULL),
            Some(hex_value) => {
                let bytes: [u8; 16] = hex::decode(&hex_value)
                    .context("branch header was not valid hex")?
                    .try_into()
                    .map_err(|b: Vec<u8>| {
                        anyhow::anyhow!("branch header was {} bytes, not 16", b.len())
                    })?;
                Ok(BranchId::from_bytes(bytes))
            },
        }
    }

    fn write_branch_id(connection: &Connection, branch_id: BranchId) -> anyhow::Result<()> {
        connection.execute(
            "INSERT INTO journal_globals (key, value) VALUES (?1, ?2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            params![BRANCH_ID_KEY, hex::encode(branch_id.as_bytes())],
        )?;
        Ok(())
    }

    fn index_not_found(index: u64) -> anyhow::Error {
        anyhow::anyhow!("no live entry at index {index}").context(ErrorMetadata::not_found(
            "LogIndexOutOfRange",
            "the requested index is outside the log's live window",
        ))
    }
}

#[async_trait]
impl LogPersistence for SqliteLogPersistence {
    async fn len(&self) -> anyhow::Result<u64> {
        let connection = self.inner.lock();
        let count: i64 = connection.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    async fn earliest_index(&self) -> anyhow::Result<Option<u64>> {
        let connection = self.inner.lock();
        Ok(Self::window(&connection)?.0)
    }

    async fn latest_index(&self) -> anyhow::Result<Option<u64>> {
        let connection = self.inner.lock();
        Ok(Self::window(&connection)?.1)
    }

    async fn append(&self, data: Vec<u8>) -> anyhow::Result<u64> {
        let connection = self.inner.lock();
        let (_, latest) = Self::window(&connection)?;
        let index = latest.map_or(0, |v| v + 1);
        connection.execute(
            "INSERT INTO entries (idx, data) VALUES (?1, ?2)",
            params![index as i64, data],
        )?;
        Ok(index)
    }

    async fn get(&self, index: u64) -> anyhow::Result<Vec<u8>> {
        let connection = self.inner.lock();
        connection
            .query_row(
                "SELECT data FROM entries WHERE idx = ?1",
                params![index as i64],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Self::index_not_found(index))
    }

    async fn replace(&self, index: u64, data: Vec<u8>) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        let updated = connection.execute(
            "UPDATE entries SET data = ?2 WHERE idx = ?1",
            params![index as i64, data],
        )?;
        if updated != 1 {
            return Err(Self::index_not_found(index));
        }
        Ok(())
    }

    async fn remove_earliest(&self) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        let removed = connection.execute(
            "DELETE FROM entries WHERE idx = (SELECT MIN(idx) FROM entries)",
            [],
        )?;
        anyhow::ensure!(removed == 1, "remove_earliest called on an empty log");
        Ok(())
    }

    async fn clear_all(&self) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute("DELETE FROM entries", [])?;
        Ok(())
    }

    async fn branch_id(&self) -> anyhow::Result<BranchId> {
        let connection = self.inner.lock();
        Self::read_branch_id(&connection)
    }

    async fn set_branch_id(&self, branch_id: BranchId) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        Self::write_branch_id(&connection, branch_id)
    }

    async fn install(&self, entries: Vec<Vec<u8>>, branch_id: BranchId) -> anyhow::Result<()> {
        let mut connection = self.inner.lock();
        let tx = connection.transaction()?;
        tx.execute("DELETE FROM entries", [])?;
        for (index, data) in entries.iter().enumerate() {
            tx.execute(
                "INSERT INTO entries (idx, data) VALUES (?1, ?2)",
                params![index as i64, data],
            )?;
        }
        Self::write_branch_id(&tx, branch_id)?;
        tx.commit()?;
        Ok(())
    }
}
