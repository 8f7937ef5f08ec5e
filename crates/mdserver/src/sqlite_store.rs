use std::{
    path::Path,
    sync::Arc,
};

use anyhow::Context as _;
use async_trait::async_trait;
use metadata::{
    BranchId,
    MetadataRevision,
    TlfId,
};
use parking_lot::Mutex;
use rusqlite::{
    params,
    Connection,
    OptionalExtension,
};

use crate::store::ServerStore;

const SERVER_DB_NAME: &str = "mdserver.sqlite3";

const INIT: &str = r#"
PRAGMA synchronous = FULL;
CREATE TABLE IF NOT EXISTS handles (
    handle BLOB PRIMARY KEY,
    tlf_id BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS revisions (
    tlf_id BLOB NOT NULL,
    branch_id BLOB NOT NULL,
    revision INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (tlf_id, branch_id, revision)
);
"#;

/// Server store over a single SQLite database in a directory. Used by the
/// on-disk test server and small single-node deployments.
pub struct SqliteServerStore {
    inner: Arc<Mutex<Connection>>,
}

impl SqliteServerStore {
    pub fn new(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating server directory {}", dir.display()))?;
        let connection = Connection::open(dir.join(SERVER_DB_NAME))?;
        connection.execute_batch(INIT)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(connection)),
        })
    }
}

#[async_trait]
impl ServerStore for SqliteServerStore {
    async fn handle_mapping(&self, handle_bytes: &[u8]) -> anyhow::Result<Option<TlfId>> {
        let connection = self.inner.lock();
        let id: Option<Vec<u8>> = connection
            .query_row(
                "SELECT tlf_id FROM handles WHERE handle = ?1",
                params![handle_bytes],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|bytes| {
            let bytes: [u8; 16] = bytes
                .try_into()
                .map_err(|b: Vec<u8>| anyhow::anyhow!("stored folder id was {} bytes", b.len()))?;
            TlfId::from_bytes(bytes)
        })
        .transpose()
    }

    async fn record_handle(&self, handle_bytes: Vec<u8>, id: TlfId) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "INSERT INTO handles (handle, tlf_id) VALUES (?1, ?2) \
             ON CONFLICT (handle) DO UPDATE SET tlf_id = excluded.tlf_id",
            params![handle_bytes, id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    async fn head(&self, id: TlfId, branch_id: BranchId) -> anyhow::Result<Option<Vec<u8>>> {
        let connection = self.inner.lock();
        Ok(connection
            .query_row(
                "SELECT data FROM revisions WHERE tlf_id = ?1 AND branch_id = ?2 \
                 ORDER BY revision DESC LIMIT 1",
                params![id.as_bytes().as_slice(), branch_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?)
    }

    async fn append(
        &self,
        id: TlfId,
        branch_id: BranchId,
        revision: MetadataRevision,
        data: Vec<u8>,
    ) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection
            .execute(
                "INSERT INTO revisions (tlf_id, branch_id, revision, data) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.as_bytes().as_slice(),
                    branch_id.as_bytes().as_slice(),
                    u64::from(revision) as i64,
                    data
                ],
            )
            .with_context(|| {
                format!("branch {branch_id} of {id} already has revision {revision}")
            })?;
        Ok(())
    }

    async fn range(
        &self,
        id: TlfId,
        branch_id: BranchId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        let connection = self.inner.lock();
        let mut stmt = connection.prepare(
            "SELECT data FROM revisions WHERE tlf_id = ?1 AND branch_id = ?2 \
             AND revision >= ?3 AND revision <= ?4 ORDER BY revision ASC",
        )?;
        let rows = stmt.query_map(
            params![
                id.as_bytes().as_slice(),
                branch_id.as_bytes().as_slice(),
                u64::from(start) as i64,
                u64::from(stop) as i64
            ],
            |row| row.get(0),
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    async fn prune(&self, id: TlfId, branch_id: BranchId) -> anyhow::Result<()> {
        let connection = self.inner.lock();
        connection.execute(
            "DELETE FROM revisions WHERE tlf_id = ?1 AND branch_id = ?2",
            params![id.as_bytes().as_slice(), branch_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }
}
