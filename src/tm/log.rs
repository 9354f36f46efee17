//! Persistent transaction log.
//!
//! Rows are append-only history: every state a transaction passes through
//! is a new row. Writes are batched and only become durable on `persist`;
//! the coordinator releases nothing that depends on a write before that.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use minicbor::{Decoder, Encoder};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::{ResourceId, Trid};
use crate::error::{Effect, Transience};

const LOG_SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path is a symlink: {path:?}")]
    Symlink { path: PathBuf },
    #[error("log schema version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: String },
    #[error("missing meta key: {key}")]
    MetaMissing { key: &'static str },
    #[error("log row decode failed: {0}")]
    RowDecode(String),
    #[error("resource list encode failed: {0}")]
    CborEncode(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("resource list decode failed: {0}")]
    CborDecode(#[from] minicbor::decode::Error),
    #[error("log unavailable: {reason}")]
    Unavailable { reason: String },
}

impl LogError {
    pub fn transience(&self) -> Transience {
        match self {
            LogError::Symlink { .. }
            | LogError::SchemaVersionMismatch { .. }
            | LogError::MetaMissing { .. }
            | LogError::RowDecode(_)
            | LogError::CborEncode(_)
            | LogError::CborDecode(_) => Transience::Permanent,
            LogError::Sqlite(_) | LogError::Io { .. } | LogError::Unavailable { .. } => {
                Transience::Unknown
            }
        }
    }

    /// A failed log write leaves durability of the batch unknown.
    pub fn effect(&self) -> Effect {
        Effect::Unknown
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDurability {
    Cache,
    #[default]
    Durable,
}

impl LogDurability {
    fn synchronous_value(self) -> &'static str {
        match self {
            LogDurability::Cache => "NORMAL",
            LogDurability::Durable => "FULL",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogState {
    Began,
    Prepared,
    Committed,
    RolledBack,
}

impl LogState {
    pub fn as_str(self) -> &'static str {
        match self {
            LogState::Began => "began",
            LogState::Prepared => "prepared",
            LogState::Committed => "committed",
            LogState::RolledBack => "rolledback",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "began" => Some(LogState::Began),
            "prepared" => Some(LogState::Prepared),
            "committed" => Some(LogState::Committed),
            "rolledback" => Some(LogState::RolledBack),
            _ => None,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, LogState::Committed | LogState::RolledBack)
    }
}

/// What is recorded when a transaction begins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BeginMeta {
    pub owner: Option<ResourceId>,
    pub resources: Vec<ResourceId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRow {
    pub trid: Trid,
    pub state: LogState,
    pub timestamp_ms: u64,
    /// Only set on `began` rows.
    pub meta: Option<BeginMeta>,
}

pub trait TransactionLog: Send {
    fn begin(&mut self, trid: &Trid, meta: &BeginMeta) -> Result<(), LogError>;
    fn prepare_commit(&mut self, trid: &Trid) -> Result<(), LogError>;
    fn commit(&mut self, trid: &Trid) -> Result<(), LogError>;
    fn rollback(&mut self, trid: &Trid) -> Result<(), LogError>;
    /// Make every write since the previous call durable.
    fn persist(&mut self) -> Result<(), LogError>;
    /// Rows of one transaction in write order.
    fn select(&self, trid: &Trid) -> Result<Vec<LogRow>, LogError>;
    /// Every row in write order.
    fn select_all(&self) -> Result<Vec<LogRow>, LogError>;
}

impl<L: TransactionLog + ?Sized> TransactionLog for Box<L> {
    fn begin(&mut self, trid: &Trid, meta: &BeginMeta) -> Result<(), LogError> {
        (**self).begin(trid, meta)
    }
    fn prepare_commit(&mut self, trid: &Trid) -> Result<(), LogError> {
        (**self).prepare_commit(trid)
    }
    fn commit(&mut self, trid: &Trid) -> Result<(), LogError> {
        (**self).commit(trid)
    }
    fn rollback(&mut self, trid: &Trid) -> Result<(), LogError> {
        (**self).rollback(trid)
    }
    fn persist(&mut self) -> Result<(), LogError> {
        (**self).persist()
    }
    fn select(&self, trid: &Trid) -> Result<Vec<LogRow>, LogError> {
        (**self).select(trid)
    }
    fn select_all(&self) -> Result<Vec<LogRow>, LogError> {
        (**self).select_all()
    }
}

pub struct SqliteTransactionLog {
    conn: Connection,
    path: PathBuf,
    durability: LogDurability,
    in_batch: bool,
    batched_rows: usize,
}

impl SqliteTransactionLog {
    pub fn open(path: &Path, durability: LogDurability) -> Result<Self, LogError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            reject_symlink(dir)?;
            std::fs::create_dir_all(dir).map_err(|source| LogError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        reject_symlink(path)?;

        let conn = open_connection(path, durability)?;
        if table_exists(&conn, "meta")? {
            validate_meta(&conn)?;
        } else {
            initialize_schema(&conn)?;
        }
        ensure_permissions(path)?;
        tracing::info!(path = %path.display(), ?durability, "opened transaction log");

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            durability,
            in_batch: false,
            batched_rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn durability(&self) -> LogDurability {
        self.durability
    }

    fn append(
        &mut self,
        trid: &Trid,
        state: LogState,
        meta: Option<&BeginMeta>,
    ) -> Result<(), LogError> {
        if !self.in_batch {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_batch = true;
        }
        let (owner, resources) = match meta {
            Some(meta) => (
                meta.owner.map(|o| o.get()),
                Some(encode_resources(&meta.resources)?),
            ),
            None => (None, None),
        };
        self.conn.execute(
            "INSERT INTO trans (global, branch, format, state, owner, resources, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                uuid_blob(trid.global()),
                uuid_blob(trid.branch_id()),
                trid.format(),
                state.as_str(),
                owner,
                resources,
                now_ms() as i64,
            ],
        )?;
        self.batched_rows += 1;
        Ok(())
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<LogRow>, LogError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let global: Vec<u8> = row.get(0)?;
            let branch: Vec<u8> = row.get(1)?;
            let format: i32 = row.get(2)?;
            let state: String = row.get(3)?;
            let owner: Option<i32> = row.get(4)?;
            let resources: Option<Vec<u8>> = row.get(5)?;
            let timestamp_ms: i64 = row.get(6)?;

            let trid = Trid::new(format, blob_uuid(global)?, blob_uuid(branch)?)
                .map_err(|err| LogError::RowDecode(err.to_string()))?;
            let state = LogState::parse(&state)
                .ok_or_else(|| LogError::RowDecode(format!("unknown state `{state}`")))?;
            let meta = match resources {
                Some(blob) => Some(BeginMeta {
                    owner: owner
                        .map(ResourceId::new)
                        .transpose()
                        .map_err(|err| LogError::RowDecode(err.to_string()))?,
                    resources: decode_resources(&blob)?,
                }),
                None => None,
            };
            out.push(LogRow {
                trid,
                state,
                timestamp_ms: u64::try_from(timestamp_ms).unwrap_or(0),
                meta,
            });
        }
        Ok(out)
    }
}

impl TransactionLog for SqliteTransactionLog {
    fn begin(&mut self, trid: &Trid, meta: &BeginMeta) -> Result<(), LogError> {
        self.append(trid, LogState::Began, Some(meta))
    }

    fn prepare_commit(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.append(trid, LogState::Prepared, None)
    }

    fn commit(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.append(trid, LogState::Committed, None)
    }

    fn rollback(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.append(trid, LogState::RolledBack, None)
    }

    fn persist(&mut self) -> Result<(), LogError> {
        if !self.in_batch {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT")?;
        tracing::trace!(rows = self.batched_rows, "persisted transaction log batch");
        self.in_batch = false;
        self.batched_rows = 0;
        Ok(())
    }

    fn select(&self, trid: &Trid) -> Result<Vec<LogRow>, LogError> {
        self.query(
            "SELECT global, branch, format, state, owner, resources, timestamp_ms
             FROM trans WHERE global = ?1 AND branch = ?2 AND format = ?3 ORDER BY id",
            params![
                uuid_blob(trid.global()),
                uuid_blob(trid.branch_id()),
                trid.format()
            ],
        )
    }

    fn select_all(&self) -> Result<Vec<LogRow>, LogError> {
        self.query(
            "SELECT global, branch, format, state, owner, resources, timestamp_ms
             FROM trans ORDER BY id",
            params![],
        )
    }
}

impl Drop for SqliteTransactionLog {
    fn drop(&mut self) {
        if self.in_batch
            && let Err(err) = self.conn.execute_batch("ROLLBACK")
        {
            tracing::warn!(error = %err, "failed to roll back unpersisted log batch");
        }
    }
}

/// In-memory log. Clones share the same rows so a test can keep a handle
/// while the coordinator owns another.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransactionLog {
    inner: Arc<Mutex<MemoryLogInner>>,
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    persisted: Vec<LogRow>,
    staged: Vec<LogRow>,
    fail_writes: Option<String>,
    persist_calls: usize,
}

impl MemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows that survived a `persist`.
    pub fn persisted(&self) -> Vec<LogRow> {
        self.lock().persisted.clone()
    }

    pub fn states(&self, trid: &Trid) -> Vec<LogState> {
        self.lock()
            .persisted
            .iter()
            .filter(|row| row.trid == *trid)
            .map(|row| row.state)
            .collect()
    }

    pub fn persist_calls(&self) -> usize {
        self.lock().persist_calls
    }

    /// Make every following write fail with `reason`.
    pub fn fail_writes(&self, reason: impl Into<String>) {
        self.lock().fail_writes = Some(reason.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLogInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn append(&self, trid: &Trid, state: LogState, meta: Option<&BeginMeta>) -> Result<(), LogError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.fail_writes {
            return Err(LogError::Unavailable {
                reason: reason.clone(),
            });
        }
        inner.staged.push(LogRow {
            trid: *trid,
            state,
            timestamp_ms: now_ms(),
            meta: meta.cloned(),
        });
        Ok(())
    }
}

impl TransactionLog for MemoryTransactionLog {
    fn begin(&mut self, trid: &Trid, meta: &BeginMeta) -> Result<(), LogError> {
        self.append(trid, LogState::Began, Some(meta))
    }

    fn prepare_commit(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.append(trid, LogState::Prepared, None)
    }

    fn commit(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.append(trid, LogState::Committed, None)
    }

    fn rollback(&mut self, trid: &Trid) -> Result<(), LogError> {
        self.append(trid, LogState::RolledBack, None)
    }

    fn persist(&mut self) -> Result<(), LogError> {
        let mut inner = self.lock();
        inner.persist_calls += 1;
        if let Some(reason) = &inner.fail_writes {
            return Err(LogError::Unavailable {
                reason: reason.clone(),
            });
        }
        let staged = std::mem::take(&mut inner.staged);
        inner.persisted.extend(staged);
        Ok(())
    }

    fn select(&self, trid: &Trid) -> Result<Vec<LogRow>, LogError> {
        Ok(self
            .select_all()?
            .into_iter()
            .filter(|row| row.trid == *trid)
            .collect())
    }

    fn select_all(&self) -> Result<Vec<LogRow>, LogError> {
        let inner = self.lock();
        Ok(inner
            .persisted
            .iter()
            .chain(inner.staged.iter())
            .cloned()
            .collect())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn initialize_schema(conn: &Connection) -> Result<(), LogError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS trans (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           global BLOB NOT NULL,
           branch BLOB NOT NULL,
           format INTEGER NOT NULL,
           state TEXT NOT NULL,
           owner INTEGER,
           resources BLOB,
           timestamp_ms INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS trans_by_trid ON trans (global, branch, format);
         CREATE TABLE IF NOT EXISTS meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );",
    )?;
    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('log_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![LOG_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn validate_meta(conn: &Connection) -> Result<(), LogError> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'log_schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let version = version.ok_or(LogError::MetaMissing {
        key: "log_schema_version",
    })?;
    if version != LOG_SCHEMA_VERSION.to_string() {
        return Err(LogError::SchemaVersionMismatch {
            expected: LOG_SCHEMA_VERSION,
            got: version,
        });
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, LogError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_permissions(path: &Path) -> Result<(), LogError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(
            |source| LogError::Io {
                path: path.to_path_buf(),
                source,
            },
        )?;
    }
    Ok(())
}

fn reject_symlink(path: &Path) -> Result<(), LogError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(LogError::Symlink {
            path: path.to_path_buf(),
        }),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LogError::Io {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

fn open_connection(path: &Path, durability: LogDurability) -> Result<Connection, LogError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", durability.synchronous_value())?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

fn uuid_blob(uuid: &Uuid) -> Vec<u8> {
    uuid.as_bytes().to_vec()
}

fn blob_uuid(blob: Vec<u8>) -> Result<Uuid, LogError> {
    let bytes: [u8; 16] = blob
        .try_into()
        .map_err(|_| LogError::RowDecode("uuid blob wrong length".to_string()))?;
    Ok(Uuid::from_bytes(bytes))
}

fn encode_resources(resources: &[ResourceId]) -> Result<Vec<u8>, LogError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.array(resources.len() as u64)?;
    for id in resources {
        enc.i32(id.get())?;
    }
    Ok(buf)
}

fn decode_resources(bytes: &[u8]) -> Result<Vec<ResourceId>, LogError> {
    let mut dec = Decoder::new(bytes);
    let len = dec
        .array()?
        .ok_or_else(|| LogError::RowDecode("indefinite resource list".to_string()))?;
    let mut out = Vec::with_capacity(usize::try_from(len).unwrap_or(0).min(1024));
    for _ in 0..len {
        let raw = dec.i32()?;
        out.push(ResourceId::new(raw).map_err(|err| LogError::RowDecode(err.to_string()))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rid(raw: i32) -> ResourceId {
        ResourceId::new(raw).unwrap()
    }

    fn meta() -> BeginMeta {
        BeginMeta {
            owner: None,
            resources: vec![rid(1), rid(-2)],
        }
    }

    #[test]
    fn sqlite_log_keeps_history_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tm").join("transaction.db");
        let mut log = SqliteTransactionLog::open(&path, LogDurability::Durable).unwrap();

        let t1 = Trid::create();
        let t2 = Trid::create();
        log.begin(&t1, &meta()).unwrap();
        log.begin(&t2, &BeginMeta::default()).unwrap();
        log.prepare_commit(&t1).unwrap();
        log.commit(&t1).unwrap();
        log.persist().unwrap();

        let rows = log.select(&t1).unwrap();
        let states: Vec<_> = rows.iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![LogState::Began, LogState::Prepared, LogState::Committed]
        );
        assert_eq!(rows[0].meta, Some(meta()));
        assert_eq!(rows[1].meta, None);
        assert_eq!(log.select_all().unwrap().len(), 4);
    }

    #[test]
    fn sqlite_log_survives_reopen_only_after_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transaction.db");
        let t1 = Trid::create();
        let t2 = Trid::create();
        {
            let mut log = SqliteTransactionLog::open(&path, LogDurability::Cache).unwrap();
            log.begin(&t1, &meta()).unwrap();
            log.persist().unwrap();
            log.begin(&t2, &meta()).unwrap();
        }
        let log = SqliteTransactionLog::open(&path, LogDurability::Cache).unwrap();
        assert_eq!(log.select(&t1).unwrap().len(), 1);
        assert!(log.select(&t2).unwrap().is_empty());
    }

    #[test]
    fn sqlite_log_rejects_schema_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("transaction.db");
        drop(SqliteTransactionLog::open(&path, LogDurability::Durable).unwrap());
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "UPDATE meta SET value = '999' WHERE key = 'log_schema_version'",
            [],
        )
        .unwrap();
        drop(conn);
        let err = SqliteTransactionLog::open(&path, LogDurability::Durable)
            .err()
            .unwrap();
        assert!(matches!(err, LogError::SchemaVersionMismatch { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn sqlite_log_rejects_symlink() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("real.db");
        std::fs::write(&target, b"").unwrap();
        let link = dir.path().join("link.db");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let err = SqliteTransactionLog::open(&link, LogDurability::Durable)
            .err()
            .unwrap();
        assert!(matches!(err, LogError::Symlink { .. }));
    }

    #[test]
    fn memory_log_stages_until_persist() {
        let mut log = MemoryTransactionLog::new();
        let handle = log.clone();
        let t1 = Trid::create();
        log.begin(&t1, &meta()).unwrap();
        assert!(handle.persisted().is_empty());
        assert_eq!(log.select(&t1).unwrap().len(), 1);
        log.persist().unwrap();
        assert_eq!(handle.states(&t1), vec![LogState::Began]);
    }

    #[test]
    fn memory_log_failure_is_reported() {
        let mut log = MemoryTransactionLog::new();
        log.fail_writes("disk gone");
        let err = log.begin(&Trid::create(), &meta()).unwrap_err();
        assert!(matches!(err, LogError::Unavailable { .. }));
        assert_eq!(err.effect(), Effect::Unknown);
    }
}
