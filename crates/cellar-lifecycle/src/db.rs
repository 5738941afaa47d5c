//! SQLite-backed container records.
//!
//! All rusqlite calls run on `spawn_blocking` so the tokio executor never
//! blocks on disk I/O. Snapshot parentage is encoded in the record name, so
//! every "children of X" lookup is a prefix query over `(type, name)`.

use cellar_common::{CellarError, ContainerArgs, ContainerRecord, ContainerType};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS containers (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    name VARCHAR(255) NOT NULL,
    architecture INTEGER NOT NULL DEFAULT 0,
    type INTEGER NOT NULL DEFAULT 0,
    ephemeral INTEGER NOT NULL DEFAULT 0,
    power_state INTEGER NOT NULL DEFAULT 0,
    config TEXT NOT NULL DEFAULT '{}',
    profiles TEXT NOT NULL DEFAULT '[]',
    devices TEXT NOT NULL DEFAULT '{}',
    UNIQUE (name)
);
CREATE INDEX IF NOT EXISTS containers_type_name ON containers (type, name);
";

const RECORD_COLUMNS: &str =
    "id, name, type, config, profiles, devices, ephemeral, architecture, power_state";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt column value: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unknown container type {0}")]
    UnknownType(i64),
    #[error("database connection lock poisoned")]
    Poisoned,
    #[error("database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DbError {
    fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    }
}

impl From<DbError> for CellarError {
    fn from(err: DbError) -> Self {
        if err.is_unique_violation() {
            CellarError::Conflict(err.to_string())
        } else {
            CellarError::Persistence(err.to_string())
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Shared handle to the daemon database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub async fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || Connection::open(path)).await??;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> DbResult<Self> {
        Self::init(Connection::open_in_memory()?).await
    }

    async fn init(conn: Connection) -> DbResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.with_conn(|conn| Ok(conn.execute_batch(SCHEMA)?)).await?;
        Ok(db)
    }

    async fn with_conn<F, T>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| DbError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    /// Runs a statement and returns every row as raw values.
    pub async fn query(&self, sql: &str, args: Vec<Value>) -> DbResult<Vec<Vec<Value>>> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let width = stmt.column_count();
            let rows = stmt
                .query_map(params_from_iter(args), |row| {
                    (0..width).map(|i| row.get::<_, Value>(i)).collect()
                })?
                .collect::<Result<Vec<Vec<Value>>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Executes a statement and returns the number of affected rows.
    pub async fn exec(&self, sql: &str, args: Vec<Value>) -> DbResult<usize> {
        let sql = sql.to_string();
        self.with_conn(move |conn| Ok(conn.execute(&sql, params_from_iter(args))?))
            .await
    }

    pub async fn create_container(&self, name: &str, args: &ContainerArgs) -> DbResult<i64> {
        let name = name.to_string();
        let config = serde_json::to_string(&args.config)?;
        let profiles = serde_json::to_string(&args.profiles)?;
        let devices = serde_json::to_string(&args.devices)?;
        let ctype = args.ctype.as_i64();
        let ephemeral = args.ephemeral;
        let architecture = args.architecture;

        let id = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO containers (name, architecture, type, ephemeral, config, profiles, devices)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![name, architecture, ctype, ephemeral, config, profiles, devices],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        debug!(id, "Inserted container record");
        Ok(id)
    }

    pub async fn container_id(&self, name: &str) -> DbResult<Option<i64>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM containers WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    pub async fn load_container(&self, name: &str) -> DbResult<Option<ContainerRecord>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM containers WHERE name = ?1");
            let raw = conn
                .query_row(&sql, params![name], RawRecord::from_row)
                .optional()?;
            raw.map(RawRecord::decode).transpose()
        })
        .await
    }

    /// Names of snapshot rows whose name starts with `prefix`.
    pub async fn snapshot_names_with_prefix(&self, prefix: &str) -> DbResult<Vec<String>> {
        Ok(self
            .snapshots_with_prefix(prefix)
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    /// `(name, id)` of snapshot rows whose name starts with `prefix`.
    pub async fn snapshots_with_prefix(&self, prefix: &str) -> DbResult<Vec<(String, i64)>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let ctype = ContainerType::Snapshot.as_i64();
            let rows = match prefix_upper_bound(&prefix) {
                Some(upper) => {
                    let mut stmt = conn.prepare(
                        "SELECT name, id FROM containers
                         WHERE type = ?1 AND name >= ?2 AND name < ?3 ORDER BY name",
                    )?;
                    let rows = stmt
                        .query_map(params![ctype, prefix, upper], |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT name, id FROM containers
                         WHERE type = ?1 AND name >= ?2 ORDER BY name",
                    )?;
                    let rows = stmt
                        .query_map(params![ctype, prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                }
            };
            Ok(rows)
        })
        .await
    }

    pub async fn regular_container_names(&self) -> DbResult<Vec<String>> {
        self.names_where("type = ?1", ContainerType::Regular).await
    }

    /// Regular containers flagged to be brought back on daemon start.
    pub async fn power_state_names(&self) -> DbResult<Vec<String>> {
        self.names_where("type = ?1 AND power_state = 1", ContainerType::Regular)
            .await
    }

    async fn names_where(&self, filter: &str, ctype: ContainerType) -> DbResult<Vec<String>> {
        let sql = format!("SELECT name FROM containers WHERE {filter} ORDER BY name");
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names = stmt
                .query_map(params![ctype.as_i64()], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    pub async fn clear_power_state(&self) -> DbResult<usize> {
        self.with_conn(|conn| Ok(conn.execute("UPDATE containers SET power_state = 0", [])?))
            .await
    }

    pub async fn set_power_state(&self, name: &str, on: bool) -> DbResult<usize> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE containers SET power_state = ?1 WHERE name = ?2",
                params![on, name],
            )?)
        })
        .await
    }

    pub async fn rename_container(&self, old: &str, new: &str) -> DbResult<usize> {
        let (old, new) = (old.to_string(), new.to_string());
        self.with_conn(move |conn| {
            Ok(conn.execute(
                "UPDATE containers SET name = ?1 WHERE name = ?2",
                params![new, old],
            )?)
        })
        .await
    }

    pub async fn delete_container(&self, id: i64) -> DbResult<usize> {
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM containers WHERE id = ?1", params![id])?)
        })
        .await
    }

    /// Deletes every id in one transaction.
    pub async fn delete_containers(&self, ids: Vec<i64>) -> DbResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut removed = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM containers WHERE id = ?1")?;
                for id in &ids {
                    removed += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }
}

struct RawRecord {
    id: i64,
    name: String,
    ctype: i64,
    config: String,
    profiles: String,
    devices: String,
    ephemeral: bool,
    architecture: i64,
    power_state: bool,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            ctype: row.get(2)?,
            config: row.get(3)?,
            profiles: row.get(4)?,
            devices: row.get(5)?,
            ephemeral: row.get(6)?,
            architecture: row.get(7)?,
            power_state: row.get(8)?,
        })
    }

    fn decode(self) -> DbResult<ContainerRecord> {
        Ok(ContainerRecord {
            id: self.id,
            ctype: ContainerType::from_i64(self.ctype).ok_or(DbError::UnknownType(self.ctype))?,
            name: self.name,
            config: serde_json::from_str(&self.config)?,
            profiles: serde_json::from_str(&self.profiles)?,
            devices: serde_json::from_str(&self.devices)?,
            ephemeral: self.ephemeral,
            architecture: self.architecture,
            power_state: self.power_state,
        })
    }
}

/// Smallest string greater than every string starting with `prefix`, so
/// `name >= prefix AND name < bound` is an index-friendly prefix match.
/// `None` when no such bound exists (prefix of only `char::MAX`).
pub fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let mut next = last as u32 + 1;
        // Skip the surrogate gap.
        if (0xD800..=0xDFFF).contains(&next) {
            next = 0xE000;
        }
        if let Some(c) = char::from_u32(next) {
            chars.push(c);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_common::snapshot_full_name;

    async fn seeded() -> Database {
        let db = Database::open_in_memory().await.unwrap();
        db.create_container("web", &ContainerArgs::default()).await.unwrap();
        db.create_container("web2", &ContainerArgs::default()).await.unwrap();
        let snap = ContainerArgs {
            ctype: ContainerType::Snapshot,
            ..Default::default()
        };
        for leaf in ["snap0", "snap1"] {
            db.create_container(&snapshot_full_name("web", leaf), &snap)
                .await
                .unwrap();
        }
        db.create_container(&snapshot_full_name("web2", "snap0"), &snap)
            .await
            .unwrap();
        db
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound("web/").as_deref(), Some("web0"));
        assert_eq!(prefix_upper_bound("web/snap").as_deref(), Some("web/snaq"));
        assert_eq!(prefix_upper_bound(""), None);
        let max = char::MAX.to_string();
        assert_eq!(prefix_upper_bound(&format!("a{max}")).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_prefix_query_scopes_to_parent() {
        let db = seeded().await;

        let names = db.snapshot_names_with_prefix("web/").await.unwrap();
        assert_eq!(names, vec!["web/snap0".to_string(), "web/snap1".to_string()]);

        let names = db.snapshot_names_with_prefix("web2/").await.unwrap();
        assert_eq!(names, vec!["web2/snap0".to_string()]);

        // Regular rows never show up in snapshot queries.
        let names = db.snapshot_names_with_prefix("web").await.unwrap();
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn test_load_and_unique_name() {
        let db = seeded().await;
        let record = db.load_container("web/snap1").await.unwrap().unwrap();
        assert_eq!(record.ctype, ContainerType::Snapshot);
        assert_eq!(record.profiles, vec!["default".to_string()]);
        assert!(db.load_container("missing").await.unwrap().is_none());

        let err = db
            .create_container("web", &ContainerArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(CellarError::from(err), CellarError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_power_state_roundtrip() {
        let db = seeded().await;
        assert_eq!(db.set_power_state("web", true).await.unwrap(), 1);
        assert_eq!(db.power_state_names().await.unwrap(), vec!["web".to_string()]);

        db.clear_power_state().await.unwrap();
        assert!(db.power_state_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generic_query_and_bulk_delete() {
        let db = seeded().await;
        let rows = db
            .query(
                "SELECT COUNT(*) FROM containers WHERE type = ?1",
                vec![Value::Integer(ContainerType::Snapshot.as_i64())],
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Integer(3)]]);

        let ids: Vec<i64> = db
            .snapshots_with_prefix("web/")
            .await
            .unwrap()
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        assert_eq!(db.delete_containers(ids).await.unwrap(), 2);
        assert!(db.snapshot_names_with_prefix("web/").await.unwrap().is_empty());

        let changed = db
            .exec(
                "UPDATE containers SET architecture = ?1",
                vec![Value::Integer(4)],
            )
            .await
            .unwrap();
        assert_eq!(changed, 3);
    }
}
