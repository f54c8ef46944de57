use chrono::{DateTime, Utc};
use deckpipe_core::resume::{ResumeError, ResumeStore};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const RESUME_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeMarker {
    pub run_id: String,
    pub event_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Last-seen event markers persisted across process restarts, keyed by run.
pub struct SqliteResumeStore {
    conn: Mutex<Connection>,
}

impl SqliteResumeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > RESUME_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: RESUME_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let conn = self.conn()?;
            conn.execute_batch(include_str!("../migrations/0001_resume_markers.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    pub fn marker(&self, run_id: &str) -> Result<Option<ResumeMarker>, StorageError> {
        let row = self
            .conn()?
            .query_row(
                "
                SELECT run_id, event_id, updated_at
                FROM resume_markers
                WHERE run_id = ?1
                ",
                [run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(run_id, event_id, updated_at)| {
            Ok(ResumeMarker {
                run_id,
                event_id,
                updated_at: parse_ts(&updated_at)?,
            })
        })
        .transpose()
    }

    pub fn upsert_marker(
        &self,
        run_id: &str,
        event_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn()?.execute(
            "
            INSERT INTO resume_markers (run_id, event_id, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(run_id) DO UPDATE SET
                event_id=excluded.event_id,
                updated_at=excluded.updated_at
            ",
            params![run_id, event_id, updated_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_marker(&self, run_id: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn()?
            .execute("DELETE FROM resume_markers WHERE run_id = ?1", [run_id])?;
        Ok(changes > 0)
    }

    /// Drops markers not touched since `cutoff`; returns how many went.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut stale = Vec::new();
        {
            let conn = self.conn()?;
            let mut stmt = conn.prepare("SELECT run_id, updated_at FROM resume_markers")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (run_id, updated_at) = row?;
                if parse_ts(&updated_at)? < cutoff {
                    stale.push(run_id);
                }
            }
        }

        let mut removed = 0;
        for run_id in stale {
            if self.delete_marker(&run_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn()?
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }
}

impl ResumeStore for SqliteResumeStore {
    fn load(&self, run_id: &str) -> Result<Option<String>, ResumeError> {
        Ok(self.marker(run_id)?.map(|marker| marker.event_id))
    }

    fn save(&self, run_id: &str, event_id: &str) -> Result<(), ResumeError> {
        Ok(self.upsert_marker(run_id, event_id, Utc::now())?)
    }

    fn clear(&self, run_id: &str) -> Result<(), ResumeError> {
        self.delete_marker(run_id)?;
        Ok(())
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{value}: {err}")))
}
