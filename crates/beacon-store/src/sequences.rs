use rusqlite::OptionalExtension;
use tracing::instrument;

use beacon_core::ids::TaskId;

use crate::database::Database;
use crate::error::StoreError;

/// Per-task monotonic sequence counter.
///
/// The increment is a single atomic upsert against the shared store, so
/// concurrent workers in separate processes never observe the same value.
/// Values start at 1 and are never reused for the lifetime of the task.
#[derive(Clone)]
pub struct SequenceRepo {
    db: Database,
}

impl SequenceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Assign the next sequence number for a task. First call returns 1.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn next(&self, task_id: &TaskId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let value: i64 = conn.query_row(
                "INSERT INTO sequences (task_id, value) VALUES (?1, 1)
                 ON CONFLICT(task_id) DO UPDATE SET value = value + 1
                 RETURNING value",
                [task_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(value as u64)
        })
    }

    /// Read the current counter without incrementing. None if the task has
    /// never been sequenced.
    pub fn current(&self, task_id: &TaskId) -> Result<Option<u64>, StoreError> {
        self.db.with_conn(|conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM sequences WHERE task_id = ?1",
                    [task_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.map(|v| v as u64))
        })
    }
}
