use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use beacon_core::ids::{TaskId, UserId};
use beacon_core::status::TaskStatus;

use crate::database::Database;
use crate::error::StoreError;

/// A stored task record. Workers own the status transitions; the delivery
/// layer only reads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: TaskId,
    pub owner_id: UserId,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub request: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct TaskRepo {
    db: Database,
}

impl TaskRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new task in `pending` status.
    #[instrument(skip(self, request), fields(owner_id = %owner_id))]
    pub fn create(
        &self,
        owner_id: &UserId,
        request: serde_json::Value,
    ) -> Result<TaskRow, StoreError> {
        let id = TaskId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, owner_id, status, request, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    owner_id.as_str(),
                    serde_json::to_string(&request)?,
                    now,
                    now,
                ],
            )?;

            Ok(TaskRow {
                id,
                owner_id: owner_id.clone(),
                status: TaskStatus::Pending,
                error: None,
                request,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a task by ID.
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn get(&self, id: &TaskId) -> Result<TaskRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, status, error, request, created_at, updated_at
                 FROM tasks WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_task(row),
                None => Err(StoreError::NotFound(format!("task {id}"))),
            }
        })
    }

    /// Update status and error, bump `updated_at`, and return the fresh row.
    #[instrument(skip(self), fields(task_id = %id, status = %status))]
    pub fn update_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<TaskRow, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                rusqlite::params![status.to_string(), error, now, id.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("task {id}")));
            }
            Ok(())
        })?;
        self.get(id)
    }

    /// Delete a task (and its sequence counter, via cascade).
    #[instrument(skip(self), fields(task_id = %id))]
    pub fn delete(&self, id: &TaskId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM tasks WHERE id = ?1", [id.as_str()])?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("task {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> Result<TaskRow, StoreError> {
    let status: String = row.get(2)?;
    let request: String = row.get(4)?;
    Ok(TaskRow {
        id: TaskId::from_raw(row.get::<_, String>(0)?),
        owner_id: UserId::from_raw(row.get::<_, String>(1)?),
        status: status
            .parse()
            .map_err(|e: String| StoreError::Serialization(e))?,
        error: row.get(3)?,
        request: serde_json::from_str(&request)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}
