use std::sync::Arc;

use tracing::instrument;

use beacon_core::errors::DeliveryError;
use beacon_core::frame::StatusBody;
use beacon_core::ids::TaskId;
use beacon_store::tasks::{TaskRepo, TaskRow};
use beacon_store::StoreError;

use crate::cache::LatestStateCache;

/// Builds the reconciliation body sent to a newly attached subscriber:
/// the cached latest broadcast when fresh, otherwise a rebuild from the
/// task store with sequence 0 ("no prior broadcast observed").
pub struct SnapshotBuilder {
    cache: Arc<LatestStateCache>,
    tasks: TaskRepo,
}

impl SnapshotBuilder {
    pub fn new(cache: Arc<LatestStateCache>, tasks: TaskRepo) -> Self {
        Self { cache, tasks }
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn snapshot(&self, task_id: &TaskId) -> Result<StatusBody, DeliveryError> {
        if let Some(cached) = self.cache.get(task_id) {
            tracing::debug!(sequence = cached.sequence, "snapshot from cache");
            return Ok(cached);
        }

        let task = self.read_task(task_id)?;
        tracing::debug!("snapshot rebuilt from store");
        Ok(StatusBody::new(
            task.id.clone(),
            0,
            task.status,
            task.error.clone(),
            &task.request,
            task.created_at.clone(),
            task.updated_at.clone(),
        ))
    }

    /// One retry on storage errors; a missing row is not retried.
    fn read_task(&self, task_id: &TaskId) -> Result<TaskRow, DeliveryError> {
        match self.tasks.get(task_id) {
            Ok(task) => Ok(task),
            Err(StoreError::NotFound(_)) => Err(DeliveryError::NotFound(task_id.clone())),
            Err(first) => {
                tracing::warn!(error = %first, "snapshot store read failed, retrying");
                match self.tasks.get(task_id) {
                    Ok(task) => Ok(task),
                    Err(StoreError::NotFound(_)) => Err(DeliveryError::NotFound(task_id.clone())),
                    Err(second) => Err(DeliveryError::StoreUnavailable(second.to_string())),
                }
            }
        }
    }
}
