use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use beacon_core::errors::DeliveryError;
use beacon_core::frame::StatusBody;
use beacon_store::sequences::SequenceRepo;
use beacon_store::tasks::TaskRow;

use crate::cache::LatestStateCache;
use crate::channel::StatusChannel;

/// Publishes a sequenced status body for a task: assigns the next sequence,
/// writes the latest-state cache, and fans out on the task's topic.
///
/// Cache write and topic publish are separate, non-atomic operations; both
/// are best-effort notifications layered over the durable task mutation,
/// which is never rolled back on broadcast failure.
pub struct Broadcaster {
    sequences: SequenceRepo,
    cache: Arc<LatestStateCache>,
    channel: Arc<StatusChannel>,
    cache_ttl: Duration,
}

impl Broadcaster {
    pub fn new(
        sequences: SequenceRepo,
        cache: Arc<LatestStateCache>,
        channel: Arc<StatusChannel>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            sequences,
            cache,
            channel,
            cache_ttl,
        }
    }

    /// Broadcast the task's current state. Called after the mutation is
    /// durably committed. No frame is published without a valid sequence.
    #[instrument(skip(self, task), fields(task_id = %task.id, status = %task.status))]
    pub fn publish(&self, task: &TaskRow) -> Result<StatusBody, DeliveryError> {
        let sequence = self
            .sequences
            .next(&task.id)
            .map_err(|e| DeliveryError::StoreUnavailable(e.to_string()))?;

        let body = StatusBody::new(
            task.id.clone(),
            sequence,
            task.status,
            task.error.clone(),
            &task.request,
            task.created_at.clone(),
            task.updated_at.clone(),
        );

        self.cache.put(body.clone(), self.cache_ttl);
        let delivered = self.channel.publish(&task.id, body.clone());

        tracing::debug!(
            sequence = sequence,
            terminal = body.terminal,
            subscribers = delivered,
            "status broadcast"
        );

        Ok(body)
    }
}
