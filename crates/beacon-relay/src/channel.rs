use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use beacon_core::frame::StatusBody;
use beacon_core::ids::TaskId;

const DEFAULT_TOPIC_CAPACITY: usize = 64;

/// Topic-based pub/sub keyed by task id. Each topic is a tokio broadcast
/// channel; publishing with zero subscribers is not an error. Topic entries
/// are removed when the last subscriber drops.
pub struct StatusChannel {
    topics: DashMap<TaskId, broadcast::Sender<StatusBody>>,
    capacity: usize,
}

impl StatusChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    /// Publish a body on the task's topic. Returns the number of
    /// subscribers that will receive it.
    pub fn publish(&self, task_id: &TaskId, body: StatusBody) -> usize {
        match self.topics.get(task_id) {
            Some(tx) => tx.send(body).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to a task's topic, creating it on first use.
    pub fn subscribe(self: &Arc<Self>, task_id: &TaskId) -> Subscription {
        let rx = self
            .topics
            .entry(task_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription {
            task_id: task_id.clone(),
            rx: Some(rx),
            channel: Arc::clone(self),
        }
    }

    /// Number of live topics (tasks with at least one subscriber).
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn release(&self, task_id: &TaskId) {
        self.topics
            .remove_if(task_id, |_, tx| tx.receiver_count() == 0);
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

/// A live subscription to one task's topic. Dropping it unsubscribes and
/// tears down the topic when no other subscriber remains.
pub struct Subscription {
    task_id: TaskId,
    rx: Option<broadcast::Receiver<StatusBody>>,
    channel: Arc<StatusChannel>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<StatusBody, broadcast::error::RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Drop the receiver before checking the count, otherwise this
        // subscription still counts toward receiver_count.
        self.rx.take();
        self.channel.release(&self.task_id);
    }
}
