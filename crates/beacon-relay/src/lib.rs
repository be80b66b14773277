pub mod broadcaster;
pub mod cache;
pub mod channel;
pub mod snapshot;

pub use broadcaster::Broadcaster;
pub use cache::LatestStateCache;
pub use channel::{StatusChannel, Subscription};
pub use snapshot::SnapshotBuilder;
