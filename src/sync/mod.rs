//! Client-side data synchronization layer.
//!
//! Everything the console needs to keep remote state correct on a flaky
//! link: a TTL cache with pluggable persistence, connectivity tracking, a
//! fetch coordinator with retry/backoff/dedupe/sequencing, three polling
//! strategies, and a push-transport bridge that merges server events into
//! held resources. Services are constructed and injected explicitly; there
//! are no ambient singletons.

mod cache;
mod connection;
mod polling;
mod realtime;
mod resource;
mod store;
mod task;

pub use cache::CacheStore;
pub use connection::{ConnectionMonitor, TransportBinding};
pub use polling::{AutoPoller, ControlledPoller, SmartErrorHook, SmartPoller, SmartPollerOptions};
pub use realtime::{
  ChannelTransport, EventHandler, MergeOutcome, PushEvent, PushTransport, RealtimeBridge,
  SharedTransport, Subscription, TransportLease, TransportStatus,
};
pub use resource::{Fetcher, Resource, ResourceOptions, Snapshot, Status, Transform};
pub use store::{MemoryStore, PersistentStore, SqliteStore};
pub use task::{BoxTaskFuture, CancelToken, ScheduledTask};
