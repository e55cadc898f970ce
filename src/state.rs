use std::sync::Arc;

use crate::queue::consumers::SnapshotSource;
use crate::queue::JobQueue;
use crate::store::KvStore;

/// Shared handler state. Handlers themselves hold no mutable state; all
/// cross-request data lives behind the KV store and queue.
#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KvStore>,
    pub queue: Arc<dyn JobQueue>,
    pub snapshot_source: Arc<dyn SnapshotSource>,
    pub admin_secret: String,
}
