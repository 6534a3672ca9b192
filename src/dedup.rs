//! Event identity deduplication.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Set of already-admitted event ids, shared by every connection task
/// serving one logical query.
#[derive(Clone, Default)]
pub struct Deduper {
    seen: Arc<Mutex<HashSet<String>>>,
}

impl Deduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time an id is offered, `false` for every
    /// redelivery, regardless of which relay the event came from.
    pub async fn admit(&self, id: &str) -> bool {
        self.seen.lock().await.insert(id.to_string())
    }
}
