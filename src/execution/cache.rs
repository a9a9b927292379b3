//! Bounded duplicate-submission cache.
//!
//! Maps client order ids to the last fill seen for them through out-of-band
//! channels (the venue's own fill stream). The execution gateway consults it
//! between retries to detect orders that filled despite a request-level error;
//! the stream manager's fill callback inserts into it. Both paths run
//! concurrently, hence the interior lock.

use crate::exchange::FillRecord;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// FIFO-bounded `clientOrderId -> FillRecord` map.
///
/// Insertion order is tracked separately from the map so the oldest entry is
/// evicted first once `limit` is exceeded. A limit of zero disables caching
/// entirely (duplicate-order protection off).
#[derive(Debug)]
pub struct DupeCache {
    limit: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    map: HashMap<String, FillRecord>,
    order: VecDeque<String>,
}

impl DupeCache {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record a fill for a client order id, evicting the oldest entry when the
    /// bound is exceeded. Re-inserting an existing key updates the fill
    /// without affecting its eviction position.
    pub fn insert(&self, client_order_id: &str, fill: FillRecord) {
        if self.limit == 0 {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner
            .map
            .insert(client_order_id.to_string(), fill)
            .is_none()
        {
            inner.order.push_back(client_order_id.to_string());
        }

        while inner.map.len() > self.limit {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn get(&self, client_order_id: &str) -> Option<FillRecord> {
        self.inner.lock().unwrap().map.get(client_order_id).cloned()
    }

    /// Remove and return the entry, if present.
    pub fn remove(&self, client_order_id: &str) -> Option<FillRecord> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.map.remove(client_order_id);
        if removed.is_some() {
            inner.order.retain(|k| k != client_order_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
