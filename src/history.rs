use std::collections::VecDeque;
use tokio::sync::RwLock;

pub const METRIC_HISTORY_CAPACITY: usize = 1000;
pub const COMMAND_HISTORY_CAPACITY: usize = 100;

// Читатели получают копию, а не ссылку на буфер.
#[derive(Debug)]
pub struct HistoryRing<T> {
    capacity: usize,
    entries: RwLock<VecDeque<T>>,
}

impl<T: Clone> HistoryRing<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn append(&self, entry: T) -> usize {
        let mut guard = self.entries.write().await;
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(entry);
        guard.len()
    }

    pub async fn snapshot(&self) -> Vec<T> {
        let guard = self.entries.read().await;
        guard.iter().cloned().collect()
    }
}
