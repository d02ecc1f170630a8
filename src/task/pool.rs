//! Free-list of task bookkeeping storage.
//!
//! Every task keeps its children and callbacks in a [`TaskBook`]. When a task
//! finishes with a clean drain its book is cleared and handed back here, so
//! short-lived subtasks (health probes, event subscriptions) reuse the map
//! allocations instead of growing fresh ones.

use super::callback::Callback;
use super::Task;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default number of books kept for reuse
pub const POOL_CAPACITY: usize = 100;

/// Children and callbacks of one task.
#[derive(Default)]
pub(crate) struct TaskBook {
    pub(crate) children: HashMap<u64, Task>,
    pub(crate) callbacks: HashMap<u64, Callback>,
}

impl TaskBook {
    fn clear(&mut self) {
        self.children.clear();
        self.callbacks.clear();
    }
}

/// Bounded pool of recycled task storage, owned by the [`super::Root`].
pub struct TaskPool {
    free: Mutex<Vec<TaskBook>>,
    capacity: usize,
    reused: AtomicUsize,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            reused: AtomicUsize::new(0),
        }
    }

    pub(crate) fn take(&self) -> TaskBook {
        match self.free.lock().pop() {
            Some(book) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                book
            }
            None => TaskBook::default(),
        }
    }

    /// Return a book to the pool. Books beyond capacity are dropped.
    pub(crate) fn put(&self, mut book: TaskBook) {
        book.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(book);
        }
    }

    /// Number of books waiting for reuse
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of tasks that were built from recycled storage
    pub fn reused(&self) -> usize {
        self.reused.load(Ordering::Relaxed)
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(POOL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_from_empty_pool() {
        let pool = TaskPool::new(2);
        let book = pool.take();
        assert!(book.children.is_empty());
        assert_eq!(pool.reused(), 0);
    }

    #[test]
    fn test_put_respects_capacity() {
        let pool = TaskPool::new(2);
        for _ in 0..5 {
            pool.put(TaskBook::default());
        }
        assert_eq!(pool.idle(), 2);

        let _ = pool.take();
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.reused(), 1);
    }
}
