//! Reusable row-set buffers.
//!
//! Each pipeline owns one pool; a buffer leaves the pool when a batch is
//! built and returns when the batch's completion is processed, whatever the
//! outcome. The pool retains a bounded number of buffers so sustained load
//! does not allocate per batch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ballast_client_core::{RowSet, TableSchema};

pub struct BufferPool {
    schema: Arc<TableSchema>,
    free: Mutex<Vec<RowSet>>,
    retain: usize,
    live: AtomicUsize,
    total_allocated: AtomicUsize,
}

impl BufferPool {
    pub fn new(schema: Arc<TableSchema>, retain: usize) -> Self {
        Self {
            schema,
            free: Mutex::new(Vec::new()),
            retain,
            live: AtomicUsize::new(0),
            total_allocated: AtomicUsize::new(0),
        }
    }

    pub fn acquire(&self) -> RowSet {
        if let Some(buffer) = self.free.lock().expect("buffer pool poisoned").pop() {
            return buffer;
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
        RowSet::new(self.schema.clone())
    }

    pub fn release(&self, mut buffer: RowSet) {
        buffer.clear();
        let mut free = self.free.lock().expect("buffer pool poisoned");
        if free.len() < self.retain {
            free.push(buffer);
        } else {
            drop(free);
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Buffers currently alive: pooled plus checked out.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Buffers ever allocated, reuse excluded.
    pub fn total_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_client_core::{ColumnType, Value};

    fn pool(retain: usize) -> BufferPool {
        let schema = Arc::new(TableSchema::new(
            "t",
            vec![("id", ColumnType::BigInt)],
            None,
        ));
        BufferPool::new(schema, retain)
    }

    #[test]
    fn acquire_reuses_released_buffers() {
        let pool = pool(2);
        let mut a = pool.acquire();
        a.push_row(vec![Value::BigInt(1)]);
        pool.release(a);

        let b = pool.acquire();
        assert!(b.is_empty());
        assert_eq!(pool.total_allocated(), 1);
    }

    #[test]
    fn retention_limit_bounds_live_buffers() {
        let pool = pool(1);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(pool.live(), 3);

        pool.release(a);
        pool.release(b);
        pool.release(c);
        // One retained, two dropped.
        assert_eq!(pool.live(), 1);

        let _again = pool.acquire();
        assert_eq!(pool.total_allocated(), 3);
    }
}
