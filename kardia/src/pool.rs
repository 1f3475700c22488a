use crossbeam_queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A reclamation pool for heap objects that are leased and released on
/// different threads. `get` pops the lock-free free list and falls back to a
/// fresh allocation when the list is empty; dropping the returned `PoolBox`
/// runs the release path and pushes the storage back onto the free list.
///
/// The free list is multi-producer/multi-consumer, so a buffer received on a
/// network thread can be released from the tick thread without blocking
/// either side.
pub struct ObjectPool<T> {
    shared: Arc<PoolShared<T>>,
}

struct PoolShared<T> {
    free: SegQueue<Box<T>>,
    allocated: AtomicUsize,
    recycled: AtomicUsize,
}

impl<T: Default> ObjectPool<T> {
    pub fn new() -> ObjectPool<T> {
        ObjectPool {
            shared: Arc::new(PoolShared {
                free: SegQueue::new(),
                allocated: AtomicUsize::new(0),
                recycled: AtomicUsize::new(0),
            }),
        }
    }

    /// Lease an object from the pool. The object retains whatever state the
    /// previous holder left in it; callers initialize the fields they use.
    #[inline]
    pub fn get(&self) -> PoolBox<T> {
        let item = match self.shared.free.pop() {
            Some(item) => {
                self.shared.recycled.fetch_add(1, Ordering::Relaxed);
                item
            }
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                Box::new(T::default())
            }
        };

        PoolBox {
            item: Some(item),
            home: self.shared.clone(),
        }
    }

    /// Number of objects created since the pool was built.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Number of leases served from the free list.
    #[inline]
    pub fn recycled(&self) -> usize {
        self.shared.recycled.load(Ordering::Relaxed)
    }

    /// Objects currently sitting on the free list.
    #[inline]
    pub fn idle(&self) -> usize {
        self.shared.free.len()
    }
}

impl<T> Clone for ObjectPool<T> {
    #[inline]
    fn clone(&self) -> Self {
        ObjectPool {
            shared: self.shared.clone(),
        }
    }
}

/// An owning lease on a pooled object. The lease can move freely across
/// threads; dropping it returns the storage to its pool.
pub struct PoolBox<T> {
    item: Option<Box<T>>,
    home: Arc<PoolShared<T>>,
}

impl<T> Deref for PoolBox<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.item.as_ref().expect("Pooled object already released")
    }
}

impl<T> DerefMut for PoolBox<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("Pooled object already released")
    }
}

impl<T> Drop for PoolBox<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.home.free.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_get_allocates_when_empty() {
        let pool: ObjectPool<u64> = ObjectPool::new();

        let a = pool.get();
        let b = pool.get();

        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.recycled(), 0);
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_release_recycles() {
        let pool: ObjectPool<u64> = ObjectPool::new();

        {
            let mut lease = pool.get();
            *lease = 42;
        }

        // The same storage comes back, state intact.
        let lease = pool.get();
        assert_eq!(*lease, 42);
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.recycled(), 1);
    }

    #[test]
    fn test_cross_thread_release() {
        let pool: ObjectPool<u64> = ObjectPool::new();
        let leases: Vec<_> = (0..16).map(|_| pool.get()).collect();

        let handles: Vec<_> = leases
            .into_iter()
            .map(|lease| thread::spawn(move || drop(lease)))
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.idle(), 16);

        // Everything released is reusable without fresh allocations.
        let _again: Vec<_> = (0..16).map(|_| pool.get()).collect();
        assert_eq!(pool.allocated(), 16);
        assert_eq!(pool.recycled(), 16);
    }
}
