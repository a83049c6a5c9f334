//!
//! Thread safe memory pool with a lock-free free list. This avoids doing
//! memory allocations in the hot path.
//!
//! Borrowed elements are accounted for and validated upon freeing.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use crossbeam::queue::ArrayQueue;

struct PoolShared<T: Send> {
    name: String,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    free: ArrayQueue<u32>,
    capacity: u64,
}

// each slot is only ever touched by the owner of the corresponding PoolItem
unsafe impl<T: Send> Send for PoolShared<T> {}
unsafe impl<T: Send> Sync for PoolShared<T> {}

pub struct MemoryPool<T: Send> {
    shared: Arc<PoolShared<T>>,
}

/// An element borrowed from a [`MemoryPool`]; returns to the free list on
/// drop.
pub struct PoolItem<T: Send> {
    shared: Arc<PoolShared<T>>,
    idx: u32,
}

impl<T: Send> MemoryPool<T> {
    /// Create memory pool with given name and size.
    pub fn create(name: &str, size: u64) -> Option<Self> {
        let mut slots = Vec::with_capacity(size as usize);
        for _ in 0 .. size {
            slots.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        let free = ArrayQueue::new(size as usize);
        for i in 0 .. size as u32 {
            free.push(i).expect("free list sized to capacity");
        }

        info!(
            "Memory pool '{}' with {} elements ({} bytes size) successfully created",
            name,
            size,
            std::mem::size_of::<T>()
        );

        Some(Self {
            shared: Arc::new(PoolShared {
                name: String::from(name),
                slots: slots.into_boxed_slice(),
                free,
                capacity: size,
            }),
        })
    }

    /// Get free element from memory pool and initialize it with the target
    /// object. Returns None when the pool is exhausted, which doubles as the
    /// submission back-pressure signal.
    pub fn get(&self, val: T) -> Option<PoolItem<T>> {
        let idx = self.shared.free.pop()?;
        unsafe {
            (*self.shared.slots[idx as usize].get()).as_mut_ptr().write(val);
        }
        Some(PoolItem {
            shared: Arc::clone(&self.shared),
            idx,
        })
    }

    /// number of elements currently on the free list
    pub fn available(&self) -> u64 {
        self.shared.free.len() as u64
    }

    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }
}

impl<T: Send> PoolItem<T> {
    /// Consume the item, returning the contained value to the caller and the
    /// slot to the pool.
    pub fn into_inner(self) -> T {
        let val = unsafe {
            (*self.shared.slots[self.idx as usize].get()).as_ptr().read()
        };
        self.shared
            .free
            .push(self.idx)
            .expect("free list sized to capacity");
        std::mem::forget(self);
        val
    }
}

impl<T: Send> Deref for PoolItem<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*(*self.shared.slots[self.idx as usize].get()).as_ptr() }
    }
}

impl<T: Send> DerefMut for PoolItem<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe {
            &mut *(*self.shared.slots[self.idx as usize].get()).as_mut_ptr()
        }
    }
}

impl<T: Send> Drop for PoolItem<T> {
    fn drop(&mut self) {
        unsafe {
            std::ptr::drop_in_place(
                (*self.shared.slots[self.idx as usize].get()).as_mut_ptr(),
            );
        }
        self.shared
            .free
            .push(self.idx)
            .expect("free list sized to capacity");
    }
}

impl<T: Send> Drop for PoolShared<T> {
    fn drop(&mut self) {
        let available = self.free.len() as u64;
        debug!(
            "Dropping memory pool '{}', elements placement (t/u/f): {}/{}/{}",
            self.name,
            self.capacity,
            self.capacity - available,
            available
        );
        assert_eq!(
            available, self.capacity,
            "memory pool '{}' dropped with elements in use",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryPool;

    #[test]
    fn pool_exhaustion_and_reuse() {
        let pool = MemoryPool::<u64>::create("ut_pool", 2).unwrap();
        let a = pool.get(1).unwrap();
        let b = pool.get(2).unwrap();
        assert!(pool.get(3).is_none());
        assert_eq!(*a + *b, 3);
        drop(a);
        let c = pool.get(4).unwrap();
        assert_eq!(*c, 4);
        assert_eq!(pool.available(), 0);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn into_inner_returns_value() {
        let pool = MemoryPool::<String>::create("ut_pool_str", 1).unwrap();
        let item = pool.get("hello".to_string()).unwrap();
        assert_eq!(item.into_inner(), "hello");
        assert_eq!(pool.available(), 1);
    }
}
