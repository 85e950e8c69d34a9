use parking_lot::{Condvar, Mutex};

use crate::errors::{VirtualFileError, VirtualFileResult};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolState<T> {
    idle: Vec<T>,
    // Number of items which exist, idle or handed out
    created: usize,
    closed: bool,
}

/// Fixed capacity set of reusable items with blocking acquisition.
///
/// Items are either inserted up front or created lazily by a factory until the capacity is reached.
/// An item is owned by exactly one holder at a time: acquiring moves it out of the pool and
/// releasing moves it back.
pub struct ResourcePool<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
    capacity: usize,
    factory: Option<Factory<T>>,
}

impl<T> ResourcePool<T> {
    /// Pool which is filled with [`ResourcePool::insert`].
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    /// Pool which creates up to `capacity` items on demand.
    pub fn with_factory(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::build(capacity, Some(Box::new(factory)))
    }

    fn build(capacity: usize, factory: Option<Factory<T>>) -> Self {
        ResourcePool {
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(capacity),
                created: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
            factory,
        }
    }

    /// Add a new item to the pool.
    ///
    /// Returns the item back if the pool is full or closed.
    pub fn insert(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed || state.created >= self.capacity {
            return Err(item);
        }
        state.created += 1;
        state.idle.push(item);
        self.available.notify_one();
        Ok(())
    }

    /// Take an item, blocking until one is available.
    ///
    /// Fails with [`VirtualFileError::PoolClosed`] once the pool is closed, including for
    /// callers which are already waiting.
    pub fn acquire(&self) -> VirtualFileResult<T> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(VirtualFileError::PoolClosed);
            }
            if let Some(item) = state.idle.pop() {
                return Ok(item);
            }
            if let Some(factory) = self.factory.as_ref() {
                if state.created < self.capacity {
                    state.created += 1;
                    drop(state);
                    return Ok(factory());
                }
            }
            self.available.wait(&mut state);
        }
    }

    /// Return an item to the pool and wake one waiting acquirer.
    ///
    /// Items released into a closed pool are dropped.
    pub fn release(&self, item: T) {
        let mut state = self.state.lock();
        if state.closed {
            state.created = state.created.saturating_sub(1);
            drop(state);
            drop(item);
            return;
        }
        state.idle.push(item);
        self.available.notify_one();
    }

    /// Reject all further acquisitions, drop idle items and wake every waiter.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            let idle_count = state.idle.len();
            state.created -= idle_count;
            std::mem::take(&mut state.idle)
        };
        self.available.notify_all();
        drop(idle);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items which can be acquired without waiting.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        if state.closed {
            return 0;
        }
        let creatable = if self.factory.is_some() {
            self.capacity - state.created
        } else {
            0
        };
        state.idle.len() + creatable
    }

    /// Number of items currently in existence, idle or handed out.
    pub fn created(&self) -> usize {
        self.state.lock().created
    }

    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }
}
