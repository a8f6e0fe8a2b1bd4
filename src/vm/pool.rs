// Strand Object Pool
// Free-list recycling for runtime objects

use serde::Serialize;

/// Counters snapshot of a single pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub hits: usize,
    pub miss: usize,
    pub idle: usize,
    pub busy: usize,
}

/// Free-list recycler.
///
/// Objects come back through `release` already cleaned by the caller.
/// `busy` is never tracked directly, it is inferred as `miss - idle`.
#[derive(Debug)]
pub struct Pool<T> {
    free: Vec<T>,
    hits: usize,
    miss: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            hits: 0,
            miss: 0,
        }
    }

    /// Recycled instance if one is idle, otherwise a fresh one from `make`
    pub fn acquire_with(&mut self, make: impl FnOnce() -> T) -> T {
        match self.free.pop() {
            Some(obj) => {
                self.hits += 1;
                obj
            }
            None => {
                self.miss += 1;
                make()
            }
        }
    }

    /// Push a cleaned object back.
    ///
    /// Panics when more objects come back than were ever created,
    /// which means something was released twice.
    pub fn release(&mut self, obj: T) {
        self.free.push(obj);
        if self.free.len() > self.miss {
            panic!(
                "Unbalanced acquire/release: {} idle objects, {} created",
                self.free.len(),
                self.miss
            );
        }
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn miss(&self) -> usize {
        self.miss
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }

    pub fn busy(&self) -> usize {
        self.miss - self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits,
            miss: self.miss,
            idle: self.idle(),
            busy: self.busy(),
        }
    }

    /// Drop every idle object and reset the counters
    pub fn clear(&mut self) {
        self.free.clear();
        self.hits = 0;
        self.miss = 0;
    }
}

impl<T: Default> Pool<T> {
    pub fn acquire(&mut self) -> T {
        self.acquire_with(T::default)
    }
}
