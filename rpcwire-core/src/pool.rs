//! Bounded object pools.
//!
//! A [`Pool`] keeps a free list of at most `capacity` idle objects. Objects
//! are handed out as [`Pooled`] guards that reset and return the object on
//! drop. Objects that are never returned show up in
//! [`Pool::outstanding`] instead of growing the free list.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

const DEFAULT_POOL_CAPACITY: usize = 64;

/// Initial capacity of pooled byte buffers.
pub const INITIAL_BUFFER_SIZE: usize = 512;

/// Buffers that grew past this size are dropped instead of recycled.
pub const MAX_RECYCLE_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Objects that can be cleared for reuse.
pub trait Reset {
    /// Clear all state. Returns `false` if the object should not be reused.
    fn reset(&mut self) -> bool;
}

impl Reset for BytesMut {
    fn reset(&mut self) -> bool {
        self.clear();
        self.capacity() <= MAX_RECYCLE_BUFFER_SIZE
    }
}

struct Shared<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    outstanding: AtomicUsize,
}

impl<T: Reset> Shared<T> {
    fn put(&self, mut value: T) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if !value.reset() {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.capacity {
            free.push(value);
        }
    }
}

/// A thread-safe pool of reusable objects.
pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Reset> Pool<T> {
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::new()),
                capacity,
                factory: Box::new(factory),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    /// Take an object, creating one if the free list is empty.
    pub fn get(&self) -> Pooled<T> {
        let reused = self
            .shared
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let value = reused.unwrap_or_else(|| (self.shared.factory)());
        self.shared.outstanding.fetch_add(1, Ordering::Relaxed);
        Pooled {
            value: Some(value),
            shared: self.shared.clone(),
        }
    }

    /// Objects handed out and not yet returned or detached.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Relaxed)
    }

    /// Objects waiting in the free list.
    pub fn idle(&self) -> usize {
        self.shared
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.shared.capacity)
            .field("outstanding", &self.shared.outstanding.load(Ordering::Relaxed))
            .finish()
    }
}

/// An object borrowed from a [`Pool`]; returned on drop.
pub struct Pooled<T: Reset> {
    value: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T: Reset> Pooled<T> {
    /// Keep the object for good instead of returning it.
    pub fn detach(mut self) -> T {
        self.shared.outstanding.fetch_sub(1, Ordering::Relaxed);
        match self.value.take() {
            Some(value) => value,
            None => (self.shared.factory)(),
        }
    }
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop or detach"),
        }
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop or detach"),
        }
    }
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.shared.put(value);
        }
    }
}

impl<T: Reset + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.value).finish()
    }
}

/// Pool of byte buffers used for envelopes and message encoding.
pub type BufferPool = Pool<BytesMut>;

impl Default for Pool<BytesMut> {
    fn default() -> Self {
        Pool::new(DEFAULT_POOL_CAPACITY, || {
            BytesMut::with_capacity(INITIAL_BUFFER_SIZE)
        })
    }
}
