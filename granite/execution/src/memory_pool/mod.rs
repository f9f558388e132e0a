// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! [`MemoryPool`] tracks and limits the memory used by spillable operators.
//!
//! The aggregation and join operators buffer state proportional to their
//! input (tuple-stream blocks, hash table buckets, aggregate intermediates).
//! Every growth path must acquire its bytes from the pool *before*
//! allocating, and every release path must give them back; an operator that
//! cannot acquire more memory either spills a partition and retries or
//! surfaces a memory-limit error. Small per-batch scratch (the expression
//! values cache, batch vectors) is intentionally untracked.
//!
//! Clients register a named [`MemoryConsumer`] and hold the returned
//! [`MemoryReservation`]; dropping a reservation returns its bytes to the
//! pool.

use granite_common::{internal_err, Result};
use std::{cmp::Ordering, sync::Arc};

mod pool;
pub use pool::*;

/// The pool's configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLimit {
    Finite(usize),
    Infinite,
}

/// Tracks and potentially limits memory use across operators.
pub trait MemoryPool: Send + Sync + std::fmt::Debug {
    /// Registers a new [`MemoryConsumer`].
    fn register(&self, _consumer: &MemoryConsumer) {}

    /// Records the destruction of the last [`MemoryReservation`] of a
    /// [`MemoryConsumer`].
    fn unregister(&self, _consumer: &MemoryConsumer) {}

    /// Infallibly grow the provided `reservation` by `additional` bytes.
    fn grow(&self, reservation: &MemoryReservation, additional: usize);

    /// Infallibly shrink the provided `reservation` by `shrink` bytes.
    fn shrink(&self, reservation: &MemoryReservation, shrink: usize);

    /// Attempt to grow the provided `reservation` by `additional` bytes.
    /// On error the reservation is unchanged.
    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()>;

    /// Total bytes currently reserved across all consumers.
    fn reserved(&self) -> usize;

    /// The configured capacity of this pool.
    fn memory_limit(&self) -> MemoryLimit;
}

/// A named consumer of pool memory, e.g. one operator's tuple streams or one
/// partition's hash table.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct MemoryConsumer {
    name: String,
    can_spill: bool,
}

impl MemoryConsumer {
    /// Create a new empty [`MemoryConsumer`] that can be grown via a
    /// [`MemoryReservation`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            can_spill: false,
        }
    }

    /// Set whether this consumer can free its memory by spilling to disk.
    pub fn with_can_spill(self, can_spill: bool) -> Self {
        Self { can_spill, ..self }
    }

    pub fn can_spill(&self) -> bool {
        self.can_spill
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers this consumer with `pool`, returning an empty reservation.
    pub fn register(self, pool: &Arc<dyn MemoryPool>) -> MemoryReservation {
        pool.register(&self);
        MemoryReservation {
            registration: Arc::new(SharedRegistration {
                pool: Arc::clone(pool),
                consumer: self,
            }),
            size: 0,
        }
    }
}

/// A registration of a [`MemoryConsumer`] with a [`MemoryPool`]; unregisters
/// on drop.
#[derive(Debug)]
struct SharedRegistration {
    pool: Arc<dyn MemoryPool>,
    consumer: MemoryConsumer,
}

impl Drop for SharedRegistration {
    fn drop(&mut self) {
        self.pool.unregister(&self.consumer);
    }
}

/// An individual reservation of bytes in a [`MemoryPool`], freed back to the
/// pool on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    registration: Arc<SharedRegistration>,
    size: usize,
}

impl MemoryReservation {
    /// Size of this reservation in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn consumer(&self) -> &MemoryConsumer {
        &self.registration.consumer
    }

    /// Frees all bytes back to the pool, returning the number freed.
    pub fn free(&mut self) -> usize {
        let size = self.size;
        if size != 0 {
            self.shrink(size)
        }
        size
    }

    /// Frees `capacity` bytes from this reservation.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`Self::size`].
    pub fn shrink(&mut self, capacity: usize) {
        let new_size = self.size.checked_sub(capacity).unwrap();
        self.registration.pool.shrink(self, capacity);
        self.size = new_size
    }

    /// Fallible [`Self::shrink`], returning the new reservation size.
    pub fn try_shrink(&mut self, capacity: usize) -> Result<usize> {
        if let Some(new_size) = self.size.checked_sub(capacity) {
            self.registration.pool.shrink(self, capacity);
            self.size = new_size;
            Ok(new_size)
        } else {
            internal_err!(
                "cannot free {capacity} bytes out of a {} byte reservation",
                self.size
            )
        }
    }

    /// Sets the reservation to `capacity` bytes, growing infallibly.
    pub fn resize(&mut self, capacity: usize) {
        match capacity.cmp(&self.size) {
            Ordering::Greater => self.grow(capacity - self.size),
            Ordering::Less => self.shrink(self.size - capacity),
            _ => {}
        }
    }

    /// Sets the reservation to `capacity` bytes if the pool allows it.
    pub fn try_resize(&mut self, capacity: usize) -> Result<()> {
        match capacity.cmp(&self.size) {
            Ordering::Greater => self.try_grow(capacity - self.size)?,
            Ordering::Less => self.shrink(self.size - capacity),
            _ => {}
        };
        Ok(())
    }

    /// Increase the reservation by `capacity` bytes unconditionally.
    pub fn grow(&mut self, capacity: usize) {
        self.registration.pool.grow(self, capacity);
        self.size += capacity;
    }

    /// Try to increase the reservation by `capacity` bytes, erroring if the
    /// pool is out of capacity.
    pub fn try_grow(&mut self, capacity: usize) -> Result<()> {
        self.registration.pool.try_grow(self, capacity)?;
        self.size += capacity;
        Ok(())
    }

    /// Returns a new empty reservation against the same consumer.
    pub fn new_empty(&self) -> Self {
        Self {
            size: 0,
            registration: Arc::clone(&self.registration),
        }
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}

pub mod units {
    pub const GB: usize = 1 << 30;
    pub const MB: usize = 1 << 20;
    pub const KB: usize = 1 << 10;
}

/// Present a size in human readable form.
pub fn human_readable_size(size: usize) -> String {
    use units::*;

    let (value, unit) = {
        if size >= 2 * GB {
            (size as f64 / GB as f64, "GB")
        } else if size >= 2 * MB {
            (size as f64 / MB as f64, "MB")
        } else if size >= 2 * KB {
            (size as f64 / KB as f64, "KB")
        } else {
            (size as f64, "B")
        }
    };
    format!("{value:.1} {unit}")
}
