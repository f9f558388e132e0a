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

//! The two [`MemoryPool`] implementations the operators run against: an
//! unlimited pool for unconstrained execution, and a fixed-budget pool whose
//! `try_grow` failures are what drive the spilling machinery in tests and in
//! memory-constrained deployments.

use crate::memory_pool::{
    human_readable_size, MemoryLimit, MemoryPool, MemoryReservation,
};
use granite_common::{resources_granite_err, QueryError, Result};
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The error handed back when a reservation cannot be satisfied. Names the
/// consumer so the operator that must spill is identifiable from the message
/// alone.
fn pool_exhausted(
    reservation: &MemoryReservation,
    requested: usize,
    available: usize,
) -> QueryError {
    resources_granite_err!(
        "memory pool exhausted: {} requested {} on top of its current {} reservation, but the pool has only {} left",
        reservation.consumer().name(),
        human_readable_size(requested),
        human_readable_size(reservation.size()),
        human_readable_size(available)
    )
}

/// A [`MemoryPool`] with no limit. Usage is still counted so that size
/// estimates (e.g. whether a spilled partition fits) stay meaningful.
#[derive(Debug, Default)]
pub struct UnboundedMemoryPool {
    used: AtomicUsize,
}

impl MemoryPool for UnboundedMemoryPool {
    fn grow(&self, _reservation: &MemoryReservation, additional: usize) {
        self.used.fetch_add(additional, Ordering::Relaxed);
    }

    fn shrink(&self, _reservation: &MemoryReservation, shrink: usize) {
        self.used.fetch_sub(shrink, Ordering::Relaxed);
    }

    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()> {
        // Nothing to check; only the count moves.
        self.grow(reservation, additional);
        Ok(())
    }

    fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn memory_limit(&self) -> MemoryLimit {
        MemoryLimit::Infinite
    }
}

/// A [`MemoryPool`] with a fixed byte budget, handed out first-come
/// first-served. Once the budget is reached every further `try_grow` fails
/// until some reservation shrinks; a spillable operator reacts by spilling a
/// partition and retrying.
#[derive(Debug)]
pub struct GreedyMemoryPool {
    budget: usize,
    used: AtomicUsize,
}

impl GreedyMemoryPool {
    pub fn new(budget: usize) -> Self {
        debug!("greedy memory pool created with a {budget} byte budget");
        Self {
            budget,
            used: AtomicUsize::new(0),
        }
    }
}

impl MemoryPool for GreedyMemoryPool {
    fn grow(&self, _reservation: &MemoryReservation, additional: usize) {
        self.used.fetch_add(additional, Ordering::Relaxed);
    }

    fn shrink(&self, _reservation: &MemoryReservation, shrink: usize) {
        self.used.fetch_sub(shrink, Ordering::Relaxed);
    }

    fn try_grow(&self, reservation: &MemoryReservation, additional: usize) -> Result<()> {
        // Claim the bytes with a retry loop: concurrent shrinks may free
        // room between the load and the exchange, and concurrent grows may
        // take it away.
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if additional > self.budget.saturating_sub(used) {
                return Err(pool_exhausted(
                    reservation,
                    additional,
                    self.budget.saturating_sub(used),
                ));
            }
            match self.used.compare_exchange_weak(
                used,
                used + additional,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => used = current,
            }
        }
    }

    fn reserved(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn memory_limit(&self) -> MemoryLimit {
        MemoryLimit::Finite(self.budget)
    }
}
