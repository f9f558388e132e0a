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

//! Operator metrics. Counters are cheap shared atomics; cloning a metric
//! clones a handle onto the same underlying value.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

/// A counter recording things such as the number of spilled partitions.
#[derive(Debug, Clone, Default)]
pub struct Count {
    value: Arc<AtomicUsize>,
}

impl Count {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}

/// A metric that records the most recent and the high-water value.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, n: usize) {
        self.value.store(n, Ordering::Relaxed);
        self.max.fetch_max(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }
}

/// Measures a potentially non-contiguous duration of time, in nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct Time {
    nanos: Arc<AtomicUsize>,
}

impl Time {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_elapsed(&self, start: Instant) {
        self.add_duration(start.elapsed());
    }

    pub fn add_duration(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as usize, Ordering::Relaxed);
    }

    /// A guard that adds the time between its creation and drop (or an
    /// explicit [`ScopedTimerGuard::stop`]) to this metric.
    pub fn timer(&self) -> ScopedTimerGuard<'_> {
        ScopedTimerGuard {
            inner: self,
            start: Some(Instant::now()),
        }
    }

    pub fn value(&self) -> usize {
        self.nanos.load(Ordering::Relaxed)
    }
}

/// RAII guard for [`Time::timer`].
pub struct ScopedTimerGuard<'a> {
    inner: &'a Time,
    start: Option<Instant>,
}

impl ScopedTimerGuard<'_> {
    pub fn stop(&mut self) {
        if let Some(start) = self.start.take() {
            self.inner.add_elapsed(start)
        }
    }

    pub fn done(mut self) {
        self.stop()
    }
}

impl Drop for ScopedTimerGuard<'_> {
    fn drop(&mut self) {
        self.stop()
    }
}

/// Statistics maintained by every hash table instance.
#[derive(Debug, Clone, Default)]
pub struct HashTableStats {
    /// Number of probe sequences started.
    pub probes: Count,
    /// Probe sequences that ended without finding a match or an empty bucket.
    pub failed_probes: Count,
    /// Total steps taken across all probe sequences.
    pub travel_length: Count,
    /// Distinct keys whose hashes mapped to an occupied initial bucket with
    /// a different key.
    pub hash_collisions: Count,
    /// Number of bucket-array resizes.
    pub resizes: Count,
}

/// Metrics for the partitioned aggregation operator.
#[derive(Debug, Clone, Default)]
pub struct AggMetrics {
    pub build_time: Time,
    pub get_results_time: Time,
    pub ht_resize_time: Time,
    pub ht_stats: HashTableStats,
    pub partitions_created: Count,
    pub max_partition_level: Gauge,
    pub num_row_repartitioned: Count,
    pub num_repartitions: Count,
    pub num_spilled_partitions: Count,
    pub largest_partition_percent: Gauge,
    /// Streaming pre-aggregation only: rows emitted without aggregation.
    pub rows_passed_through: Count,
    /// Streaming pre-aggregation only: extrapolated reduction, in percent.
    pub preagg_estimated_reduction: Gauge,
}

/// Metrics for the partitioned hash join operator.
#[derive(Debug, Clone, Default)]
pub struct JoinMetrics {
    pub build_time: Time,
    pub probe_time: Time,
    pub build_rows: Count,
    pub probe_rows: Count,
    pub output_rows: Count,
    pub ht_stats: HashTableStats,
    pub partitions_created: Count,
    pub max_partition_level: Gauge,
    pub num_repartitions: Count,
    pub num_spilled_partitions: Count,
    pub largest_partition_percent: Gauge,
    pub null_aware_eval_time: Time,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_is_shared() {
        let a = Count::new();
        let b = a.clone();
        a.add(3);
        b.add(4);
        assert_eq!(a.value(), 7);
    }

    #[test]
    fn gauge_tracks_high_water() {
        let g = Gauge::new();
        g.set(10);
        g.set(3);
        assert_eq!(g.value(), 3);
        assert_eq!(g.max(), 10);
    }

    #[test]
    fn scoped_timer_records() {
        let t = Time::new();
        {
            let _guard = t.timer();
            std::hint::black_box(0);
        }
        // The timer resolution may be coarse but must be monotonic.
        let first = t.value();
        {
            let _guard = t.timer();
            std::hint::black_box(0);
        }
        assert!(t.value() >= first);
    }
}
