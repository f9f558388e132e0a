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

//! Open-addressed hash table over rows stored elsewhere (a tuple stream or
//! an in-memory arena).
//!
//! Buckets are a flat power-of-two array; each filled bucket stores the row
//! hash (so resizing never re-hashes, and most mismatched probes are
//! filtered by an integer compare before the key comparison) and an opaque
//! 64-bit row reference resolved through a caller-supplied fetch function.
//! Duplicate keys chain through nodes allocated from per-table data pages;
//! the first pages are small so tiny queries stay cheap.

pub mod ctx;

use granite_common::{internal_err, Result, Row};

use crate::metrics::HashTableStats;
use ctx::HashTableCtx;
use granite_execution::memory_pool::MemoryReservation;

pub use ctx::ExprValuesCache;

/// Probe result marker for "the probe sequence exhausted without finding an
/// empty bucket" (the table needs a resize before this key can be placed).
pub const BUCKET_NOT_FOUND: usize = usize::MAX;

/// Buckets may fill to at most this fraction of the array.
pub const MAX_FILL_FACTOR: f64 = 0.75;

/// The first duplicate-node pages are smaller than the I/O-sized ones so
/// that small tables do not pay a large fixed allocation.
const INITIAL_DATA_PAGE_SIZES: [usize; 2] = [64 * 1024, 512 * 1024];
const IO_DATA_PAGE_SIZE: usize = 8 * 1024 * 1024;

/// Resolves an opaque row reference back to a row. Joins resolve into the
/// partition's build stream; the aggregator resolves into its intermediate
/// arena.
pub type FetchRow<'a> = &'a dyn Fn(u64) -> Result<Row>;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    filled: bool,
    /// Set when a probe emitted this bucket's rows (outer/semi/anti joins).
    matched: bool,
    has_duplicates: bool,
    /// Level-specific hash of the stored key; stored to allow cheap rehash
    /// on resize and to short-circuit probe comparisons.
    hash: u32,
    /// Row reference, or the head of the duplicate chain when
    /// `has_duplicates`.
    payload: u64,
}

/// Size used for memory accounting; the struct itself is padded to this.
const BUCKET_SIZE: usize = std::mem::size_of::<Bucket>();

#[derive(Debug, Clone, Copy)]
struct DupNode {
    matched: bool,
    row: u64,
    /// Encoded reference of the next node in this bucket's chain.
    next: Option<u64>,
}

const DUP_NODE_SIZE: usize = std::mem::size_of::<DupNode>();

fn encode_node_ref(page: usize, slot: usize) -> u64 {
    ((page as u64) << 32) | slot as u64
}

fn decode_node_ref(node: u64) -> (usize, usize) {
    ((node >> 32) as usize, node as u32 as usize)
}

/// Position of one stored row: a bucket, and the duplicate node within its
/// chain if the bucket has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtPos {
    bucket: usize,
    node: Option<u64>,
}

/// Outcome of an [`HashTable::insert`].
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The key is present and duplicates are disallowed; the position of the
    /// existing row is returned.
    DuplicateKey(HtPos),
    /// No free bucket within the probe budget or the fill factor would be
    /// breached; the caller must resize (or spill).
    NeedsResize,
    /// A duplicate node page could not be reserved; the caller must free
    /// memory (spill) and retry.
    NoMemory,
}

#[derive(Debug)]
pub struct HashTable {
    quadratic_probing: bool,
    stores_duplicates: bool,
    buckets: Vec<Bucket>,
    num_filled: usize,
    num_rows: usize,
    max_num_buckets: Option<usize>,
    reservation: MemoryReservation,
    pages: Vec<Vec<DupNode>>,
    stats: HashTableStats,
    has_matches: bool,
}

impl HashTable {
    /// Creates a table with at least `initial_buckets` (rounded up to a
    /// power of two). Returns `Ok(None)` if the bucket array's memory cannot
    /// be reserved.
    pub fn try_new(
        quadratic_probing: bool,
        stores_duplicates: bool,
        initial_buckets: usize,
        max_num_buckets: Option<usize>,
        mut reservation: MemoryReservation,
        stats: HashTableStats,
    ) -> Result<Option<Self>> {
        let num_buckets = granite_common::roundup_pow2(initial_buckets.max(4));
        if let Some(max) = max_num_buckets {
            if num_buckets > max {
                return internal_err!(
                    "initial bucket count {num_buckets} exceeds the maximum {max}"
                );
            }
        }
        if reservation.try_grow(num_buckets * BUCKET_SIZE).is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            quadratic_probing,
            stores_duplicates,
            buckets: vec![Bucket::default(); num_buckets],
            num_filled: 0,
            num_rows: 0,
            max_num_buckets,
            reservation,
            pages: Vec::new(),
            stats,
            has_matches: false,
        }))
    }

    /// Bytes a table holding `num_rows` rows would need for its buckets.
    pub fn estimate_size(num_rows: u64) -> usize {
        let needed = ((num_rows as f64 / MAX_FILL_FACTOR) as usize).max(4) + 1;
        granite_common::roundup_pow2(needed) * BUCKET_SIZE
    }

    /// Number of rows stored (filled buckets plus duplicate-chain nodes).
    pub fn len(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_filled_buckets(&self) -> usize {
        self.num_filled
    }

    /// Bytes currently held by the bucket array and duplicate pages.
    pub fn byte_size(&self) -> usize {
        self.reservation.size()
    }

    pub fn stats(&self) -> &HashTableStats {
        &self.stats
    }

    /// True once any probe matched a stored row. A partition whose table
    /// has matches must not be spilled, for every join op: the emitted
    /// matches cannot be reconciled with a later replay of the partition.
    pub fn has_matches(&self) -> bool {
        self.has_matches
    }

    /// Records that a probe matched some row of this table. Join ops that
    /// do not mark individual rows still record the table-level fact.
    pub fn set_has_matches(&mut self) {
        self.has_matches = true;
    }

    fn dup_node(&self, node_ref: u64) -> &DupNode {
        let (page, slot) = decode_node_ref(node_ref);
        &self.pages[page][slot]
    }

    fn dup_node_mut(&mut self, node_ref: u64) -> &mut DupNode {
        let (page, slot) = decode_node_ref(node_ref);
        &mut self.pages[page][slot]
    }

    /// Representative row reference of a bucket, used for key comparison
    /// (every row in a duplicate chain shares the key).
    fn bucket_row(&self, bucket: &Bucket) -> u64 {
        if bucket.has_duplicates {
            self.dup_node(bucket.payload).row
        } else {
            bucket.payload
        }
    }

    fn probe_step(&self, bucket_idx: usize, step: usize) -> usize {
        let mask = self.buckets.len() - 1;
        if self.quadratic_probing {
            // Triangular-number stride; visits every bucket of a
            // power-of-two array.
            (bucket_idx + step) & mask
        } else {
            (bucket_idx + 1) & mask
        }
    }

    /// Walks the probe sequence for `hash`. Stops at the first empty bucket
    /// (`found == false`) or the first bucket whose hash and key match
    /// (`found == true`). Returns [`BUCKET_NOT_FOUND`] if the sequence
    /// exhausts without hitting an empty bucket.
    pub fn probe<const FORCE_NULL_EQUALITY: bool>(
        &self,
        ctx: &HashTableCtx,
        fetch: FetchRow<'_>,
        hash: u32,
        cache_idx: usize,
    ) -> Result<(usize, bool)> {
        debug_assert!(self.buckets.len().is_power_of_two());
        let mask = self.buckets.len() - 1;
        let mut bucket_idx = hash as usize & mask;
        self.stats.probes.add(1);
        let mut step = 0;
        loop {
            let bucket = &self.buckets[bucket_idx];
            if !bucket.filled {
                return Ok((bucket_idx, false));
            }
            if bucket.hash == hash {
                let stored = fetch(self.bucket_row(bucket))?;
                if ctx.equals::<FORCE_NULL_EQUALITY>(&stored, cache_idx)? {
                    return Ok((bucket_idx, true));
                }
                self.stats.hash_collisions.add(1);
            }
            step += 1;
            self.stats.travel_length.add(1);
            if step >= self.buckets.len() {
                self.stats.failed_probes.add(1);
                return Ok((BUCKET_NOT_FOUND, false));
            }
            bucket_idx = self.probe_step(bucket_idx, step);
        }
    }

    /// Inserts `row_ref` under `hash`. The key must already be materialized
    /// in the ctx cache at `cache_idx`.
    pub fn insert<const FORCE_NULL_EQUALITY: bool>(
        &mut self,
        ctx: &HashTableCtx,
        fetch: FetchRow<'_>,
        hash: u32,
        row_ref: u64,
        cache_idx: usize,
    ) -> Result<InsertOutcome> {
        if self.num_filled + 1
            > (self.buckets.len() as f64 * MAX_FILL_FACTOR) as usize
        {
            return Ok(InsertOutcome::NeedsResize);
        }
        let (bucket_idx, found) =
            self.probe::<FORCE_NULL_EQUALITY>(ctx, fetch, hash, cache_idx)?;
        if bucket_idx == BUCKET_NOT_FOUND {
            return Ok(InsertOutcome::NeedsResize);
        }
        if found {
            if !self.stores_duplicates {
                return Ok(InsertOutcome::DuplicateKey(HtPos {
                    bucket: bucket_idx,
                    node: self.buckets[bucket_idx]
                        .has_duplicates
                        .then(|| self.buckets[bucket_idx].payload),
                }));
            }
            return self.insert_duplicate(bucket_idx, row_ref);
        }
        let bucket = &mut self.buckets[bucket_idx];
        bucket.filled = true;
        bucket.matched = false;
        bucket.has_duplicates = false;
        bucket.hash = hash;
        bucket.payload = row_ref;
        self.num_filled += 1;
        self.num_rows += 1;
        Ok(InsertOutcome::Inserted)
    }

    /// Fills `bucket_idx` (previously returned by a miss-probe) without
    /// re-probing. Used by the aggregator's probe-then-insert path.
    pub fn insert_at(&mut self, bucket_idx: usize, hash: u32, row_ref: u64) {
        debug_assert!(!self.buckets[bucket_idx].filled);
        debug_assert!(
            self.num_filled + 1
                <= (self.buckets.len() as f64 * MAX_FILL_FACTOR) as usize
        );
        let bucket = &mut self.buckets[bucket_idx];
        bucket.filled = true;
        bucket.matched = false;
        bucket.has_duplicates = false;
        bucket.hash = hash;
        bucket.payload = row_ref;
        self.num_filled += 1;
        self.num_rows += 1;
    }

    /// Prepends a duplicate node to `bucket_idx`'s chain, converting the
    /// bucket to chained form on its first duplicate.
    fn insert_duplicate(&mut self, bucket_idx: usize, row_ref: u64) -> Result<InsertOutcome> {
        let converting = !self.buckets[bucket_idx].has_duplicates;
        let nodes_needed = if converting { 2 } else { 1 };
        if !self.reserve_dup_nodes(nodes_needed)? {
            return Ok(InsertOutcome::NoMemory);
        }
        let head = if converting {
            let bucket = self.buckets[bucket_idx];
            let first = self.alloc_dup_node(DupNode {
                matched: bucket.matched,
                row: bucket.payload,
                next: None,
            });
            self.alloc_dup_node(DupNode {
                matched: false,
                row: row_ref,
                next: Some(first),
            })
        } else {
            let old_head = self.buckets[bucket_idx].payload;
            self.alloc_dup_node(DupNode {
                matched: false,
                row: row_ref,
                next: Some(old_head),
            })
        };
        let bucket = &mut self.buckets[bucket_idx];
        bucket.has_duplicates = true;
        bucket.payload = head;
        self.num_rows += 1;
        Ok(InsertOutcome::Inserted)
    }

    /// Makes sure the newest data page has room for `n` more nodes,
    /// reserving a new page if needed. Returns false on reservation failure.
    fn reserve_dup_nodes(&mut self, n: usize) -> Result<bool> {
        let has_room = self
            .pages
            .last()
            .map(|p| p.capacity() - p.len() >= n)
            .unwrap_or(false);
        if has_room {
            return Ok(true);
        }
        let page_bytes = INITIAL_DATA_PAGE_SIZES
            .get(self.pages.len())
            .copied()
            .unwrap_or(IO_DATA_PAGE_SIZE);
        if self.reservation.try_grow(page_bytes).is_err() {
            return Ok(false);
        }
        self.pages
            .push(Vec::with_capacity(page_bytes / DUP_NODE_SIZE));
        Ok(true)
    }

    fn alloc_dup_node(&mut self, node: DupNode) -> u64 {
        let page_idx = self.pages.len() - 1;
        let page = &mut self.pages[page_idx];
        debug_assert!(page.len() < page.capacity());
        page.push(node);
        encode_node_ref(page_idx, page.len() - 1)
    }

    /// Grows the bucket array until `n` more rows fit under the fill factor.
    /// Returns false (leaving the table usable at its current size) if the
    /// new array would exceed `max_num_buckets` or cannot be reserved.
    pub fn check_and_resize(&mut self, n: usize) -> Result<bool> {
        let limit = |buckets: usize| (buckets as f64 * MAX_FILL_FACTOR) as usize;
        let mut target = self.buckets.len();
        while self.num_filled + n > limit(target) {
            target *= 2;
        }
        if target == self.buckets.len() {
            return Ok(true);
        }
        self.resize_buckets(target)
    }

    /// Allocates a zero-initialized array of `new_count` buckets and
    /// re-places every filled bucket by its stored hash, copying buckets
    /// wholesale (duplicate chains are untouched). On failure the old array
    /// remains intact.
    pub fn resize_buckets(&mut self, new_count: usize) -> Result<bool> {
        if !new_count.is_power_of_two() {
            return internal_err!("bucket count {new_count} is not a power of two");
        }
        if let Some(max) = self.max_num_buckets {
            if new_count > max {
                return Ok(false);
            }
        }
        if new_count < self.buckets.len() {
            return internal_err!("hash tables never shrink");
        }
        if self.reservation.try_grow(new_count * BUCKET_SIZE).is_err() {
            return Ok(false);
        }
        let mask = new_count - 1;
        let mut new_buckets = vec![Bucket::default(); new_count];
        for bucket in &self.buckets {
            if !bucket.filled {
                continue;
            }
            let mut idx = bucket.hash as usize & mask;
            let mut step = 0;
            while new_buckets[idx].filled {
                step += 1;
                idx = if self.quadratic_probing {
                    (idx + step) & mask
                } else {
                    (idx + 1) & mask
                };
            }
            new_buckets[idx] = *bucket;
        }
        let old_count = std::mem::replace(&mut self.buckets, new_buckets).len();
        self.reservation.shrink(old_count * BUCKET_SIZE);
        self.stats.resizes.add(1);
        Ok(true)
    }

    /// Position of the first row of a found bucket (head of the duplicate
    /// chain, if any).
    pub fn first_match(&self, bucket_idx: usize) -> HtPos {
        let bucket = &self.buckets[bucket_idx];
        debug_assert!(bucket.filled);
        HtPos {
            bucket: bucket_idx,
            node: bucket.has_duplicates.then_some(bucket.payload),
        }
    }

    /// Advances within the duplicate chain of a match; `None` when the
    /// bucket's rows are exhausted.
    pub fn next_match(&self, pos: &HtPos) -> Option<HtPos> {
        let node_ref = pos.node?;
        self.dup_node(node_ref).next.map(|next| HtPos {
            bucket: pos.bucket,
            node: Some(next),
        })
    }

    pub fn row_ref(&self, pos: HtPos) -> u64 {
        match pos.node {
            Some(node_ref) => self.dup_node(node_ref).row,
            None => self.buckets[pos.bucket].payload,
        }
    }

    pub fn mark_matched(&mut self, pos: HtPos) {
        match pos.node {
            Some(node_ref) => self.dup_node_mut(node_ref).matched = true,
            None => self.buckets[pos.bucket].matched = true,
        }
        self.has_matches = true;
    }

    pub fn is_matched(&self, pos: HtPos) -> bool {
        match pos.node {
            Some(node_ref) => self.dup_node(node_ref).matched,
            None => self.buckets[pos.bucket].matched,
        }
    }

    /// Linear scan over every stored row (bucket payloads and duplicate
    /// chain nodes).
    pub fn begin(&self) -> Option<HtPos> {
        self.first_from(0)
    }

    fn first_from(&self, start_bucket: usize) -> Option<HtPos> {
        (start_bucket..self.buckets.len()).find_map(|i| {
            self.buckets[i].filled.then(|| self.first_match(i))
        })
    }

    pub fn scan_next(&self, pos: &HtPos) -> Option<HtPos> {
        if let Some(next) = self.next_match(pos) {
            return Some(next);
        }
        self.first_from(pos.bucket + 1)
    }

    /// First row whose matched bit is clear; used by right/full outer joins
    /// to drain unmatched build rows.
    pub fn first_unmatched(&self) -> Option<HtPos> {
        let first = self.begin()?;
        if !self.is_matched(first) {
            return Some(first);
        }
        self.next_unmatched(&first)
    }

    pub fn next_unmatched(&self, pos: &HtPos) -> Option<HtPos> {
        let mut cur = *pos;
        while let Some(next) = self.scan_next(&cur) {
            if !self.is_matched(next) {
                return Some(next);
            }
            cur = next;
        }
        None
    }

    /// Verifies the structural invariants; used by tests.
    #[cfg(test)]
    fn check_invariants(&self) {
        assert!(self.buckets.len().is_power_of_two());
        assert!(
            self.num_filled
                <= (self.buckets.len() as f64 * MAX_FILL_FACTOR) as usize,
            "fill factor breached: {}/{}",
            self.num_filled,
            self.buckets.len()
        );
        let filled = self.buckets.iter().filter(|b| b.filled).count();
        assert_eq!(filled, self.num_filled);
    }
}
