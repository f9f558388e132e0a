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

//! Runtime (Bloom) filters built from join build-side keys.
//!
//! During the level-0 build the join feeds every build key into its filters;
//! when the build completes they are published for upstream scans to consume.
//! A filter whose projected false-positive rate against the observed build
//! cardinality is above [`MAX_FPP_BEFORE_ALWAYS_TRUE`] is published as
//! always-true (consumers then skip probing it). Filters are not rebuilt
//! after repartitioning.

use std::hash::{Hash, Hasher};

use ahash::AHasher;
use granite_common::Datum;
use log::debug;

/// Above this projected false-positive rate a filter is useless and is
/// published always-true.
const MAX_FPP_BEFORE_ALWAYS_TRUE: f64 = 0.75;

const MIN_FILTER_BITS: usize = 1 << 10;
const MAX_FILTER_BITS: usize = 1 << 26;

/// Descriptor of one runtime filter: which equi-join conjunct feeds it and
/// whether it is bound by partition columns (row filters may be disabled by
/// configuration).
#[derive(Debug, Clone)]
pub struct RuntimeFilterDesc {
    pub filter_id: usize,
    /// Index into the plan's equi-join conjuncts.
    pub src_key: usize,
    pub is_bound_by_partition_columns: bool,
}

/// A blocked bitset Bloom filter with double hashing.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    /// Power of two.
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Sizes the filter for an expected `expected_count` distinct keys.
    pub fn with_expected_count(expected_count: u64) -> Self {
        // ~8 bits per expected key keeps the false-positive rate around 2%.
        let num_bits = granite_common::roundup_pow2(
            (expected_count.max(1) as usize).saturating_mul(8),
        )
        .clamp(MIN_FILTER_BITS, MAX_FILTER_BITS);
        // Optimal k = (m/n) ln2, bounded to something sensible.
        let k = ((num_bits as f64 / expected_count.max(1) as f64) * 2f64.ln())
            .round() as usize;
        Self {
            words: vec![0u64; num_bits / 64],
            num_bits,
            num_hashes: k.clamp(1, 8),
        }
    }

    fn probes(&self, hash: u64) -> impl Iterator<Item = usize> + '_ {
        // Double hashing from the two 32-bit halves.
        let h1 = hash as u32 as u64;
        let h2 = (hash >> 32) | 1; // odd stride hits every bit of a pow2 table
        let mask = (self.num_bits - 1) as u64;
        (0..self.num_hashes as u64).map(move |i| ((h1.wrapping_add(i.wrapping_mul(h2))) & mask) as usize)
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let h1 = hash as u32 as u64;
        let h2 = (hash >> 32) | 1;
        let mask = (self.num_bits - 1) as u64;
        for i in 0..self.num_hashes as u64 {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) & mask) as usize;
            self.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    pub fn might_contain(&self, hash: u64) -> bool {
        self.probes(hash)
            .all(|bit| self.words[bit / 64] & (1u64 << (bit % 64)) != 0)
    }

    /// Projected false-positive rate after `n` distinct insertions:
    /// `(1 - e^(-kn/m))^k`.
    pub fn projected_fpp(&self, n: u64) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        (1.0 - (-k * n as f64 / m).exp()).powf(k)
    }
}

/// A published runtime filter.
#[derive(Debug, Clone)]
pub struct RuntimeFilter {
    pub desc: RuntimeFilterDesc,
    bloom: Option<BloomFilter>,
    always_true: bool,
}

impl RuntimeFilter {
    pub fn always_true(&self) -> bool {
        self.always_true
    }

    /// Consumer-side check; an always-true filter passes everything.
    pub fn might_contain(&self, value: &Datum) -> bool {
        if self.always_true {
            return true;
        }
        match &self.bloom {
            Some(bloom) => bloom.might_contain(filter_hash(value)),
            None => true,
        }
    }
}

/// Collects filters during the build phase and publishes them once.
#[derive(Debug, Default)]
pub struct RuntimeFilterBank {
    pending: Vec<(RuntimeFilterDesc, BloomFilter)>,
    published: Vec<RuntimeFilter>,
}

impl RuntimeFilterBank {
    pub fn new(
        descs: &[RuntimeFilterDesc],
        expected_build_count: u64,
        allow_row_filters: bool,
    ) -> Self {
        let pending = descs
            .iter()
            .filter(|d| allow_row_filters || d.is_bound_by_partition_columns)
            .map(|d| {
                (
                    d.clone(),
                    BloomFilter::with_expected_count(expected_build_count),
                )
            })
            .collect();
        Self {
            pending,
            published: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.published.is_empty()
    }

    /// Feeds one build row's key values (indexed by conjunct) into every
    /// pending filter.
    pub fn insert(&mut self, key_values: &[Datum]) {
        for (desc, bloom) in &mut self.pending {
            let value = &key_values[desc.src_key];
            if !value.is_null() {
                bloom.insert_hash(filter_hash(value));
            }
        }
    }

    /// Publishes every pending filter, downgrading those whose projected
    /// false-positive rate against `total_build_rows` is too high.
    pub fn publish(&mut self, total_build_rows: u64) {
        for (desc, bloom) in self.pending.drain(..) {
            let fpp = bloom.projected_fpp(total_build_rows);
            let always_true = fpp > MAX_FPP_BEFORE_ALWAYS_TRUE;
            if always_true {
                debug!(
                    "runtime filter {} published always-true (projected fpp {fpp:.3})",
                    desc.filter_id
                );
            }
            self.published.push(RuntimeFilter {
                desc,
                bloom: (!always_true).then_some(bloom),
                always_true,
            });
        }
    }

    pub fn published(&self) -> &[RuntimeFilter] {
        &self.published
    }
}

/// Hash of one key value, canonicalized by width so the build and probe
/// sides agree.
fn filter_hash(value: &Datum) -> u64 {
    let mut hasher = AHasher::default();
    match value {
        Datum::Null => 0u8.hash(&mut hasher),
        Datum::Bool(v) => v.hash(&mut hasher),
        Datum::Int8(v) => (*v as i64).hash(&mut hasher),
        Datum::Int16(v) => (*v as i64).hash(&mut hasher),
        Datum::Int32(v) => (*v as i64).hash(&mut hasher),
        Datum::Int64(v) => v.hash(&mut hasher),
        Datum::Float32(v) => v.to_bits().hash(&mut hasher),
        Datum::Float64(v) => v.to_bits().hash(&mut hasher),
        Datum::Utf8(v) => v.hash(&mut hasher),
        Datum::Binary(v) => v.hash(&mut hasher),
        Datum::Decimal(v) => v.hash(&mut hasher),
    }
    hasher.finish()
}
