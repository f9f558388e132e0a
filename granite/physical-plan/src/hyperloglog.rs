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

//! HyperLogLog sketch backing the NDV aggregate.
//!
//! The register image is a plain byte array so the sketch can round-trip
//! through a serialized intermediate row (NDV is what makes aggregate
//! intermediates var-len and forces the serialize-on-spill path). The
//! estimator uses the tau/sigma corrections from Ertl,
//! "New cardinality estimation algorithms for HyperLogLog sketches"
//! (arXiv:1702.01284).

const PRECISION: usize = 11;
const INDEX_MASK: u64 = (1 << PRECISION) as u64 - 1;
/// Bits of the hash that feed the leading-zero count.
const HLL_Q: usize = 64 - PRECISION;
pub const NUM_REGISTERS: usize = 1 << PRECISION;

#[derive(Clone)]
pub struct HyperLogLog {
    registers: [u8; NUM_REGISTERS],
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperLogLog {
    pub fn new() -> Self {
        Self {
            registers: [0; NUM_REGISTERS],
        }
    }

    /// Restores a sketch from a serialized register image.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != NUM_REGISTERS {
            return None;
        }
        let mut registers = [0u8; NUM_REGISTERS];
        registers.copy_from_slice(bytes);
        Some(Self { registers })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.registers
    }

    /// Records one 64-bit hash. The caller is responsible for hashing the
    /// input value; the sketch only slices the hash into a register index
    /// and a leading-zero pattern.
    pub fn add_hash(&mut self, hash: u64) {
        let index = (hash & INDEX_MASK) as usize;
        let p = ((hash >> PRECISION) | (1u64 << HLL_Q)).leading_zeros() + 1;
        if self.registers[index] < p as u8 {
            self.registers[index] = p as u8;
        }
    }

    /// Merges another sketch into this one (register-wise max).
    pub fn merge(&mut self, other: &HyperLogLog) {
        for (mine, theirs) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *mine < *theirs {
                *mine = *theirs;
            }
        }
    }

    /// Estimated number of distinct hashes added.
    pub fn count(&self) -> usize {
        Self::count_registers(&self.registers)
    }

    /// Records a hash directly into a serialized register image, avoiding a
    /// sketch round trip in the aggregate update path.
    pub fn add_hash_into(registers: &mut [u8], hash: u64) {
        debug_assert_eq!(registers.len(), NUM_REGISTERS);
        let index = (hash & INDEX_MASK) as usize;
        let p = (((hash >> PRECISION) | (1u64 << HLL_Q)).leading_zeros() + 1) as u8;
        if registers[index] < p {
            registers[index] = p;
        }
    }

    /// Register-wise max of two serialized images.
    pub fn merge_into(dst: &mut [u8], src: &[u8]) {
        debug_assert_eq!(dst.len(), src.len());
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            if *d < *s {
                *d = *s;
            }
        }
    }

    /// Estimate over a serialized register image.
    pub fn count_registers(registers: &[u8]) -> usize {
        let mut histogram = [0u32; HLL_Q + 2];
        for &register in registers.iter() {
            histogram[register as usize] += 1;
        }
        let m = NUM_REGISTERS as f64;
        let mut z = m * tau((m - histogram[HLL_Q + 1] as f64) / m);
        for i in (1..=HLL_Q).rev() {
            z += histogram[i] as f64;
            z *= 0.5;
        }
        z += m * sigma(histogram[0] as f64 / m);
        ((0.5 / 2f64.ln()) * m * m / z).round() as usize
    }
}

impl std::fmt::Debug for HyperLogLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperLogLog")
            .field("estimate", &self.count())
            .finish()
    }
}

fn sigma(x: f64) -> f64 {
    if x == 1.0 {
        return f64::INFINITY;
    }
    let mut x = x;
    let mut y = 1.0;
    let mut z = x;
    loop {
        x *= x;
        let z_prev = z;
        z += x * y;
        y += y;
        if z == z_prev {
            return z;
        }
    }
}

fn tau(x: f64) -> f64 {
    if x == 0.0 || x == 1.0 {
        return 0.0;
    }
    let mut x = x;
    let mut y = 1.0;
    let mut z = 1.0 - x;
    loop {
        x = x.sqrt();
        let z_prev = z;
        y *= 0.5;
        z -= (1.0 - x).powi(2) * y;
        if z == z_prev {
            return z / 3.0;
        }
    }
}
