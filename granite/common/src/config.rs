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

//! Execution options recognized by the Granite operators.

use crate::config_err;
use crate::error::Result;

/// Gates publication of runtime (Bloom) filters built by joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFilterMode {
    /// No filters are built or published.
    Off,
    /// Filters are published to consumers within the same fragment.
    Local,
    /// Filters are additionally published for global aggregation.
    Global,
}

/// Software prefetching inside the hash table probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchMode {
    /// Probe buckets one row at a time.
    None,
    /// Hash the whole cached batch up front so bucket lines are touched
    /// ahead of the equality pass.
    HtBucket,
}

/// Options controlling the execution of the aggregation and join operators.
///
/// Constructed with [`ExecOptions::default`] and customized through the
/// `with_*` builder methods:
///
/// ```
/// use granite_common::config::ExecOptions;
///
/// let options = ExecOptions::default()
///     .with_batch_size(4096)
///     .with_streaming_preaggregation(true);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Rows per batch; bounds scratch allocation.
    pub batch_size: usize,
    /// Choose quadratic (vs linear) probing at hash table construction.
    pub enable_quadratic_probing: bool,
    /// Gate runtime-filter publication.
    pub runtime_filter_mode: RuntimeFilterMode,
    /// Disable filters that are not bound by partition columns.
    pub disable_row_runtime_filtering: bool,
    /// Enables software prefetch inside the probe loop.
    pub prefetch_mode: PrefetchMode,
    /// Switch the aggregator to the pass-through pre-aggregation variant.
    pub streaming_preaggregation: bool,
    /// Upper bound on repartitioning recursion.
    pub max_partition_depth: usize,
    /// log2 of the partition fan-out; partition index uses this many of the
    /// top bits of the row hash.
    pub partition_fanout_bits: u32,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            enable_quadratic_probing: true,
            runtime_filter_mode: RuntimeFilterMode::Local,
            disable_row_runtime_filtering: false,
            prefetch_mode: PrefetchMode::HtBucket,
            streaming_preaggregation: false,
            max_partition_depth: 16,
            partition_fanout_bits: 4,
        }
    }
}

impl ExecOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_quadratic_probing(mut self, enabled: bool) -> Self {
        self.enable_quadratic_probing = enabled;
        self
    }

    pub fn with_runtime_filter_mode(mut self, mode: RuntimeFilterMode) -> Self {
        self.runtime_filter_mode = mode;
        self
    }

    pub fn with_disable_row_runtime_filtering(mut self, disabled: bool) -> Self {
        self.disable_row_runtime_filtering = disabled;
        self
    }

    pub fn with_prefetch_mode(mut self, mode: PrefetchMode) -> Self {
        self.prefetch_mode = mode;
        self
    }

    pub fn with_streaming_preaggregation(mut self, enabled: bool) -> Self {
        self.streaming_preaggregation = enabled;
        self
    }

    pub fn with_max_partition_depth(mut self, depth: usize) -> Self {
        self.max_partition_depth = depth;
        self
    }

    pub fn with_partition_fanout_bits(mut self, bits: u32) -> Self {
        self.partition_fanout_bits = bits;
        self
    }

    /// The partition fan-out, `2^partition_fanout_bits`.
    pub fn partition_fanout(&self) -> usize {
        1 << self.partition_fanout_bits
    }

    /// Check the options for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return config_err!("batch_size must be at least 1");
        }
        if self.partition_fanout_bits == 0 || self.partition_fanout_bits > 8 {
            return config_err!(
                "partition_fanout_bits must be in 1..=8, got {}",
                self.partition_fanout_bits
            );
        }
        if self.max_partition_depth == 0 {
            return config_err!("max_partition_depth must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = ExecOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.partition_fanout(), 16);
    }

    #[test]
    fn rejects_bad_fanout() {
        let options = ExecOptions::default().with_partition_fanout_bits(9);
        assert!(options.validate().is_err());
        let options = ExecOptions::default().with_partition_fanout_bits(0);
        assert!(options.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch() {
        assert!(ExecOptions::default()
            .with_batch_size(0)
            .validate()
            .is_err());
    }
}
