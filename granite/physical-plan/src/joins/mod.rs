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

//! Join implementations.

mod filter;
mod hash_join;

pub use filter::{BloomFilter, RuntimeFilter, RuntimeFilterBank, RuntimeFilterDesc};
pub use hash_join::PartitionedHashJoin;

use granite_common::{config_err, Result, RowSchema};

use crate::expr::{JoinFilterRef, JoinKey};

/// The join operators the hash join implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOp {
    Inner,
    LeftOuter,
    LeftSemi,
    LeftAnti,
    /// LEFT ANTI with SQL `NOT IN` null semantics: NULL keys on either side
    /// join against the whole other side through the non-equi conjuncts.
    NullAwareLeftAnti,
    RightOuter,
    RightSemi,
    RightAnti,
    FullOuter,
}

impl JoinOp {
    /// Ops that remember which build rows matched (the `matched` bit).
    pub fn needs_match_marking(&self) -> bool {
        matches!(
            self,
            JoinOp::RightOuter | JoinOp::RightSemi | JoinOp::RightAnti | JoinOp::FullOuter
        )
    }

    /// Ops that emit unmatched build rows after the probe side is consumed.
    pub fn drains_unmatched_build(&self) -> bool {
        matches!(
            self,
            JoinOp::RightOuter | JoinOp::RightAnti | JoinOp::FullOuter
        )
    }

    /// Ops whose output rows carry only probe-side columns.
    pub fn emits_probe_only(&self) -> bool {
        matches!(
            self,
            JoinOp::LeftSemi | JoinOp::LeftAnti | JoinOp::NullAwareLeftAnti
        )
    }

    /// Ops whose output rows carry only build-side columns.
    pub fn emits_build_only(&self) -> bool {
        matches!(self, JoinOp::RightSemi | JoinOp::RightAnti)
    }

    /// Ops that emit an unmatched probe row padded with NULL build columns.
    pub fn pads_unmatched_probe(&self) -> bool {
        matches!(self, JoinOp::LeftOuter | JoinOp::FullOuter)
    }
}

impl std::fmt::Display for JoinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Plan-node descriptor for the partitioned hash join.
#[derive(Debug, Clone)]
pub struct JoinPlan {
    pub operator_id: usize,
    pub join_op: JoinOp,
    /// Probe (left) side layout.
    pub probe_schema: RowSchema,
    /// Build (right) side layout.
    pub build_schema: RowSchema,
    /// Equi-join conjuncts, pairwise build/probe.
    pub keys: Vec<JoinKey>,
    /// Residual (non-equi) conjuncts over (probe, build) row pairs.
    pub other_filters: Vec<JoinFilterRef>,
    pub estimated_build_cardinality: Option<u64>,
    /// Runtime (Bloom) filters to populate from the build side.
    pub runtime_filters: Vec<RuntimeFilterDesc>,
}

impl JoinPlan {
    /// Layout of the rows this join emits.
    pub fn output_schema(&self) -> RowSchema {
        if self.join_op.emits_probe_only() {
            self.probe_schema.clone()
        } else if self.join_op.emits_build_only() {
            self.build_schema.clone()
        } else {
            self.probe_schema.concat(&self.build_schema)
        }
    }

    /// True when NULL build keys must be retained in the hash tables:
    /// either a conjunct uses null-safe equality (NULL keys can match), or
    /// the op emits unmatched build rows (NULL-keyed build rows can never
    /// match but still surface in the drain).
    pub fn stores_null_keys(&self) -> bool {
        self.join_op.drains_unmatched_build()
            || self.keys.iter().any(|k| k.is_not_distinct_from)
    }

    pub fn validate(&self) -> Result<()> {
        if self.keys.is_empty() {
            return config_err!("hash join requires at least one equi-join conjunct");
        }
        if self.join_op == JoinOp::NullAwareLeftAnti {
            if self.keys.len() != 1 {
                return config_err!(
                    "null-aware anti join requires exactly one equi-join conjunct, got {}",
                    self.keys.len()
                );
            }
            if self.keys[0].is_not_distinct_from {
                return config_err!(
                    "null-aware anti join keys cannot use null-safe equality"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Column;
    use granite_common::ColumnType;
    use std::sync::Arc;

    fn key() -> JoinKey {
        JoinKey::new(
            Arc::new(Column::new(0, ColumnType::Int32)),
            Arc::new(Column::new(0, ColumnType::Int32)),
        )
    }

    fn plan(join_op: JoinOp) -> JoinPlan {
        JoinPlan {
            operator_id: 0,
            join_op,
            probe_schema: RowSchema::new(vec![ColumnType::Int32, ColumnType::Int32]),
            build_schema: RowSchema::new(vec![ColumnType::Int32]),
            keys: vec![key()],
            other_filters: vec![],
            estimated_build_cardinality: None,
            runtime_filters: vec![],
        }
    }

    #[test]
    fn output_schemas_by_op() {
        assert_eq!(plan(JoinOp::Inner).output_schema().num_columns(), 3);
        assert_eq!(plan(JoinOp::LeftSemi).output_schema().num_columns(), 2);
        assert_eq!(plan(JoinOp::RightAnti).output_schema().num_columns(), 1);
        assert_eq!(plan(JoinOp::FullOuter).output_schema().num_columns(), 3);
    }

    #[test]
    fn null_aware_requires_single_key() {
        let mut p = plan(JoinOp::NullAwareLeftAnti);
        assert!(p.validate().is_ok());
        p.keys.push(key());
        assert!(p.validate().is_err());
    }
}
