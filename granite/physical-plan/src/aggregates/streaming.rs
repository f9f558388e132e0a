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

//! Streaming pre-aggregation: a best-effort, no-spill variant that reduces
//! its input when the data cooperates and passes rows through (converted to
//! intermediate form) when it does not.
//!
//! The hash tables only grow while growing looks worthwhile: always up to
//! roughly L2 size, into L3 only if some reduction is observed, and beyond
//! that only for a strong reduction. The observed reduction is extrapolated
//! over the expected input with `R = 1 + (N/n)(r - 1)`.

use std::sync::Arc;

use granite_common::config::{ExecOptions, PrefetchMode};
use granite_common::{internal_err, Result, Row, RowBatch, RowSchema};
use granite_execution::memory_pool::{MemoryConsumer, MemoryReservation};
use granite_execution::{RuntimeEnv, TaskContext};

use crate::expr::{Column, ScalarExprRef};
use crate::hash_table::ctx::HashTableCtx;
use crate::hash_table::{HashTable, HtPos, BUCKET_NOT_FOUND};
use crate::metrics::AggMetrics;
use crate::source::BatchSource;

use super::functions::AggFnEvaluator;
use super::AggPlan;

/// Minimum extrapolated reduction required to grow the tables past each
/// memory tier.
struct MinReductionEntry {
    min_ht_mem: usize,
    min_reduction: f64,
}

const STREAMING_HT_MIN_REDUCTION: [MinReductionEntry; 3] = [
    // Expand up to L2 cache always.
    MinReductionEntry {
        min_ht_mem: 0,
        min_reduction: 0.0,
    },
    // Expand into L3 only if we look like we're getting some reduction.
    MinReductionEntry {
        min_ht_mem: 256 * 1024,
        min_reduction: 1.1,
    },
    // Expand into main memory only for a significant reduction.
    MinReductionEntry {
        min_ht_mem: 2 * 1024 * 1024,
        min_reduction: 2.0,
    },
];

struct StreamingPartition {
    hash_tbl: Option<HashTable>,
    arena: Vec<Row>,
    arena_reservation: MemoryReservation,
}

enum StreamState {
    Reading,
    Draining { partition: usize, pos: Option<HtPos> },
    Done,
}

pub struct StreamingPreAggregator {
    plan: AggPlan,
    options: ExecOptions,
    task: Arc<TaskContext>,
    metrics: AggMetrics,

    intermediate_schema: RowSchema,
    evaluators: Vec<AggFnEvaluator>,
    ctx: HashTableCtx,
    partitions: Vec<StreamingPartition>,
    state: StreamState,

    input_rows: u64,
    rows_passed_through: u64,
}

impl StreamingPreAggregator {
    pub fn try_new(
        plan: AggPlan,
        options: ExecOptions,
        env: Arc<RuntimeEnv>,
        task: Arc<TaskContext>,
    ) -> Result<Self> {
        options.validate()?;
        let num_group_cols = plan.grouping_exprs.len();
        if num_group_cols == 0 {
            return internal_err!("streaming pre-aggregation requires grouping");
        }
        let intermediate_schema = plan.intermediate_schema();

        let mut evaluators = Vec::with_capacity(plan.agg_fns.len());
        let mut slot = num_group_cols;
        for agg_fn in &plan.agg_fns {
            let evaluator = AggFnEvaluator::new(agg_fn.clone(), slot);
            slot += evaluator.num_slots();
            evaluators.push(evaluator);
        }

        let build: Vec<ScalarExprRef> = (0..num_group_cols)
            .map(|i| {
                Arc::new(Column::new(i, intermediate_schema.types()[i])) as ScalarExprRef
            })
            .collect();
        let ctx = HashTableCtx::try_new(
            build,
            plan.grouping_exprs.clone(),
            /* stores_nulls */ true,
            vec![true; num_group_cols],
            /* initial_seed */ 1,
            /* max_levels: streaming never repartitions */ 0,
            options.batch_size,
        )?;

        let reservation = MemoryConsumer::new(format!(
            "streaming-preagg-{}",
            plan.operator_id
        ))
        .register(env.memory_pool());

        let fanout = options.partition_fanout();
        let metrics = AggMetrics::default();
        let mut partitions = Vec::with_capacity(fanout);
        for _ in 0..fanout {
            let hash_tbl = HashTable::try_new(
                options.enable_quadratic_probing,
                false,
                64,
                Some(1usize << (32 - options.partition_fanout_bits)),
                reservation.new_empty(),
                metrics.ht_stats.clone(),
            )?;
            partitions.push(StreamingPartition {
                hash_tbl,
                arena: Vec::new(),
                arena_reservation: reservation.new_empty(),
            });
        }
        metrics.partitions_created.add(fanout);

        Ok(Self {
            plan,
            options,
            task,
            metrics,
            intermediate_schema,
            evaluators,
            ctx,
            partitions,
            state: StreamState::Reading,
            input_rows: 0,
            rows_passed_through: 0,
        })
    }

    pub fn metrics(&self) -> &AggMetrics {
        &self.metrics
    }

    /// Output schema: always the intermediate layout (a downstream merge
    /// aggregation finalizes).
    pub fn output_schema(&self) -> &RowSchema {
        &self.intermediate_schema
    }

    /// Whether growing the hash tables is still worthwhile given their
    /// current memory footprint and the observed reduction.
    fn should_expand_tables(&self) -> bool {
        let mut ht_mem = 0usize;
        let mut ht_rows = 0u64;
        for partition in &self.partitions {
            if let Some(tbl) = &partition.hash_tbl {
                ht_mem += tbl.byte_size();
                ht_rows += tbl.len() as u64;
            }
        }
        // Need some rows in the tables to have valid statistics.
        if ht_rows == 0 {
            return true;
        }

        let mut tier = 0;
        while tier + 1 < STREAMING_HT_MIN_REDUCTION.len()
            && ht_mem >= STREAMING_HT_MIN_REDUCTION[tier + 1].min_ht_mem
        {
            tier += 1;
        }

        // Rows that were aggregated into the tables; passed-through rows do
        // not participate in the reduction.
        let aggregated_rows = (self.input_rows - self.rows_passed_through) as f64;
        if aggregated_rows <= 0.0 {
            return true;
        }
        let current_reduction = aggregated_rows / ht_rows as f64;
        let expected_rows = self
            .plan
            .estimated_input_cardinality
            .map(|estimate| estimate.saturating_sub(self.rows_passed_through) as f64)
            .unwrap_or(aggregated_rows);
        // Extrapolate over the whole input: R = 1 + (N/n)(r - 1).
        let estimated_reduction = if aggregated_rows >= expected_rows {
            current_reduction
        } else {
            1.0 + (expected_rows / aggregated_rows) * (current_reduction - 1.0)
        };
        self.metrics
            .preagg_estimated_reduction
            .set((estimated_reduction * 100.0) as usize);
        estimated_reduction
            > STREAMING_HT_MIN_REDUCTION[tier].min_reduction
    }

    /// Converts an input row into a fresh intermediate (identity + one
    /// update), the form in which both aggregated and passed-through rows
    /// leave this operator.
    fn to_intermediate(&self, row: &Row) -> Result<Row> {
        let mut values = Vec::with_capacity(self.intermediate_schema.num_columns());
        for expr in &self.plan.grouping_exprs {
            values.push(expr.evaluate(row)?);
        }
        for evaluator in &self.evaluators {
            evaluator.init(&mut values);
        }
        let mut intermediate = Row::new(values);
        for evaluator in &self.evaluators {
            evaluator.update(row, &mut intermediate)?;
        }
        Ok(intermediate)
    }

    /// Processes one input batch; pass-through rows are appended to `out`.
    fn process_batch(&mut self, rows: &[Row], out: &mut RowBatch) -> Result<()> {
        let chunk_size = match self.options.prefetch_mode {
            PrefetchMode::HtBucket => self.ctx.cache().capacity(),
            PrefetchMode::None => 1,
        };
        for chunk in rows.chunks(chunk_size) {
            self.task.check_cancelled()?;
            self.ctx.cache_mut().reset();
            for (i, row) in chunk.iter().enumerate() {
                self.ctx.cache_mut().set_cur_idx(i);
                self.ctx.eval_probe_row(row)?;
                let hash = self.ctx.hash_current_row();
                self.ctx.cache_mut().set_cur_hash(hash);
            }
            for (i, row) in chunk.iter().enumerate() {
                let hash = self.ctx.cache().hash_at(i);
                self.input_rows += 1;
                if !self.process_row(row, hash, i)? {
                    self.rows_passed_through += 1;
                    self.metrics.rows_passed_through.add(1);
                    out.add_row(self.to_intermediate(row)?);
                }
            }
        }
        Ok(())
    }

    /// Attempts to aggregate one row; returns false if the row should pass
    /// through instead.
    fn process_row(&mut self, row: &Row, hash: u32, cache_idx: usize) -> Result<bool> {
        let bits = self.options.partition_fanout_bits;
        let part_idx = (hash >> (32 - bits)) as usize;
        if self.partitions[part_idx].hash_tbl.is_none() {
            return Ok(false);
        }

        let (bucket, found) = {
            let partition = &self.partitions[part_idx];
            let tbl = partition.hash_tbl.as_ref().unwrap();
            let arena = &partition.arena;
            let fetch = |row_ref: u64| Ok(arena[row_ref as usize].clone());
            tbl.probe::<false>(&self.ctx, &fetch, hash, cache_idx)?
        };
        if found {
            let row_ref = {
                let tbl = self.partitions[part_idx].hash_tbl.as_ref().unwrap();
                tbl.row_ref(tbl.first_match(bucket))
            };
            let evaluators = &self.evaluators;
            let dst = &mut self.partitions[part_idx].arena[row_ref as usize];
            for evaluator in evaluators {
                evaluator.update(row, dst)?;
            }
            return Ok(true);
        }

        // New group: grow the table only while expansion pays off; otherwise
        // the row streams through.
        let tbl = self.partitions[part_idx].hash_tbl.as_mut().unwrap();
        let needs_growth = bucket == BUCKET_NOT_FOUND
            || tbl.num_filled_buckets() + 1
                > (tbl.num_buckets() as f64 * crate::hash_table::MAX_FILL_FACTOR) as usize;
        if needs_growth {
            if !self.should_expand_tables() {
                return Ok(false);
            }
            let timer = self.metrics.ht_resize_time.clone();
            let _guard = timer.timer();
            let tbl = self.partitions[part_idx].hash_tbl.as_mut().unwrap();
            if !tbl.check_and_resize(1)? {
                return Ok(false);
            }
        }

        let intermediate = self.to_intermediate(row)?;
        let partition = &mut self.partitions[part_idx];
        let bytes = self.intermediate_schema.serialized_size(&intermediate)
            + super::ARENA_ROW_OVERHEAD;
        if partition.arena_reservation.try_grow(bytes).is_err() {
            return Ok(false);
        }
        partition.arena.push(intermediate);
        let row_ref = (partition.arena.len() - 1) as u64;

        let (bucket, found) = {
            let partition = &self.partitions[part_idx];
            let tbl = partition.hash_tbl.as_ref().unwrap();
            let arena = &partition.arena;
            let fetch = |row_ref: u64| Ok(arena[row_ref as usize].clone());
            tbl.probe::<false>(&self.ctx, &fetch, hash, cache_idx)?
        };
        debug_assert!(!found);
        if bucket == BUCKET_NOT_FOUND {
            // Lost the race against our own fill factor; withdraw the arena
            // row and stream the input row through.
            let partition = &mut self.partitions[part_idx];
            partition.arena.pop();
            partition.arena_reservation.shrink(bytes);
            return Ok(false);
        }
        self.partitions[part_idx]
            .hash_tbl
            .as_mut()
            .unwrap()
            .insert_at(bucket, hash, row_ref);
        Ok(true)
    }

    /// Produces the next output batch: pass-through intermediates while the
    /// input lasts, then the aggregated table contents.
    pub fn get_next(&mut self, input: &mut dyn BatchSource) -> Result<Option<RowBatch>> {
        loop {
            self.task.check_cancelled()?;
            match &self.state {
                StreamState::Reading => {
                    match input.next_batch()? {
                        Some(batch) => {
                            let mut out = RowBatch::new(
                                self.options.batch_size.max(batch.num_rows()),
                            );
                            self.process_batch(batch.rows(), &mut out)?;
                            if !out.is_empty() {
                                return Ok(Some(out));
                            }
                        }
                        None => {
                            self.state = StreamState::Draining {
                                partition: 0,
                                pos: self.partitions[0]
                                    .hash_tbl
                                    .as_ref()
                                    .and_then(|t| t.begin()),
                            };
                        }
                    }
                }
                StreamState::Draining { partition, pos } => {
                    let mut partition = *partition;
                    let mut pos = *pos;
                    let mut out = RowBatch::new(self.options.batch_size);
                    while partition < self.partitions.len() {
                        if out.at_capacity() {
                            break;
                        }
                        match pos {
                            Some(p) => {
                                let part = &self.partitions[partition];
                                let tbl = part.hash_tbl.as_ref().unwrap();
                                let mut intermediate =
                                    part.arena[tbl.row_ref(p) as usize].clone();
                                for evaluator in &self.evaluators {
                                    evaluator.serialize(&mut intermediate);
                                }
                                out.add_row(intermediate);
                                pos = tbl.scan_next(&p);
                            }
                            None => {
                                partition += 1;
                                pos = self
                                    .partitions
                                    .get(partition)
                                    .and_then(|p| p.hash_tbl.as_ref())
                                    .and_then(|t| t.begin());
                            }
                        }
                    }
                    if partition >= self.partitions.len() {
                        self.state = StreamState::Done;
                    } else {
                        self.state = StreamState::Draining { partition, pos };
                    }
                    if !out.is_empty() {
                        return Ok(Some(out));
                    }
                }
                StreamState::Done => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::functions::AggFn;
    use crate::source::MemorySource;
    use granite_common::{ColumnType, Datum};
    use granite_execution::runtime_env::RuntimeEnvBuilder;

    fn plan(estimate: Option<u64>) -> AggPlan {
        AggPlan {
            operator_id: 9,
            input_schema: RowSchema::new(vec![ColumnType::Int32, ColumnType::Int32]),
            grouping_exprs: vec![Arc::new(Column::new(0, ColumnType::Int32))],
            agg_fns: vec![AggFn::count_star()],
            needs_finalize: false,
            estimated_input_cardinality: estimate,
        }
    }

    fn run(plan: AggPlan, rows: Vec<Row>) -> (Vec<Row>, AggMetrics) {
        let env = RuntimeEnvBuilder::new().build().unwrap();
        let options = ExecOptions::default().with_streaming_preaggregation(true);
        let mut agg =
            StreamingPreAggregator::try_new(plan, options, env, TaskContext::new())
                .unwrap();
        let mut source = MemorySource::new(rows, 1024);
        let mut out = Vec::new();
        while let Some(mut batch) = agg.get_next(&mut source).unwrap() {
            out.extend(batch.take_rows());
        }
        (out, agg.metrics().clone())
    }

    #[test]
    fn reduces_duplicate_keys() {
        let rows: Vec<Row> = (0..10_000)
            .map(|i| Row::new(vec![Datum::Int32(i % 10), Datum::Int32(0)]))
            .collect();
        let (out, metrics) = run(plan(Some(10_000)), rows);
        assert_eq!(out.len(), 10);
        assert_eq!(metrics.rows_passed_through.value(), 0);
        let total: i64 = out
            .iter()
            .map(|r| match r.value(1) {
                Datum::Int64(n) => *n,
                other => panic!("{other:?}"),
            })
            .sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn poor_reduction_passes_rows_through() {
        // All keys distinct: the tables stop growing once they pass the L3
        // tier with no reduction, and the remaining rows stream through.
        // Output row count must still equal the input row count.
        let rows: Vec<Row> = (0..100_000)
            .map(|i| Row::new(vec![Datum::Int32(i), Datum::Int32(0)]))
            .collect();
        let (out, metrics) = run(plan(Some(100_000)), rows);
        assert_eq!(out.len(), 100_000);
        assert!(
            metrics.rows_passed_through.value() > 0,
            "distinct keys should defeat the pre-aggregation"
        );
        // Every output row carries COUNT = 1.
        for row in &out {
            assert_eq!(row.value(1), &Datum::Int64(1));
        }
    }

    #[test]
    fn pass_through_preserves_input_order() {
        let rows: Vec<Row> = (0..50_000)
            .map(|i| Row::new(vec![Datum::Int32(i), Datum::Int32(0)]))
            .collect();
        let env = RuntimeEnvBuilder::new().build().unwrap();
        let options = ExecOptions::default().with_streaming_preaggregation(true);
        let mut agg = StreamingPreAggregator::try_new(
            plan(Some(50_000)),
            options,
            env,
            TaskContext::new(),
        )
        .unwrap();
        let mut source = MemorySource::new(rows, 512);
        let mut passed = Vec::new();
        // Drain only the Reading phase output (pass-through rows).
        while let Some(batch) = agg.get_next(&mut source).unwrap() {
            for row in batch.rows() {
                if let Datum::Int32(k) = row.value(0) {
                    passed.push(*k);
                }
            }
        }
        // The pass-through prefix of the output preserves input order.
        let pass_count = agg.metrics().rows_passed_through.value();
        let prefix = &passed[..pass_count];
        let mut sorted = prefix.to_vec();
        sorted.sort_unstable();
        assert!(
            prefix.windows(2).all(|w| w[0] < w[1]),
            "pass-through rows arrived out of order"
        );
        assert_eq!(sorted.len(), pass_count);
    }
}
