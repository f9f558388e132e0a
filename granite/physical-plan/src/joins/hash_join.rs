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

//! Partitioned, spill-aware hash join.
//!
//! The build side is partitioned by the top bits of the key hash; each
//! partition builds a hash table over its build stream, spilling partitions
//! whenever memory runs short. Probe rows against in-memory partitions are
//! joined immediately; rows for spilled partitions are buffered in the
//! partition's probe stream and joined later, either by rebuilding the
//! partition at the same level (when it fits) or by repartitioning it one
//! level deeper with a fresh hash seed. Right/full outer joins drain
//! unmatched build rows after each partition's probe side finishes.
//!
//! A partition whose hash table has produced any probe match is never
//! spilled, regardless of the join op: emitted matches cannot be reconciled
//! with a later replay, and for outer/anti ops the matched bits themselves
//! are load-bearing.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use granite_common::config::{ExecOptions, PrefetchMode, RuntimeFilterMode};
use granite_common::{
    internal_err, resources_granite_err, QueryError, Result, Row, RowBatch,
};
use granite_execution::memory_pool::{MemoryConsumer, MemoryLimit, MemoryReservation};
use granite_execution::tuple_stream::{RowIdx, TupleStream};
use granite_execution::{RuntimeEnv, TaskContext};
use log::debug;

use crate::hash_table::ctx::HashTableCtx;
use crate::hash_table::{HashTable, HtPos, InsertOutcome, BUCKET_NOT_FOUND};
use crate::metrics::JoinMetrics;
use crate::source::BatchSource;

use super::{JoinOp, JoinPlan, RuntimeFilterBank};

/// One shard of build data with the probe rows buffered against it.
struct JoinPartition {
    level: usize,
    is_spilled: bool,
    is_closed: bool,
    hash_tbl: Option<HashTable>,
    build_rows: Option<TupleStream>,
    probe_rows: Option<TupleStream>,
}

impl JoinPartition {
    fn build_num_rows(&self) -> u64 {
        self.build_rows.as_ref().map(|s| s.num_rows()).unwrap_or(0)
    }

    /// Bytes freed if this partition were spilled.
    fn spillable_size(&self) -> usize {
        self.hash_tbl.as_ref().map(|t| t.byte_size()).unwrap_or(0)
            + self
                .build_rows
                .as_ref()
                .map(|s| s.bytes_in_mem())
                .unwrap_or(0)
            + self
                .probe_rows
                .as_ref()
                .map(|s| s.bytes_in_mem())
                .unwrap_or(0)
    }

    /// A spill candidate must never have produced a probe match, whatever
    /// the join op: the rows emitted against it cannot be taken back, and a
    /// replay of the partition would produce them again.
    fn can_spill(&self) -> bool {
        !self.is_spilled
            && !self.is_closed
            && self
                .hash_tbl
                .as_ref()
                .map(|t| !t.has_matches())
                .unwrap_or(true)
    }

    /// Releases the partition. With `reclaim` the streams are handed off to
    /// the output batch instead of being closed immediately, so rows that
    /// reference them stay valid until the consumer is done.
    fn close(&mut self, reclaim: Option<&mut Vec<Box<dyn Any + Send>>>) {
        self.hash_tbl = None;
        match reclaim {
            Some(reclaim) => {
                if let Some(stream) = self.build_rows.take() {
                    reclaim.push(Box::new(stream));
                }
                if let Some(stream) = self.probe_rows.take() {
                    reclaim.push(Box::new(stream));
                }
            }
            None => {
                if let Some(mut stream) = self.build_rows.take() {
                    stream.close();
                }
                if let Some(mut stream) = self.probe_rows.take() {
                    stream.close();
                }
            }
        }
        self.is_closed = true;
    }
}

/// Null-aware anti join side state: build rows whose key is NULL, probe rows
/// whose key is NULL, and the match bitmap over the latter.
struct NullAwareState {
    build_rows: TupleStream,
    null_probe_rows: TupleStream,
    matched_null_probe: Vec<bool>,
    /// NULL-keyed build rows, resident for the duration of probing (only
    /// needed when residual filters exist).
    null_build_cache: Vec<Row>,
}

#[derive(Clone, Copy)]
enum JoinState {
    /// Streaming the caller's probe input.
    ProcessingProbe,
    /// Streaming a spilled partition's buffered probe rows.
    ProbingSpilledPartition,
    /// Emitting unmatched build rows (right/full outer, right anti).
    DrainUnmatched { partition: usize, pos: Option<HtPos> },
    /// Closing the current level's partitions and queueing spilled ones.
    Cleanup,
    PickSpilledPartition,
    /// Final pairwise pass for the null-aware anti join.
    NullAwareEval,
    OutputNullAwareProbe { next: usize },
    Done,
}

pub struct PartitionedHashJoin {
    plan: JoinPlan,
    options: ExecOptions,
    env: Arc<RuntimeEnv>,
    task: Arc<TaskContext>,
    metrics: JoinMetrics,

    ctx: HashTableCtx,
    stores_nulls: bool,
    reservation: MemoryReservation,

    state: JoinState,
    partitions: Vec<JoinPartition>,
    spilled_partitions: VecDeque<JoinPartition>,
    /// Probing a rebuilt spilled partition: all probe rows target
    /// `partitions[0]`.
    single_partition_mode: bool,
    /// The probe stream currently being replayed (spilled-partition work).
    current_probe: Option<TupleStream>,

    null_aware: Option<NullAwareState>,
    /// Unmatched null-probe rows staged for output.
    null_probe_output: Vec<Row>,

    filter_bank: RuntimeFilterBank,
    total_build_rows: u64,

    /// Streams of closed partitions, attached to the next output batch.
    pending_reclaim: Vec<Box<dyn Any + Send>>,
    /// Scratch: which rows of the current chunk have un-storable NULL keys.
    null_row_scratch: Vec<bool>,
}

impl PartitionedHashJoin {
    pub fn try_new(
        plan: JoinPlan,
        options: ExecOptions,
        env: Arc<RuntimeEnv>,
        task: Arc<TaskContext>,
    ) -> Result<Self> {
        options.validate()?;
        plan.validate()?;
        let stores_nulls = plan.stores_null_keys();
        let finds_nulls: Vec<bool> =
            plan.keys.iter().map(|k| k.is_not_distinct_from).collect();
        let ctx = HashTableCtx::try_new(
            plan.keys.iter().map(|k| Arc::clone(&k.build)).collect(),
            plan.keys.iter().map(|k| Arc::clone(&k.probe)).collect(),
            stores_nulls,
            finds_nulls,
            /* initial_seed */ 1,
            options.max_partition_depth,
            options.batch_size,
        )?;
        let reservation = MemoryConsumer::new(format!("hash-join-{}", plan.operator_id))
            .with_can_spill(true)
            .register(env.memory_pool());

        let filter_bank = if options.runtime_filter_mode == RuntimeFilterMode::Off {
            RuntimeFilterBank::default()
        } else {
            RuntimeFilterBank::new(
                &plan.runtime_filters,
                plan.estimated_build_cardinality.unwrap_or(1024),
                !options.disable_row_runtime_filtering,
            )
        };

        let null_aware = (plan.join_op == JoinOp::NullAwareLeftAnti).then(|| {
            NullAwareState {
                build_rows: TupleStream::new(
                    format!("hash-join-{} null-aware build", plan.operator_id),
                    plan.build_schema.clone(),
                    Arc::clone(&env),
                    reservation.new_empty(),
                ),
                null_probe_rows: TupleStream::new(
                    format!("hash-join-{} null probe", plan.operator_id),
                    plan.probe_schema.clone(),
                    Arc::clone(&env),
                    reservation.new_empty(),
                ),
                matched_null_probe: Vec::new(),
                null_build_cache: Vec::new(),
            }
        });

        Ok(Self {
            plan,
            options,
            env,
            task,
            metrics: JoinMetrics::default(),
            ctx,
            stores_nulls,
            reservation,
            state: JoinState::ProcessingProbe,
            partitions: Vec::new(),
            spilled_partitions: VecDeque::new(),
            single_partition_mode: false,
            current_probe: None,
            null_aware,
            null_probe_output: Vec::new(),
            filter_bank,
            total_build_rows: 0,
            pending_reclaim: Vec::new(),
            null_row_scratch: Vec::new(),
        })
    }

    pub fn metrics(&self) -> &JoinMetrics {
        &self.metrics
    }

    /// Filters published after the level-0 build.
    pub fn runtime_filters(&self) -> &[super::RuntimeFilter] {
        self.filter_bank.published()
    }

    fn fanout(&self) -> usize {
        self.options.partition_fanout()
    }

    fn partition_bits(&self) -> u32 {
        self.options.partition_fanout_bits
    }

    fn mem_limit_error(&self, context: &str) -> QueryError {
        let level = self.partitions.first().map(|p| p.level).unwrap_or(0);
        resources_granite_err!(
            "Memory limit exceeded in hash join while {context} \
             (operator id {}, join op {}, partitioning level {level}, {} build rows, {} partitions spilled)",
            self.plan.operator_id,
            self.plan.join_op,
            self.total_build_rows,
            self.metrics.num_spilled_partitions.value()
        )
    }

    fn create_partitions(&mut self, level: usize) -> Result<Vec<JoinPartition>> {
        let mut partitions = Vec::with_capacity(self.fanout());
        for i in 0..self.fanout() {
            partitions.push(JoinPartition {
                level,
                is_spilled: false,
                is_closed: false,
                hash_tbl: None,
                build_rows: Some(TupleStream::new(
                    format!(
                        "hash-join-{} partition-{i} build (level {level})",
                        self.plan.operator_id
                    ),
                    self.plan.build_schema.clone(),
                    Arc::clone(&self.env),
                    self.reservation.new_empty(),
                )),
                probe_rows: Some(TupleStream::new(
                    format!(
                        "hash-join-{} partition-{i} probe (level {level})",
                        self.plan.operator_id
                    ),
                    self.plan.probe_schema.clone(),
                    Arc::clone(&self.env),
                    self.reservation.new_empty(),
                )),
            });
        }
        self.metrics.partitions_created.add(self.fanout());
        self.metrics.max_partition_level.set(level);
        Ok(partitions)
    }

    /// Consumes the entire build side, partitions it and builds the level-0
    /// hash tables.
    pub fn open(&mut self, build_input: &mut dyn BatchSource) -> Result<()> {
        let build_timer = self.metrics.build_time.clone();
        let _guard = build_timer.timer();
        self.partitions = self.create_partitions(0)?;
        while let Some(batch) = build_input.next_batch()? {
            self.task.check_cancelled()?;
            self.total_build_rows += batch.num_rows() as u64;
            self.metrics.build_rows.add(batch.num_rows());
            self.partition_build_batch(batch.rows())?;
        }
        self.build_hash_tables()?;
        self.filter_bank.publish(self.total_build_rows);
        self.prepare_null_build_cache()?;
        self.state = JoinState::ProcessingProbe;
        Ok(())
    }

    /// Routes one batch of build rows into the partitions' build streams.
    fn partition_build_batch(&mut self, rows: &[Row]) -> Result<()> {
        let chunk_size = match self.options.prefetch_mode {
            PrefetchMode::HtBucket => self.ctx.cache().capacity(),
            PrefetchMode::None => 1,
        };
        let collect_filters = !self.filter_bank.is_empty()
            && self.partitions.first().map(|p| p.level) == Some(0);
        for chunk in rows.chunks(chunk_size) {
            self.task.check_cancelled()?;
            self.ctx.cache_mut().reset();
            self.null_row_scratch.clear();
            self.null_row_scratch.resize(chunk.len(), false);
            for (i, row) in chunk.iter().enumerate() {
                self.ctx.cache_mut().set_cur_idx(i);
                let has_null = self.ctx.eval_build_row(row)?;
                if has_null && !self.stores_nulls {
                    self.null_row_scratch[i] = true;
                    continue;
                }
                let hash = self.ctx.hash_current_row();
                self.ctx.cache_mut().set_cur_hash(hash);
            }
            for (i, row) in chunk.iter().enumerate() {
                if self.null_row_scratch[i] {
                    // NULL keys never match under plain equality. The
                    // null-aware anti join still needs the rows for its
                    // pairwise pass; everyone else drops them.
                    if self.null_aware.is_some() {
                        self.append_null_aware_build(row)?;
                    }
                    continue;
                }
                if collect_filters {
                    let values = self.ctx.eval_build_values(row)?;
                    self.filter_bank.insert(&values);
                }
                let hash = self.ctx.cache().hash_at(i);
                let part_idx = (hash >> (32 - self.partition_bits())) as usize;
                loop {
                    let appended = self.partitions[part_idx]
                        .build_rows
                        .as_mut()
                        .expect("build stream open")
                        .add_row(row)?;
                    if appended.is_some() {
                        break;
                    }
                    self.spill_largest_partition("partitioning the build side")?;
                }
            }
        }
        Ok(())
    }

    fn append_null_aware_build(&mut self, row: &Row) -> Result<()> {
        loop {
            let appended = self
                .null_aware
                .as_mut()
                .expect("null-aware state")
                .build_rows
                .add_row(row)?;
            if appended.is_some() {
                return Ok(());
            }
            self.spill_largest_partition("buffering a NULL build row")?;
        }
    }

    /// Builds hash tables for every non-empty unspilled partition, spilling
    /// those whose table does not fit, then makes sure each spilled
    /// partition's probe stream has an I/O-sized write buffer.
    fn build_hash_tables(&mut self) -> Result<()> {
        for idx in 0..self.partitions.len() {
            if self.partitions[idx].is_closed || self.partitions[idx].is_spilled {
                continue;
            }
            if self.partitions[idx].build_num_rows() == 0 {
                self.partitions[idx].close(None);
                continue;
            }
            if !self.build_table_for(idx)? {
                self.spill_partition(idx, "building its hash table")?;
            }
        }

        // The build side of this level is complete: spilled partitions keep
        // no resident build blocks. This must happen before probe buffers
        // are reserved, or the dead write blocks could starve them.
        for partition in &mut self.partitions {
            if partition.is_closed || !partition.is_spilled {
                continue;
            }
            if let Some(stream) = partition.build_rows.as_mut() {
                stream.unpin_stream(true)?;
            }
        }

        // Reserving an I/O buffer can itself force more partitions to spill,
        // so drain a queue rather than a single pass.
        let mut needs_buffer: VecDeque<usize> = (0..self.partitions.len())
            .filter(|&i| {
                let p = &self.partitions[i];
                !p.is_closed
                    && p.is_spilled
                    && p.probe_rows
                        .as_ref()
                        .map(|s| s.using_small_buffers())
                        .unwrap_or(false)
            })
            .collect();
        while let Some(idx) = needs_buffer.pop_front() {
            loop {
                let got = self.partitions[idx]
                    .probe_rows
                    .as_mut()
                    .expect("probe stream open")
                    .switch_to_io_buffers()?;
                if got {
                    break;
                }
                let spilled = self.spill_largest_partition(
                    "reserving a probe buffer for a spilled partition",
                )?;
                if self.partitions[spilled]
                    .probe_rows
                    .as_ref()
                    .map(|s| s.using_small_buffers())
                    .unwrap_or(false)
                {
                    needs_buffer.push_back(spilled);
                }
            }
        }

        // Spilled partitions' probe streams rotate to disk as they fill,
        // holding no more than their write buffer.
        for partition in &mut self.partitions {
            if partition.is_closed || !partition.is_spilled {
                continue;
            }
            if let Some(stream) = partition.probe_rows.as_mut() {
                stream.unpin_stream(false)?;
            }
            // A late spill may have happened after the pass above.
            if let Some(stream) = partition.build_rows.as_mut() {
                stream.unpin_stream(true)?;
            }
        }

        let total: u64 = self.partitions.iter().map(|p| p.build_num_rows()).sum();
        if total > 0 {
            let largest = self
                .partitions
                .iter()
                .map(|p| p.build_num_rows())
                .max()
                .unwrap_or(0);
            self.metrics
                .largest_partition_percent
                .set((largest * 100 / total) as usize);
        }
        Ok(())
    }

    /// Builds partition `idx`'s hash table over its (pinned) build stream.
    /// Returns false if memory ran out part way; the table is discarded and
    /// the caller spills the partition.
    fn build_table_for(&mut self, idx: usize) -> Result<bool> {
        let num_rows = self.partitions[idx].build_num_rows();
        let buckets = ((num_rows as f64 / crate::hash_table::MAX_FILL_FACTOR) as usize) + 1;
        let table = HashTable::try_new(
            self.options.enable_quadratic_probing,
            /* stores_duplicates */ true,
            buckets,
            Some(1usize << (32 - self.partition_bits())),
            self.reservation.new_empty(),
            self.metrics.ht_stats.clone(),
        )?;
        let mut table = match table {
            Some(table) => table,
            None => return Ok(false),
        };

        let maintenance_interval =
            TaskContext::maintenance_interval(self.options.batch_size);
        {
            let stream = self.partitions[idx].build_rows.as_ref().unwrap();
            let fetch = |r: u64| stream.read_row(RowIdx::from_u64(r));
            for (n, item) in stream.pinned_rows().enumerate() {
                if n % maintenance_interval == 0 {
                    self.task.check_cancelled()?;
                }
                let (row_idx, row) = item?;
                self.ctx.cache_mut().reset();
                let has_null = self.ctx.eval_build_row(&row)?;
                if has_null && !self.stores_nulls {
                    continue;
                }
                let hash = self.ctx.hash_current_row();
                loop {
                    match table.insert::<false>(
                        &self.ctx,
                        &fetch,
                        hash,
                        row_idx.to_u64(),
                        0,
                    )? {
                        InsertOutcome::Inserted => break,
                        InsertOutcome::NeedsResize => {
                            if !table.check_and_resize(1)? {
                                return Ok(false);
                            }
                        }
                        InsertOutcome::NoMemory => return Ok(false),
                        InsertOutcome::DuplicateKey(_) => {
                            return internal_err!(
                                "join hash tables store duplicates"
                            )
                        }
                    }
                }
            }
        }
        // Probe rows for an in-memory partition are joined immediately and
        // never buffered.
        if let Some(mut probe) = self.partitions[idx].probe_rows.take() {
            if probe.num_rows() > 0 {
                self.partitions[idx].probe_rows = Some(probe);
            } else {
                probe.close();
            }
        }
        self.partitions[idx].hash_tbl = Some(table);
        Ok(true)
    }

    /// Loads the NULL-keyed build rows needed to decide unmatched probe rows
    /// when residual filters exist.
    fn prepare_null_build_cache(&mut self) -> Result<()> {
        if self.plan.other_filters.is_empty() {
            return Ok(());
        }
        let Some(state) = self.null_aware.as_mut() else {
            return Ok(());
        };
        if state.build_rows.num_rows() == 0 {
            return Ok(());
        }
        match state.build_rows.get_rows()? {
            Some(rows) => state.null_build_cache = rows,
            None => return Err(null_aware_unbounded(true)),
        }
        Ok(())
    }

    fn spill_largest_partition(&mut self, context: &str) -> Result<usize> {
        let candidate = self
            .partitions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.can_spill())
            .max_by_key(|(_, p)| p.spillable_size())
            .map(|(i, _)| i);
        match candidate {
            Some(idx) => {
                self.spill_partition(idx, context)?;
                Ok(idx)
            }
            None => Err(self.mem_limit_error(context)),
        }
    }

    /// Spills partition `idx`: drops its hash table and unpins its streams.
    fn spill_partition(&mut self, idx: usize, context: &str) -> Result<()> {
        let partition = &mut self.partitions[idx];
        debug_assert!(partition.can_spill());
        debug!(
            "spilling join partition {idx} ({} build rows) while {context}",
            partition.build_num_rows()
        );
        partition.hash_tbl = None;
        if let Some(stream) = partition.build_rows.as_mut() {
            stream.unpin_stream(false)?;
        }
        if partition.probe_rows.is_none() {
            // The probe stream was closed when the table was built; a
            // spilled partition needs one again, rotating to disk as it
            // fills.
            let mut probe = TupleStream::new(
                format!(
                    "hash-join-{} partition-{idx} probe (respilled level {})",
                    self.plan.operator_id, partition.level
                ),
                self.plan.probe_schema.clone(),
                Arc::clone(&self.env),
                self.reservation.new_empty(),
            );
            probe.switch_to_io_buffers()?;
            probe.unpin_stream(false)?;
            partition.probe_rows = Some(probe);
        }
        let partition = &mut self.partitions[idx];
        partition.is_spilled = true;
        self.metrics.num_spilled_partitions.add(1);
        Ok(())
    }

    /// Produces the next batch of join output. `probe_input` is the probe
    /// side; it is only pulled while the operator is in its probe phase.
    pub fn get_next(
        &mut self,
        probe_input: &mut dyn BatchSource,
    ) -> Result<Option<RowBatch>> {
        let probe_timer = self.metrics.probe_time.clone();
        let _guard = probe_timer.timer();
        let mut out: Vec<Row> = Vec::new();
        loop {
            self.task.check_cancelled()?;
            if out.len() >= self.options.batch_size {
                return Ok(Some(self.make_batch(out)));
            }
            match self.state {
                JoinState::ProcessingProbe => match probe_input.next_batch()? {
                    Some(batch) => {
                        self.metrics.probe_rows.add(batch.num_rows());
                        let rows = batch.rows().to_vec();
                        self.process_probe_batch(&rows, &mut out)?;
                    }
                    None => self.begin_drain_or_cleanup(),
                },
                JoinState::ProbingSpilledPartition => {
                    let (rows, eos) = {
                        let stream = self
                            .current_probe
                            .as_mut()
                            .expect("spilled probe stream");
                        let mut batch = RowBatch::new(self.options.batch_size);
                        let eos = stream.get_next(&mut batch)?;
                        (batch.take_rows(), eos)
                    };
                    self.metrics.probe_rows.add(rows.len());
                    self.process_probe_batch(&rows, &mut out)?;
                    if eos {
                        if let Some(mut stream) = self.current_probe.take() {
                            stream.close();
                        }
                        self.begin_drain_or_cleanup();
                    }
                }
                JoinState::DrainUnmatched { partition, pos } => {
                    let next = self.drain_unmatched(partition, pos, &mut out);
                    match next {
                        Some((partition, pos)) => {
                            self.state = JoinState::DrainUnmatched { partition, pos };
                            // Batch is full; emit it.
                            return Ok(Some(self.make_batch(out)));
                        }
                        None => self.state = JoinState::Cleanup,
                    }
                }
                JoinState::Cleanup => {
                    self.cleanup_hash_partitions()?;
                    self.state = JoinState::PickSpilledPartition;
                }
                JoinState::PickSpilledPartition => {
                    if !self.prepare_next_spilled_partition()? {
                        self.state = if self.null_aware.is_some() {
                            JoinState::NullAwareEval
                        } else {
                            JoinState::Done
                        };
                    }
                }
                JoinState::NullAwareEval => {
                    self.finish_null_aware_eval()?;
                    self.state = JoinState::OutputNullAwareProbe { next: 0 };
                }
                JoinState::OutputNullAwareProbe { next } => {
                    let next = self.output_null_aware_probe(next, &mut out);
                    match next {
                        Some(next) => {
                            self.state = JoinState::OutputNullAwareProbe { next };
                            return Ok(Some(self.make_batch(out)));
                        }
                        None => self.state = JoinState::Done,
                    }
                }
                JoinState::Done => {
                    return Ok(if out.is_empty() {
                        self.pending_reclaim.clear();
                        None
                    } else {
                        Some(self.make_batch(out))
                    });
                }
            }
        }
    }

    fn make_batch(&mut self, rows: Vec<Row>) -> RowBatch {
        self.metrics.output_rows.add(rows.len());
        let mut batch = RowBatch::new(rows.len().max(1));
        for row in rows {
            batch.add_row(row);
        }
        for resource in self.pending_reclaim.drain(..) {
            batch.attach_resource(resource);
        }
        batch
    }

    /// After the probe side of the current partitions is exhausted: start
    /// the unmatched-build drain if the op needs one, else go clean up.
    fn begin_drain_or_cleanup(&mut self) {
        if self.plan.join_op.drains_unmatched_build() {
            let first = self.first_drain_pos(0);
            self.state = match first {
                Some((partition, pos)) => JoinState::DrainUnmatched {
                    partition,
                    pos: Some(pos),
                },
                None => JoinState::Cleanup,
            };
        } else {
            self.state = JoinState::Cleanup;
        }
    }

    fn first_drain_pos(&self, from: usize) -> Option<(usize, HtPos)> {
        (from..self.partitions.len()).find_map(|i| {
            let partition = &self.partitions[i];
            if partition.is_closed || partition.is_spilled {
                return None;
            }
            partition
                .hash_tbl
                .as_ref()
                .and_then(|t| t.first_unmatched())
                .map(|pos| (i, pos))
        })
    }

    /// Emits unmatched build rows. Returns the resume position when `out`
    /// fills up, `None` when the drain is complete.
    fn drain_unmatched(
        &mut self,
        mut partition: usize,
        mut pos: Option<HtPos>,
        out: &mut Vec<Row>,
    ) -> Option<(usize, Option<HtPos>)> {
        let null_probe = Row::nulls(self.plan.probe_schema.num_columns());
        loop {
            let cur = match pos {
                Some(p) => p,
                None => match self.first_drain_pos(partition + 1) {
                    Some((next_partition, p)) => {
                        partition = next_partition;
                        p
                    }
                    None => return None,
                },
            };
            if out.len() >= self.options.batch_size {
                return Some((partition, Some(cur)));
            }
            let part = &self.partitions[partition];
            let tbl = part.hash_tbl.as_ref().expect("drain needs a table");
            let build_row = part
                .build_rows
                .as_ref()
                .expect("build stream open")
                .read_row(RowIdx::from_u64(tbl.row_ref(cur)));
            match build_row {
                Ok(build_row) => match self.plan.join_op {
                    JoinOp::RightAnti => out.push(build_row),
                    JoinOp::RightOuter | JoinOp::FullOuter => {
                        out.push(Row::concat(&null_probe, &build_row))
                    }
                    _ => {}
                },
                // Surfacing the error here would lose the scan position;
                // unmatched rows live in a pinned stream, so reads are
                // infallible in practice.
                Err(_) => debug_assert!(false, "unreadable unmatched build row"),
            }
            pos = tbl.next_unmatched(&cur);
        }
    }

    /// Closes the current level's partitions: in-memory ones hand their
    /// streams to the output, spilled ones queue for reprocessing.
    fn cleanup_hash_partitions(&mut self) -> Result<()> {
        let needs_null_eval =
            self.null_aware.is_some() && !self.plan.other_filters.is_empty();
        for mut partition in self.partitions.drain(..).collect::<Vec<_>>() {
            if partition.is_closed {
                continue;
            }
            if partition.is_spilled {
                if let Some(stream) = partition.build_rows.as_mut() {
                    stream.unpin_stream(true)?;
                }
                if let Some(stream) = partition.probe_rows.as_mut() {
                    stream.unpin_stream(true)?;
                }
                // Depth-first: finer partitions complete sooner and release
                // their blocks earlier.
                self.spilled_partitions.push_front(partition);
            } else {
                if needs_null_eval {
                    if let Some(stream) = partition.build_rows.as_mut() {
                        let rows = match stream.get_rows()? {
                            Some(rows) => rows,
                            None => return Err(null_aware_unbounded(true)),
                        };
                        self.evaluate_null_probe(&rows)?;
                    }
                } else if self.null_aware.is_some() {
                    // Exists-semantics shortcut: with no residual filters,
                    // any build row matches a NULL probe row.
                    if partition.build_num_rows() > 0 {
                        self.mark_all_null_probes_matched();
                    }
                }
                partition.close(Some(&mut self.pending_reclaim));
            }
        }
        self.single_partition_mode = false;
        Ok(())
    }

    fn mark_all_null_probes_matched(&mut self) {
        if let Some(state) = self.null_aware.as_mut() {
            for matched in state.matched_null_probe.iter_mut() {
                *matched = true;
            }
        }
    }

    /// Pairwise-evaluates the unmatched NULL probe rows against `build_rows`
    /// using the residual filters.
    fn evaluate_null_probe(&mut self, build_rows: &[Row]) -> Result<()> {
        let timer = self.metrics.null_aware_eval_time.clone();
        let _guard = timer.timer();
        let filters = &self.plan.other_filters;
        let Some(state) = self.null_aware.as_mut() else {
            return Ok(());
        };
        if state.null_probe_rows.num_rows() == 0 || build_rows.is_empty() {
            return Ok(());
        }
        let probe_rows = match state.null_probe_rows.get_rows()? {
            Some(rows) => rows,
            None => return Err(null_aware_unbounded(false)),
        };
        debug_assert_eq!(probe_rows.len(), state.matched_null_probe.len());
        for (i, probe_row) in probe_rows.iter().enumerate() {
            if state.matched_null_probe[i] {
                continue;
            }
            for build_row in build_rows {
                let mut all_pass = true;
                for filter in filters {
                    if !filter.evaluate(probe_row, build_row)? {
                        all_pass = false;
                        break;
                    }
                }
                if all_pass {
                    state.matched_null_probe[i] = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Final null-aware pass: the NULL-keyed build rows join every remaining
    /// unmatched NULL probe row, then the survivors are staged for output.
    fn finish_null_aware_eval(&mut self) -> Result<()> {
        let Some(state) = self.null_aware.as_mut() else {
            return Ok(());
        };
        if state.build_rows.num_rows() > 0 {
            if self.plan.other_filters.is_empty() {
                self.mark_all_null_probes_matched();
            } else {
                let build_rows = match self
                    .null_aware
                    .as_mut()
                    .unwrap()
                    .build_rows
                    .get_rows()?
                {
                    Some(rows) => rows,
                    None => return Err(null_aware_unbounded(true)),
                };
                self.evaluate_null_probe(&build_rows)?;
            }
        }

        let state = self.null_aware.as_mut().unwrap();
        if state.null_probe_rows.num_rows() == 0 {
            return Ok(());
        }
        let probe_rows = match state.null_probe_rows.get_rows()? {
            Some(rows) => rows,
            None => return Err(null_aware_unbounded(false)),
        };
        self.null_probe_output = probe_rows
            .into_iter()
            .zip(state.matched_null_probe.iter())
            .filter(|(_, matched)| !**matched)
            .map(|(row, _)| row)
            .collect();
        Ok(())
    }

    fn output_null_aware_probe(
        &mut self,
        mut next: usize,
        out: &mut Vec<Row>,
    ) -> Option<usize> {
        while next < self.null_probe_output.len() {
            if out.len() >= self.options.batch_size {
                return Some(next);
            }
            out.push(self.null_probe_output[next].clone());
            next += 1;
        }
        None
    }

    /// Pops the next spilled partition and either rebuilds it at the same
    /// level (when its estimated footprint fits in memory) or repartitions
    /// it one level deeper. Returns false when no spilled work remains.
    fn prepare_next_spilled_partition(&mut self) -> Result<bool> {
        let Some(mut partition) = self.spilled_partitions.pop_front() else {
            return Ok(false);
        };
        let num_rows = partition.build_num_rows();
        let build_bytes = partition
            .build_rows
            .as_ref()
            .map(|s| s.bytes_in_mem() + s.bytes_unpinned())
            .unwrap_or(0);
        let estimate = build_bytes + HashTable::estimate_size(num_rows);
        let fits = match self.env.memory_pool().memory_limit() {
            MemoryLimit::Infinite => true,
            MemoryLimit::Finite(limit) => {
                estimate <= limit.saturating_sub(self.env.memory_pool().reserved())
            }
        };

        if fits && partition.build_rows.as_mut().unwrap().pin_stream()? {
            // Hash at the level this partition was written at, so the table
            // agrees with the hashes that routed its rows.
            self.ctx.set_level(partition.level)?;
            partition.is_spilled = false;
            self.partitions = vec![partition];
            if self.build_table_for(0)? {
                debug!(
                    "probing spilled join partition at level {} ({num_rows} build rows)",
                    self.partitions[0].level
                );
                self.single_partition_mode = true;
                self.start_probing_partition_stream(0)?;
                return Ok(true);
            }
            // Not enough memory after all: back out and repartition.
            let mut partition = self.partitions.pop().expect("partition present");
            partition.hash_tbl = None;
            if let Some(stream) = partition.build_rows.as_mut() {
                stream.unpin_stream(true)?;
            }
            partition.is_spilled = true;
            return self.repartition(partition);
        }
        self.repartition(partition)
    }

    /// Moves partition `idx`'s probe stream into the replay cursor and
    /// enters the spilled-probing state.
    fn start_probing_partition_stream(&mut self, idx: usize) -> Result<()> {
        let mut probe = match self.partitions[idx].probe_rows.take() {
            Some(stream) => stream,
            None => {
                // Never received a probe row; nothing to replay.
                self.current_probe = None;
                self.begin_drain_or_cleanup();
                return Ok(());
            }
        };
        if probe.num_rows() > 0 {
            if !probe.prepare_for_read(false)? {
                return Err(self.mem_limit_error("reading buffered probe rows"));
            }
            self.current_probe = Some(probe);
            self.state = JoinState::ProbingSpilledPartition;
        } else {
            probe.close();
            self.current_probe = None;
            self.begin_drain_or_cleanup();
        }
        Ok(())
    }

    /// Repartitions a spilled partition's build and probe streams one level
    /// deeper.
    fn repartition(&mut self, mut partition: JoinPartition) -> Result<bool> {
        let level = partition.level + 1;
        if level >= self.options.max_partition_depth {
            return Err(resources_granite_err!(
                "Memory limit exceeded in hash join (operator id {}): \
                 partitioning depth reached the maximum of {} levels",
                self.plan.operator_id,
                self.options.max_partition_depth
            ));
        }
        let input_rows = partition.build_num_rows();
        debug!("repartitioning join partition of {input_rows} build rows to level {level}");
        self.metrics.num_repartitions.add(1);
        self.ctx.set_level(level)?;
        self.partitions = self.create_partitions(level)?;
        self.single_partition_mode = false;

        {
            let build = partition.build_rows.as_mut().expect("build stream open");
            if build.num_rows() > 0 {
                if !build.prepare_for_read(false)? {
                    return Err(self.mem_limit_error("reading a spilled build stream"));
                }
            }
        }
        if input_rows > 0 {
            loop {
                let (rows, eos) = {
                    let build =
                        partition.build_rows.as_mut().expect("build stream open");
                    let mut batch = RowBatch::new(self.options.batch_size);
                    let eos = build.get_next(&mut batch)?;
                    (batch.take_rows(), eos)
                };
                self.partition_build_batch(&rows)?;
                if eos {
                    break;
                }
            }
        }
        self.build_hash_tables()?;

        // Only spilled children matter: an in-memory child has its hash
        // table and will not recurse further.
        let largest = self
            .partitions
            .iter()
            .filter(|p| p.is_spilled)
            .map(|p| p.build_num_rows())
            .max()
            .unwrap_or(0);
        if largest >= input_rows && input_rows > 0 {
            return Err(resources_granite_err!(
                "Memory limit exceeded in hash join (operator id {}): \
                 repartitioning {input_rows} build rows at level {level} made no \
                 progress (largest child holds {largest} rows)",
                self.plan.operator_id
            ));
        }

        // Replay the buffered probe rows through the new partitions.
        let mut probe = match partition.probe_rows.take() {
            Some(stream) => stream,
            None => return internal_err!("spilled partition lost its probe stream"),
        };
        partition.close(None);
        if probe.num_rows() > 0 {
            if !probe.prepare_for_read(false)? {
                return Err(self.mem_limit_error("reading buffered probe rows"));
            }
            self.current_probe = Some(probe);
            self.state = JoinState::ProbingSpilledPartition;
        } else {
            probe.close();
            self.current_probe = None;
            self.begin_drain_or_cleanup();
        }
        Ok(true)
    }

    /// Joins one batch of probe rows against the current partitions.
    fn process_probe_batch(&mut self, rows: &[Row], out: &mut Vec<Row>) -> Result<()> {
        let chunk_size = match self.options.prefetch_mode {
            PrefetchMode::HtBucket => self.ctx.cache().capacity(),
            PrefetchMode::None => 1,
        };
        for chunk in rows.chunks(chunk_size) {
            self.task.check_cancelled()?;
            self.ctx.cache_mut().reset();
            self.null_row_scratch.clear();
            self.null_row_scratch.resize(chunk.len(), false);
            for (i, row) in chunk.iter().enumerate() {
                self.ctx.cache_mut().set_cur_idx(i);
                let has_null = self.ctx.eval_probe_row(row)?;
                if has_null && !self.stores_nulls {
                    self.null_row_scratch[i] = true;
                    continue;
                }
                let hash = self.ctx.hash_current_row();
                self.ctx.cache_mut().set_cur_hash(hash);
            }
            for (i, row) in chunk.iter().enumerate() {
                if self.null_row_scratch[i] {
                    self.process_null_probe_row(row, out)?;
                    continue;
                }
                let hash = self.ctx.cache().hash_at(i);
                self.process_probe_row(row, hash, i, out)?;
            }
        }
        Ok(())
    }

    /// A probe row whose key contains a NULL that the tables do not store:
    /// it can never match through the hash table.
    fn process_null_probe_row(&mut self, row: &Row, out: &mut Vec<Row>) -> Result<()> {
        match self.plan.join_op {
            JoinOp::NullAwareLeftAnti => loop {
                let state = self.null_aware.as_mut().expect("null-aware state");
                if state.null_probe_rows.add_row(row)?.is_some() {
                    state.matched_null_probe.push(false);
                    return Ok(());
                }
                self.spill_largest_partition("buffering a NULL probe row")?;
            },
            JoinOp::LeftOuter | JoinOp::FullOuter => {
                out.push(Row::concat(
                    row,
                    &Row::nulls(self.plan.build_schema.num_columns()),
                ));
                Ok(())
            }
            JoinOp::LeftAnti => {
                out.push(row.clone());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn process_probe_row(
        &mut self,
        row: &Row,
        hash: u32,
        cache_idx: usize,
        out: &mut Vec<Row>,
    ) -> Result<()> {
        let part_idx = if self.single_partition_mode {
            0
        } else {
            (hash >> (32 - self.partition_bits())) as usize
        };
        loop {
            let partition = &self.partitions[part_idx];
            if partition.is_closed {
                // The build side of this partition was empty.
                return self.emit_unmatched_probe(row, out);
            }
            if partition.is_spilled {
                let appended = self.partitions[part_idx]
                    .probe_rows
                    .as_mut()
                    .expect("probe stream open")
                    .add_row(row)?;
                if appended.is_some() {
                    return Ok(());
                }
                self.spill_largest_partition("buffering a probe row")?;
                continue;
            }
            break;
        }

        // Collect the matching build rows (hash and key match, residual
        // filters pass), then emit and mark per the join op. The matched bit
        // is captured before marking so RIGHT SEMI can tell first-time
        // matches from rows an earlier probe already emitted.
        let mut matches: Vec<(HtPos, Row, bool)> = Vec::new();
        {
            let partition = &self.partitions[part_idx];
            let tbl = partition.hash_tbl.as_ref().expect("in-memory partition");
            let build_stream = partition.build_rows.as_ref().expect("build stream open");
            let fetch = |r: u64| build_stream.read_row(RowIdx::from_u64(r));
            let (bucket, found) = tbl.probe::<false>(&self.ctx, &fetch, hash, cache_idx)?;
            if found && bucket != BUCKET_NOT_FOUND {
                let semi_short_circuit = matches!(
                    self.plan.join_op,
                    JoinOp::LeftSemi | JoinOp::LeftAnti | JoinOp::NullAwareLeftAnti
                ) && self.plan.other_filters.is_empty();
                let mut pos = Some(tbl.first_match(bucket));
                while let Some(p) = pos {
                    let build_row = fetch(tbl.row_ref(p))?;
                    let mut all_pass = true;
                    for filter in &self.plan.other_filters {
                        if !filter.evaluate(row, &build_row)? {
                            all_pass = false;
                            break;
                        }
                    }
                    if all_pass {
                        matches.push((p, build_row, tbl.is_matched(p)));
                        if semi_short_circuit {
                            break;
                        }
                    }
                    pos = tbl.next_match(&p);
                }
            }
        }

        let op = self.plan.join_op;
        if !matches.is_empty() {
            // Every op records the table-level fact, not just the ones that
            // mark individual rows: once a probe row has been emitted (or
            // suppressed) against this build data, the partition must not
            // be spilled and replayed.
            let tbl = self.partitions[part_idx].hash_tbl.as_mut().unwrap();
            tbl.set_has_matches();
            if op.needs_match_marking() {
                for (pos, _, _) in &matches {
                    tbl.mark_matched(*pos);
                }
            }
        }
        match op {
            JoinOp::Inner | JoinOp::RightOuter => {
                for (_, build_row, _) in &matches {
                    out.push(Row::concat(row, build_row));
                }
            }
            JoinOp::LeftOuter | JoinOp::FullOuter => {
                if matches.is_empty() {
                    out.push(Row::concat(
                        row,
                        &Row::nulls(self.plan.build_schema.num_columns()),
                    ));
                } else {
                    for (_, build_row, _) in &matches {
                        out.push(Row::concat(row, build_row));
                    }
                }
            }
            JoinOp::LeftSemi => {
                if !matches.is_empty() {
                    out.push(row.clone());
                }
            }
            JoinOp::LeftAnti | JoinOp::NullAwareLeftAnti => {
                if matches.is_empty() {
                    return self.emit_unmatched_probe(row, out);
                }
            }
            JoinOp::RightSemi => {
                // Each build row is emitted at most once: rows whose matched
                // bit was already set were emitted by an earlier probe.
                for (_, build_row, was_matched) in &matches {
                    if !*was_matched {
                        out.push(build_row.clone());
                    }
                }
            }
            JoinOp::RightAnti => {}
        }
        Ok(())
    }

    /// Emits (or suppresses) a probe row that found no hash match.
    fn emit_unmatched_probe(&mut self, row: &Row, out: &mut Vec<Row>) -> Result<()> {
        match self.plan.join_op {
            JoinOp::LeftOuter | JoinOp::FullOuter => {
                out.push(Row::concat(
                    row,
                    &Row::nulls(self.plan.build_schema.num_columns()),
                ));
            }
            JoinOp::LeftAnti => out.push(row.clone()),
            JoinOp::NullAwareLeftAnti => {
                // An unmatched probe row can still join a NULL-keyed build
                // row through the residual filters; with no filters there is
                // nothing to join it against and it is emitted.
                let mut suppressed = false;
                if !self.plan.other_filters.is_empty() {
                    let state = self.null_aware.as_ref().expect("null-aware state");
                    for build_row in &state.null_build_cache {
                        let mut all_pass = true;
                        for filter in &self.plan.other_filters {
                            if !filter.evaluate(row, build_row)? {
                                all_pass = false;
                                break;
                            }
                        }
                        if all_pass {
                            suppressed = true;
                            break;
                        }
                    }
                }
                if !suppressed {
                    out.push(row.clone());
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// The null-aware anti join cannot stream its pairwise passes; an
/// over-large NULL set fails rather than thrashing.
fn null_aware_unbounded(build_side: bool) -> QueryError {
    resources_granite_err!(
        "Unable to perform the null-aware anti-join: there are too many NULLs \
         on the {} side to bring into memory",
        if build_side { "build" } else { "probe" }
    )
}
