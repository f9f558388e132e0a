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

//! End-to-end aggregation tests, including randomized differential runs
//! against a plain hash map reference with and without a memory limit.

use std::collections::HashMap;
use std::sync::Arc;

use granite_common::config::ExecOptions;
use granite_common::{ColumnType, Datum, Row, RowSchema};
use granite_execution::runtime_env::RuntimeEnvBuilder;
use granite_execution::{RuntimeEnv, TaskContext};
use granite_physical_plan::aggregates::functions::AggFn;
use granite_physical_plan::expr::Column;
use granite_physical_plan::{AggPlan, MemorySource, PartitionedAggregator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn plan(agg_fns: Vec<AggFn>) -> AggPlan {
    AggPlan {
        operator_id: 11,
        input_schema: RowSchema::new(vec![ColumnType::Int32, ColumnType::Int32]),
        grouping_exprs: vec![Arc::new(Column::new(0, ColumnType::Int32))],
        agg_fns,
        needs_finalize: true,
        estimated_input_cardinality: None,
    }
}

fn value_expr() -> Arc<Column> {
    Arc::new(Column::new(1, ColumnType::Int32))
}

fn run(plan: AggPlan, options: ExecOptions, env: Arc<RuntimeEnv>, rows: Vec<Row>) -> Vec<Row> {
    let mut agg =
        PartitionedAggregator::try_new(plan, options.clone(), env, TaskContext::new())
            .unwrap();
    let mut source = MemorySource::new(rows, options.batch_size);
    agg.open(&mut source).unwrap();
    let mut out = Vec::new();
    while let Some(mut batch) = agg.get_next().unwrap() {
        out.extend(batch.take_rows());
    }
    out
}

#[derive(Default, Clone)]
struct Reference {
    count: i64,
    sum: Option<i64>,
    min: Option<i32>,
    max: Option<i32>,
}

fn reference_aggregate(rows: &[(Option<i32>, Option<i32>)]) -> HashMap<Option<i32>, Reference> {
    let mut groups: HashMap<Option<i32>, Reference> = HashMap::new();
    for (key, value) in rows {
        let entry = groups.entry(*key).or_default();
        if let Some(v) = value {
            entry.count += 1;
            entry.sum = Some(entry.sum.unwrap_or(0) + *v as i64);
            entry.min = Some(entry.min.map_or(*v, |m| m.min(*v)));
            entry.max = Some(entry.max.map_or(*v, |m| m.max(*v)));
        }
    }
    groups
}

fn to_rows(data: &[(Option<i32>, Option<i32>)]) -> Vec<Row> {
    data.iter()
        .map(|(k, v)| {
            Row::new(vec![
                k.map(Datum::Int32).unwrap_or(Datum::Null),
                v.map(Datum::Int32).unwrap_or(Datum::Null),
            ])
        })
        .collect()
}

fn check_against_reference(
    out: Vec<Row>,
    expected: &HashMap<Option<i32>, Reference>,
) {
    assert_eq!(out.len(), expected.len(), "group count mismatch");
    for row in out {
        let key = match row.value(0) {
            Datum::Int32(k) => Some(*k),
            Datum::Null => None,
            other => panic!("bad group key {other:?}"),
        };
        let reference = expected
            .get(&key)
            .unwrap_or_else(|| panic!("unexpected group {key:?}"));
        match row.value(1) {
            Datum::Int64(n) => assert_eq!(*n, reference.count, "COUNT({key:?})"),
            other => panic!("bad COUNT value {other:?}"),
        }
        match row.value(2) {
            Datum::Int64(s) => assert_eq!(Some(*s), reference.sum, "SUM({key:?})"),
            Datum::Null => assert_eq!(None, reference.sum, "SUM({key:?})"),
            other => panic!("bad SUM value {other:?}"),
        }
        match row.value(3) {
            Datum::Int32(m) => assert_eq!(Some(*m), reference.min, "MIN({key:?})"),
            Datum::Null => assert_eq!(None, reference.min, "MIN({key:?})"),
            other => panic!("bad MIN value {other:?}"),
        }
        match row.value(4) {
            Datum::Int32(m) => assert_eq!(Some(*m), reference.max, "MAX({key:?})"),
            Datum::Null => assert_eq!(None, reference.max, "MAX({key:?})"),
            other => panic!("bad MAX value {other:?}"),
        }
    }
}

#[test]
fn random_differential_no_limit() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = StdRng::seed_from_u64(17);
    for _ in 0..5 {
        let data: Vec<(Option<i32>, Option<i32>)> = (0..rng.gen_range(1..5000))
            .map(|_| {
                let key = if rng.gen_bool(0.05) {
                    None
                } else {
                    Some(rng.gen_range(0..200))
                };
                let value = (!rng.gen_bool(0.1)).then(|| rng.gen_range(-1000..1000));
                (key, value)
            })
            .collect();
        let expected = reference_aggregate(&data);
        let agg_fns = vec![
            AggFn::count(value_expr()),
            AggFn::sum(value_expr()),
            AggFn::min(value_expr()),
            AggFn::max(value_expr()),
        ];
        let out = run(
            plan(agg_fns),
            ExecOptions::default(),
            RuntimeEnvBuilder::new().build().unwrap(),
            to_rows(&data),
        );
        check_against_reference(out, &expected);
    }
}

#[test]
fn random_differential_with_memory_limit() {
    let mut rng = StdRng::seed_from_u64(99);
    let data: Vec<(Option<i32>, Option<i32>)> = (0..40_000)
        .map(|_| {
            (
                Some(rng.gen_range(0..2000)),
                Some(rng.gen_range(-1000..1000)),
            )
        })
        .collect();
    let expected = reference_aggregate(&data);
    let agg_fns = vec![
        AggFn::count(value_expr()),
        AggFn::sum(value_expr()),
        AggFn::min(value_expr()),
        AggFn::max(value_expr()),
    ];
    let env = RuntimeEnvBuilder::new()
        .with_memory_limit(384 * 1024)
        .with_io_block_size(16 * 1024)
        .build()
        .unwrap();
    let out = run(
        plan(agg_fns),
        ExecOptions::default().with_batch_size(512),
        env,
        to_rows(&data),
    );
    check_against_reference(out, &expected);
}

#[test]
fn linear_and_quadratic_probing_agree() {
    let mut rng = StdRng::seed_from_u64(3);
    let data: Vec<(Option<i32>, Option<i32>)> = (0..5000)
        .map(|_| (Some(rng.gen_range(0..300)), Some(rng.gen_range(0..100))))
        .collect();
    let agg_fns = || vec![AggFn::count(value_expr()), AggFn::sum(value_expr())];
    let run_with = |quadratic: bool| {
        let mut out = run(
            plan(agg_fns()),
            ExecOptions::default().with_quadratic_probing(quadratic),
            RuntimeEnvBuilder::new().build().unwrap(),
            to_rows(&data),
        );
        out.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        out
    };
    assert_eq!(run_with(true), run_with(false));
}

/// Partial aggregation (serialize) piped into a merge aggregation
/// (finalize) must agree with a single full aggregation.
#[test]
fn two_phase_aggregation_matches_single_phase() {
    let mut rng = StdRng::seed_from_u64(5);
    let data: Vec<(Option<i32>, Option<i32>)> = (0..10_000)
        .map(|_| (Some(rng.gen_range(0..100)), Some(rng.gen_range(0..50))))
        .collect();
    let agg_fns = || {
        vec![
            AggFn::count(value_expr()),
            AggFn::sum(value_expr()),
            AggFn::min(value_expr()),
            AggFn::max(value_expr()),
        ]
    };

    // Phase 1: partial aggregation over each half, emitting intermediates.
    let partial_plan = AggPlan {
        needs_finalize: false,
        ..plan(agg_fns())
    };
    let rows = to_rows(&data);
    let (left, right) = rows.split_at(rows.len() / 2);
    let mut intermediates = run(
        partial_plan.clone(),
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        left.to_vec(),
    );
    intermediates.extend(run(
        partial_plan.clone(),
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        right.to_vec(),
    ));

    // Phase 2: merge the serialized intermediates.
    let intermediate_schema = partial_plan.intermediate_schema();
    let merge_plan = AggPlan {
        operator_id: 12,
        input_schema: intermediate_schema.clone(),
        // Group keys are the leading intermediate columns.
        grouping_exprs: vec![Arc::new(Column::new(
            0,
            intermediate_schema.types()[0],
        ))],
        agg_fns: agg_fns(),
        needs_finalize: true,
        estimated_input_cardinality: None,
    };
    let mut merge = PartitionedAggregator::try_new(
        merge_plan,
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        TaskContext::new(),
    )
    .unwrap();
    // The merge path consumes serialized intermediates.
    let merged = {
        let mut out = Vec::new();
        let mut source = MemorySource::new(intermediates, 1024);
        merge.open_merge(&mut source).unwrap();
        while let Some(mut batch) = merge.get_next().unwrap() {
            out.extend(batch.take_rows());
        }
        out
    };

    let expected = reference_aggregate(&data);
    check_against_reference(merged, &expected);
}
