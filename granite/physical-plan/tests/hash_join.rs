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

//! End-to-end hash join tests over the schema `L(a INT, b INT)`,
//! `R(c INT, d INT)` with join key `L.a = R.c`.

use std::sync::Arc;

use granite_common::config::ExecOptions;
use granite_common::{ColumnType, Datum, Row, RowSchema};
use granite_execution::runtime_env::RuntimeEnvBuilder;
use granite_execution::{RuntimeEnv, TaskContext};
use granite_physical_plan::expr::{Column, FnJoinFilter, JoinKey};
use granite_physical_plan::joins::RuntimeFilterDesc;
use granite_physical_plan::{
    JoinOp, JoinPlan, MemorySource, PartitionedHashJoin,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn two_int_schema() -> RowSchema {
    RowSchema::new(vec![ColumnType::Int32, ColumnType::Int32])
}

fn rows(values: &[(Option<i32>, i32)]) -> Vec<Row> {
    values
        .iter()
        .map(|(a, b)| {
            Row::new(vec![
                a.map(Datum::Int32).unwrap_or(Datum::Null),
                Datum::Int32(*b),
            ])
        })
        .collect()
}

fn join_plan(join_op: JoinOp) -> JoinPlan {
    JoinPlan {
        operator_id: 3,
        join_op,
        probe_schema: two_int_schema(),
        build_schema: two_int_schema(),
        keys: vec![JoinKey::new(
            Arc::new(Column::new(0, ColumnType::Int32)),
            Arc::new(Column::new(0, ColumnType::Int32)),
        )],
        other_filters: vec![],
        estimated_build_cardinality: None,
        runtime_filters: vec![],
    }
}

fn run_join(
    plan: JoinPlan,
    options: ExecOptions,
    env: Arc<RuntimeEnv>,
    build: Vec<Row>,
    probe: Vec<Row>,
) -> (Vec<Row>, usize) {
    let mut join =
        PartitionedHashJoin::try_new(plan, options.clone(), env, TaskContext::new())
            .unwrap();
    let mut build_source = MemorySource::new(build, options.batch_size);
    join.open(&mut build_source).unwrap();
    let mut probe_source = MemorySource::new(probe, options.batch_size);
    let mut out = Vec::new();
    while let Some(mut batch) = join.get_next(&mut probe_source).unwrap() {
        out.extend(batch.take_rows());
    }
    let spilled = join.metrics().num_spilled_partitions.value();
    (out, spilled)
}

/// Normalizes a result multiset for comparison.
fn canonical(mut rows: Vec<Row>) -> Vec<String> {
    let mut formatted: Vec<String> = rows.drain(..).map(|r| format!("{r:?}")).collect();
    formatted.sort();
    formatted
}

fn expect(actual: Vec<Row>, expected: &[&[Option<i32>]]) {
    let expected_rows: Vec<Row> = expected
        .iter()
        .map(|cols| {
            Row::new(
                cols.iter()
                    .map(|v| v.map(Datum::Int32).unwrap_or(Datum::Null))
                    .collect(),
            )
        })
        .collect();
    assert_eq!(canonical(actual), canonical(expected_rows));
}

#[test]
fn inner_join() {
    let build = rows(&[(Some(2), 200), (Some(3), 300)]);
    let probe = rows(&[(Some(1), 10), (Some(2), 20), (Some(2), 21)]);
    let (out, _) = run_join(
        join_plan(JoinOp::Inner),
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        build,
        probe,
    );
    expect(
        out,
        &[
            &[Some(2), Some(20), Some(2), Some(200)],
            &[Some(2), Some(21), Some(2), Some(200)],
        ],
    );
}

#[test]
fn left_outer_join() {
    let build = rows(&[(Some(2), 200), (Some(3), 300)]);
    let probe = rows(&[(Some(1), 10), (Some(2), 20), (Some(2), 21)]);
    let (out, _) = run_join(
        join_plan(JoinOp::LeftOuter),
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        build,
        probe,
    );
    expect(
        out,
        &[
            &[Some(1), Some(10), None, None],
            &[Some(2), Some(20), Some(2), Some(200)],
            &[Some(2), Some(21), Some(2), Some(200)],
        ],
    );
}

/// The full operator matrix over one small input with duplicate keys and
/// NULL keys on both sides.
#[test]
fn join_op_matrix() {
    let build = rows(&[(Some(2), 200), (Some(2), 201), (Some(3), 300), (None, 400)]);
    let probe = rows(&[
        (Some(1), 10),
        (Some(2), 20),
        (Some(2), 21),
        (None, 30),
        (Some(4), 40),
    ]);
    let env = || RuntimeEnvBuilder::new().build().unwrap();
    let run = |op: JoinOp| {
        run_join(
            join_plan(op),
            ExecOptions::default(),
            env(),
            build.clone(),
            probe.clone(),
        )
        .0
    };

    expect(
        run(JoinOp::Inner),
        &[
            &[Some(2), Some(20), Some(2), Some(200)],
            &[Some(2), Some(20), Some(2), Some(201)],
            &[Some(2), Some(21), Some(2), Some(200)],
            &[Some(2), Some(21), Some(2), Some(201)],
        ],
    );
    expect(
        run(JoinOp::LeftOuter),
        &[
            &[Some(1), Some(10), None, None],
            &[Some(2), Some(20), Some(2), Some(200)],
            &[Some(2), Some(20), Some(2), Some(201)],
            &[Some(2), Some(21), Some(2), Some(200)],
            &[Some(2), Some(21), Some(2), Some(201)],
            &[None, Some(30), None, None],
            &[Some(4), Some(40), None, None],
        ],
    );
    expect(
        run(JoinOp::LeftSemi),
        &[&[Some(2), Some(20)], &[Some(2), Some(21)]],
    );
    expect(
        run(JoinOp::LeftAnti),
        &[
            &[Some(1), Some(10)],
            &[None, Some(30)],
            &[Some(4), Some(40)],
        ],
    );
    expect(
        run(JoinOp::RightOuter),
        &[
            &[Some(2), Some(20), Some(2), Some(200)],
            &[Some(2), Some(20), Some(2), Some(201)],
            &[Some(2), Some(21), Some(2), Some(200)],
            &[Some(2), Some(21), Some(2), Some(201)],
            &[None, None, Some(3), Some(300)],
            &[None, None, None, Some(400)],
        ],
    );
    expect(
        run(JoinOp::RightSemi),
        &[&[Some(2), Some(200)], &[Some(2), Some(201)]],
    );
    expect(
        run(JoinOp::RightAnti),
        &[&[Some(3), Some(300)], &[None, Some(400)]],
    );
    expect(
        run(JoinOp::FullOuter),
        &[
            &[Some(1), Some(10), None, None],
            &[Some(2), Some(20), Some(2), Some(200)],
            &[Some(2), Some(20), Some(2), Some(201)],
            &[Some(2), Some(21), Some(2), Some(200)],
            &[Some(2), Some(21), Some(2), Some(201)],
            &[None, Some(30), None, None],
            &[Some(4), Some(40), None, None],
            &[None, None, Some(3), Some(300)],
            &[None, None, None, Some(400)],
        ],
    );
}

#[test]
fn null_safe_equality_matches_nulls() {
    let mut plan = join_plan(JoinOp::Inner);
    plan.keys[0].is_not_distinct_from = true;
    let build = rows(&[(None, 400), (Some(1), 100)]);
    let probe = rows(&[(None, 30), (Some(1), 10), (Some(2), 20)]);
    let (out, _) = run_join(
        plan,
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        build,
        probe,
    );
    expect(
        out,
        &[
            &[None, Some(30), None, Some(400)],
            &[Some(1), Some(10), Some(1), Some(100)],
        ],
    );
}

/// `L = {(1),(NULL)}`, `R = {(2),(NULL)}`: the NULL in `R` suppresses the
/// NULL probe row, while probe row 1 has no build match and is emitted.
#[test]
fn null_aware_left_anti_basic() {
    let plan = JoinPlan {
        probe_schema: RowSchema::new(vec![ColumnType::Int32]),
        build_schema: RowSchema::new(vec![ColumnType::Int32]),
        ..join_plan(JoinOp::NullAwareLeftAnti)
    };
    let build = vec![
        Row::new(vec![Datum::Int32(2)]),
        Row::new(vec![Datum::Null]),
    ];
    let probe = vec![
        Row::new(vec![Datum::Int32(1)]),
        Row::new(vec![Datum::Null]),
    ];
    let (out, _) = run_join(
        plan,
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        build,
        probe,
    );
    expect(out, &[&[Some(1)]]);
}

#[test]
fn null_aware_left_anti_empty_build_emits_all() {
    let plan = JoinPlan {
        probe_schema: RowSchema::new(vec![ColumnType::Int32]),
        build_schema: RowSchema::new(vec![ColumnType::Int32]),
        ..join_plan(JoinOp::NullAwareLeftAnti)
    };
    let probe = vec![
        Row::new(vec![Datum::Int32(1)]),
        Row::new(vec![Datum::Null]),
    ];
    let (out, _) = run_join(
        plan,
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        vec![],
        probe,
    );
    expect(out, &[&[Some(1)], &[None]]);
}

#[test]
fn null_aware_left_anti_with_residual_filter() {
    // Key is column 0; the residual filter lets a NULL-keyed build row
    // capture probe rows whose payload is smaller than the build payload.
    let mut plan = join_plan(JoinOp::NullAwareLeftAnti);
    plan.other_filters = vec![Arc::new(FnJoinFilter(
        |probe: &Row, build: &Row| match (probe.value(1), build.value(1)) {
            (Datum::Int32(p), Datum::Int32(b)) => Ok(p < b),
            _ => Ok(false),
        },
    ))];
    let build = rows(&[(None, 5)]);
    let probe = rows(&[(Some(1), 3), (Some(2), 9), (None, 1), (None, 8)]);
    let (out, _) = run_join(
        plan,
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        build,
        probe,
    );
    // (1,3): 3 < 5, suppressed. (2,9): 9 < 5 fails, emitted.
    // (NULL,1): 1 < 5, suppressed. (NULL,8): 8 < 5 fails, emitted.
    expect(out, &[&[Some(2), Some(9)], &[None, Some(8)]]);
}

/// Forced spill: a memory limit that holds only a sliver of the build side
/// must produce exactly the same multiset as the in-memory run.
#[test]
fn spilled_inner_join_matches_in_memory() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rng = StdRng::seed_from_u64(42);
    let build: Vec<Row> = (0..100_000)
        .map(|i| Row::new(vec![Datum::Int32(i % 16_384), Datum::Int32(rng.gen())]))
        .collect();
    let probe: Vec<Row> = (0..20_000)
        .map(|_| {
            Row::new(vec![
                Datum::Int32(rng.gen_range(0..20_000)),
                Datum::Int32(rng.gen()),
            ])
        })
        .collect();
    let options = ExecOptions::default().with_batch_size(1024);

    let (in_memory, spilled) = run_join(
        join_plan(JoinOp::Inner),
        options.clone(),
        RuntimeEnvBuilder::new().build().unwrap(),
        build.clone(),
        probe.clone(),
    );
    assert_eq!(spilled, 0);

    let tight_env = RuntimeEnvBuilder::new()
        .with_memory_limit(768 * 1024)
        .with_io_block_size(32 * 1024)
        .build()
        .unwrap();
    let (spilled_out, spilled) = run_join(
        join_plan(JoinOp::Inner),
        options,
        tight_env,
        build,
        probe,
    );
    assert!(spilled > 0, "the tight pool should have forced spilling");
    assert_eq!(canonical(spilled_out), canonical(in_memory));
}

/// Randomized differential test against a nested-loop reference.
#[test]
fn random_joins_match_nested_loop_reference() {
    let mut rng = StdRng::seed_from_u64(7);
    for trial in 0..5 {
        let build: Vec<Row> = (0..rng.gen_range(1..200))
            .map(|_| {
                let key = if rng.gen_bool(0.1) {
                    None
                } else {
                    Some(rng.gen_range(0..40))
                };
                rows(&[(key, rng.gen_range(0..1000))]).remove(0)
            })
            .collect();
        let probe: Vec<Row> = (0..rng.gen_range(1..200))
            .map(|_| {
                let key = if rng.gen_bool(0.1) {
                    None
                } else {
                    Some(rng.gen_range(0..40))
                };
                rows(&[(key, rng.gen_range(0..1000))]).remove(0)
            })
            .collect();

        for op in [JoinOp::Inner, JoinOp::LeftOuter, JoinOp::LeftAnti] {
            let (out, _) = run_join(
                join_plan(op),
                ExecOptions::default(),
                RuntimeEnvBuilder::new().build().unwrap(),
                build.clone(),
                probe.clone(),
            );
            let expected = nested_loop_reference(op, &probe, &build);
            assert_eq!(
                canonical(out),
                canonical(expected),
                "{op} diverged on trial {trial}"
            );
        }
    }
}

fn nested_loop_reference(op: JoinOp, probe: &[Row], build: &[Row]) -> Vec<Row> {
    let key_eq = |p: &Row, b: &Row| match (p.value(0), b.value(0)) {
        (Datum::Int32(x), Datum::Int32(y)) => x == y,
        _ => false, // NULL keys never match under plain equality
    };
    let mut out = Vec::new();
    for p in probe {
        let matches: Vec<&Row> = build.iter().filter(|b| key_eq(p, b)).collect();
        match op {
            JoinOp::Inner => {
                for b in &matches {
                    out.push(Row::concat(p, b));
                }
            }
            JoinOp::LeftOuter => {
                if matches.is_empty() {
                    out.push(Row::concat(p, &Row::nulls(2)));
                } else {
                    for b in &matches {
                        out.push(Row::concat(p, b));
                    }
                }
            }
            JoinOp::LeftAnti => {
                if matches.is_empty() {
                    out.push(p.clone());
                }
            }
            _ => unreachable!("reference only covers probe-driven ops"),
        }
    }
    out
}

#[test]
fn runtime_filters_published_after_build() {
    let mut plan = join_plan(JoinOp::Inner);
    plan.runtime_filters = vec![RuntimeFilterDesc {
        filter_id: 7,
        src_key: 0,
        is_bound_by_partition_columns: false,
    }];
    plan.estimated_build_cardinality = Some(1000);
    let options = ExecOptions::default();
    let env = RuntimeEnvBuilder::new().build().unwrap();
    let mut join =
        PartitionedHashJoin::try_new(plan, options, env, TaskContext::new()).unwrap();

    let build: Vec<Row> = (0..1000).map(|i| rows(&[(Some(i), 0)]).remove(0)).collect();
    let mut build_source = MemorySource::new(build, 1024);
    join.open(&mut build_source).unwrap();

    let filters = join.runtime_filters();
    assert_eq!(filters.len(), 1);
    assert!(!filters[0].always_true());
    // No false negatives on the build keys.
    for i in 0..1000 {
        assert!(filters[0].might_contain(&Datum::Int32(i)));
    }
    // Values far outside the build domain are mostly filtered.
    let false_positives = (100_000..101_000)
        .filter(|i| filters[0].might_contain(&Datum::Int32(*i)))
        .count();
    assert!(false_positives < 100, "{false_positives} false positives");
}

#[test]
fn right_outer_with_duplicates_and_spill_free_path() {
    // Right-side duplicates must each appear once in the drain.
    let build = rows(&[(Some(1), 100), (Some(1), 101), (Some(9), 900)]);
    let probe = rows(&[(Some(1), 10)]);
    let (out, _) = run_join(
        join_plan(JoinOp::RightOuter),
        ExecOptions::default(),
        RuntimeEnvBuilder::new().build().unwrap(),
        build,
        probe,
    );
    expect(
        out,
        &[
            &[Some(1), Some(10), Some(1), Some(100)],
            &[Some(1), Some(10), Some(1), Some(101)],
            &[None, None, Some(9), Some(900)],
        ],
    );
}
