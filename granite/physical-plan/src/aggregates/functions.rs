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

//! Aggregate function descriptors and their evaluators.
//!
//! An evaluator implements the five aggregate symbols over intermediate
//! rows: `init`, `update`, `merge`, `serialize`, `finalize`. Intermediates
//! occupy a run of slots after the grouping columns; MIN and MAX seed their
//! value slot with the opposite extreme of the type so the hot update path
//! compares without a null check (a separate seen-bit decides NULL at
//! finalize time). NDV keeps its HyperLogLog registers in a var-len slot,
//! which is what forces serialization when a partition spills.

use std::hash::{Hash, Hasher};

use ahash::AHasher;
use granite_common::decimal;
use granite_common::{internal_err, ColumnType, Datum, Result, Row};
use log::warn;

use crate::expr::ScalarExprRef;
use crate::hyperloglog::{HyperLogLog, NUM_REGISTERS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFnKind {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Ndv,
}

/// An aggregate function bound to its input expression (`None` only for
/// `COUNT(*)`).
#[derive(Debug, Clone)]
pub struct AggFn {
    pub kind: AggFnKind,
    pub input: Option<ScalarExprRef>,
}

impl AggFn {
    pub fn count_star() -> Self {
        Self {
            kind: AggFnKind::Count,
            input: None,
        }
    }

    pub fn count(input: ScalarExprRef) -> Self {
        Self {
            kind: AggFnKind::Count,
            input: Some(input),
        }
    }

    pub fn sum(input: ScalarExprRef) -> Self {
        Self {
            kind: AggFnKind::Sum,
            input: Some(input),
        }
    }

    pub fn min(input: ScalarExprRef) -> Self {
        Self {
            kind: AggFnKind::Min,
            input: Some(input),
        }
    }

    pub fn max(input: ScalarExprRef) -> Self {
        Self {
            kind: AggFnKind::Max,
            input: Some(input),
        }
    }

    pub fn avg(input: ScalarExprRef) -> Self {
        Self {
            kind: AggFnKind::Avg,
            input: Some(input),
        }
    }

    pub fn ndv(input: ScalarExprRef) -> Self {
        Self {
            kind: AggFnKind::Ndv,
            input: Some(input),
        }
    }

    fn input_type(&self) -> Option<ColumnType> {
        self.input.as_ref().map(|e| e.data_type())
    }

    fn sum_type(input: ColumnType) -> ColumnType {
        match input {
            ColumnType::Int8 | ColumnType::Int16 | ColumnType::Int32 | ColumnType::Int64 => {
                ColumnType::Int64
            }
            ColumnType::Float32 | ColumnType::Float64 => ColumnType::Float64,
            ColumnType::Decimal { scale, .. } => ColumnType::Decimal {
                precision: 38,
                scale,
            },
            other => other,
        }
    }

    /// The slots this function occupies in the intermediate row.
    pub fn intermediate_types(&self) -> Vec<ColumnType> {
        match self.kind {
            AggFnKind::Count => vec![ColumnType::Int64],
            AggFnKind::Sum => {
                vec![Self::sum_type(self.input_type().expect("SUM needs an input"))]
            }
            AggFnKind::Min | AggFnKind::Max => vec![
                self.input_type().expect("MIN/MAX need an input"),
                ColumnType::Bool,
            ],
            AggFnKind::Avg => vec![ColumnType::Float64, ColumnType::Int64],
            AggFnKind::Ndv => vec![ColumnType::Binary],
        }
    }

    pub fn output_type(&self) -> ColumnType {
        match self.kind {
            AggFnKind::Count | AggFnKind::Ndv => ColumnType::Int64,
            AggFnKind::Sum => Self::sum_type(self.input_type().expect("SUM needs an input")),
            AggFnKind::Min | AggFnKind::Max => {
                self.input_type().expect("MIN/MAX need an input")
            }
            AggFnKind::Avg => ColumnType::Float64,
        }
    }
}

/// An [`AggFn`] bound to its slot range within the intermediate row.
#[derive(Debug, Clone)]
pub struct AggFnEvaluator {
    agg_fn: AggFn,
    /// Absolute index of this function's first slot.
    slot: usize,
}

impl AggFnEvaluator {
    pub fn new(agg_fn: AggFn, slot: usize) -> Self {
        Self { agg_fn, slot }
    }

    pub fn agg_fn(&self) -> &AggFn {
        &self.agg_fn
    }

    pub fn num_slots(&self) -> usize {
        self.agg_fn.intermediate_types().len()
    }

    /// Appends this function's initial slot values to a fresh intermediate.
    pub fn init(&self, out: &mut Vec<Datum>) {
        match self.agg_fn.kind {
            AggFnKind::Count => out.push(Datum::Int64(0)),
            AggFnKind::Sum => out.push(Datum::Null),
            AggFnKind::Min => {
                let ty = self.agg_fn.input_type().expect("MIN needs an input");
                out.push(Datum::max_sentinel(&ty).unwrap_or(Datum::Null));
                out.push(Datum::Bool(false));
            }
            AggFnKind::Max => {
                let ty = self.agg_fn.input_type().expect("MAX needs an input");
                out.push(Datum::min_sentinel(&ty).unwrap_or(Datum::Null));
                out.push(Datum::Bool(false));
            }
            AggFnKind::Avg => {
                out.push(Datum::Float64(0.0));
                out.push(Datum::Int64(0));
            }
            AggFnKind::Ndv => out.push(Datum::Binary(vec![0u8; NUM_REGISTERS])),
        }
    }

    fn eval_input(&self, row: &Row) -> Result<Option<Datum>> {
        match &self.agg_fn.input {
            Some(expr) => Ok(Some(expr.evaluate(row)?)),
            None => Ok(None),
        }
    }

    /// Folds one input row into the intermediate `dst`.
    pub fn update(&self, input_row: &Row, dst: &mut Row) -> Result<()> {
        let slot = self.slot;
        match self.agg_fn.kind {
            AggFnKind::Count => {
                let counts = match self.eval_input(input_row)? {
                    Some(v) => !v.is_null(),
                    None => true, // COUNT(*)
                };
                if counts {
                    if let Datum::Int64(n) = &mut dst.values_mut()[slot] {
                        *n += 1;
                    }
                }
            }
            AggFnKind::Sum => {
                let value = self.eval_input(input_row)?.expect("SUM input");
                if !value.is_null() {
                    sum_into(&mut dst.values_mut()[slot], &value)?;
                }
            }
            AggFnKind::Min | AggFnKind::Max => {
                let value = self.eval_input(input_row)?.expect("MIN/MAX input");
                if !value.is_null() {
                    self.min_max_value(&value, dst);
                    dst.values_mut()[slot + 1] = Datum::Bool(true);
                }
            }
            AggFnKind::Avg => {
                let value = self.eval_input(input_row)?.expect("AVG input");
                if let Some(v) = numeric_as_f64(&value) {
                    if let Datum::Float64(sum) = &mut dst.values_mut()[slot] {
                        *sum += v;
                    }
                    if let Datum::Int64(n) = &mut dst.values_mut()[slot + 1] {
                        *n += 1;
                    }
                }
            }
            AggFnKind::Ndv => {
                let value = self.eval_input(input_row)?.expect("NDV input");
                if !value.is_null() {
                    let hash = datum_hash64(&value);
                    if let Datum::Binary(registers) = &mut dst.values_mut()[slot] {
                        HyperLogLog::add_hash_into(registers, hash);
                    }
                }
            }
        }
        Ok(())
    }

    fn min_max_value(&self, value: &Datum, dst: &mut Row) {
        let keep_new = {
            let current = &dst.values()[self.slot];
            if current.is_null() {
                true
            } else {
                let ord = value.total_cmp(current);
                match self.agg_fn.kind {
                    AggFnKind::Min => ord.is_lt(),
                    _ => ord.is_gt(),
                }
            }
        };
        if keep_new {
            dst.values_mut()[self.slot] = value.clone();
        }
    }

    /// Folds a serialized intermediate (same slot layout) into `dst`.
    pub fn merge(&self, src: &Row, dst: &mut Row) -> Result<()> {
        let slot = self.slot;
        match self.agg_fn.kind {
            AggFnKind::Count => {
                let add = match src.value(slot) {
                    Datum::Int64(n) => *n,
                    other => return internal_err!("COUNT intermediate was {other:?}"),
                };
                if let Datum::Int64(n) = &mut dst.values_mut()[slot] {
                    *n += add;
                }
            }
            AggFnKind::Sum => {
                let value = src.value(slot).clone();
                if !value.is_null() {
                    sum_into(&mut dst.values_mut()[slot], &value)?;
                }
            }
            AggFnKind::Min | AggFnKind::Max => {
                if src.value(slot + 1) == &Datum::Bool(true) {
                    self.min_max_value(&src.value(slot).clone(), dst);
                    dst.values_mut()[slot + 1] = Datum::Bool(true);
                }
            }
            AggFnKind::Avg => {
                if let (Datum::Float64(src_sum), Datum::Int64(src_n)) =
                    (src.value(slot), src.value(slot + 1))
                {
                    let (src_sum, src_n) = (*src_sum, *src_n);
                    if let Datum::Float64(sum) = &mut dst.values_mut()[slot] {
                        *sum += src_sum;
                    }
                    if let Datum::Int64(n) = &mut dst.values_mut()[slot + 1] {
                        *n += src_n;
                    }
                }
            }
            AggFnKind::Ndv => {
                let src_registers = match src.value(slot) {
                    Datum::Binary(b) => b.clone(),
                    other => return internal_err!("NDV intermediate was {other:?}"),
                };
                if let Datum::Binary(registers) = &mut dst.values_mut()[slot] {
                    HyperLogLog::merge_into(registers, &src_registers);
                }
            }
        }
        Ok(())
    }

    /// Canonicalizes the intermediate for writing to a stream. Slot values
    /// are already in their serialized form; the hook exists so state that
    /// lives outside the row (none today) has a place to be folded in.
    pub fn serialize(&self, _row: &mut Row) {}

    /// Produces the output value from a final intermediate.
    pub fn finalize(&self, src: &Row) -> Result<Datum> {
        let slot = self.slot;
        Ok(match self.agg_fn.kind {
            AggFnKind::Count | AggFnKind::Sum => src.value(slot).clone(),
            AggFnKind::Min | AggFnKind::Max => {
                if src.value(slot + 1) == &Datum::Bool(true) {
                    src.value(slot).clone()
                } else {
                    Datum::Null
                }
            }
            AggFnKind::Avg => match (src.value(slot), src.value(slot + 1)) {
                (Datum::Float64(sum), Datum::Int64(n)) if *n > 0 => {
                    Datum::Float64(sum / *n as f64)
                }
                _ => Datum::Null,
            },
            AggFnKind::Ndv => match src.value(slot) {
                Datum::Binary(registers) => {
                    Datum::Int64(HyperLogLog::count_registers(registers) as i64)
                }
                other => return internal_err!("NDV intermediate was {other:?}"),
            },
        })
    }
}

/// Adds `value` into a SUM slot, promoting a NULL slot to the first value.
/// Integer sums accumulate in 64 bits; decimal overflow produces NULL with
/// a warning, matching the widest-type overflow contract.
fn sum_into(slot: &mut Datum, value: &Datum) -> Result<()> {
    let promoted = match value {
        Datum::Int8(v) => Datum::Int64(*v as i64),
        Datum::Int16(v) => Datum::Int64(*v as i64),
        Datum::Int32(v) => Datum::Int64(*v as i64),
        Datum::Int64(v) => Datum::Int64(*v),
        Datum::Float32(v) => Datum::Float64(*v as f64),
        Datum::Float64(v) => Datum::Float64(*v),
        Datum::Decimal(v) => Datum::Decimal(*v),
        other => return internal_err!("SUM over non-numeric value {other:?}"),
    };
    match (&mut *slot, promoted) {
        (Datum::Null, v) => *slot = v,
        (Datum::Int64(acc), Datum::Int64(v)) => *acc = acc.wrapping_add(v),
        (Datum::Float64(acc), Datum::Float64(v)) => *acc += v,
        (Datum::Decimal(acc), Datum::Decimal(v)) => match acc.checked_add(v) {
            Some(sum) if sum.abs() < decimal::scale_multiplier(38) => *acc = sum,
            _ => {
                warn!("decimal SUM overflow, result set to NULL");
                *slot = Datum::Null;
            }
        },
        (acc, v) => return internal_err!("SUM slot/value mismatch: {acc:?} += {v:?}"),
    }
    Ok(())
}

fn numeric_as_f64(value: &Datum) -> Option<f64> {
    match value {
        Datum::Int8(v) => Some(*v as f64),
        Datum::Int16(v) => Some(*v as f64),
        Datum::Int32(v) => Some(*v as f64),
        Datum::Int64(v) => Some(*v as f64),
        Datum::Float32(v) => Some(*v as f64),
        Datum::Float64(v) => Some(*v),
        Datum::Decimal(v) => Some(*v as f64),
        _ => None,
    }
}

/// A 64-bit hash of a value for the NDV sketch.
fn datum_hash64(value: &Datum) -> u64 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Column;
    use std::sync::Arc;

    fn int_input() -> ScalarExprRef {
        Arc::new(Column::new(0, ColumnType::Int32))
    }

    fn fresh_intermediate(evaluator: &AggFnEvaluator) -> Row {
        let mut values = Vec::new();
        evaluator.init(&mut values);
        Row::new(values)
    }

    fn update_all(evaluator: &AggFnEvaluator, dst: &mut Row, inputs: &[Datum]) {
        for input in inputs {
            evaluator
                .update(&Row::new(vec![input.clone()]), dst)
                .unwrap();
        }
    }

    #[test]
    fn count_star_counts_nulls() {
        let eval = AggFnEvaluator::new(AggFn::count_star(), 0);
        let mut acc = fresh_intermediate(&eval);
        update_all(&eval, &mut acc, &[Datum::Null, Datum::Int32(1)]);
        assert_eq!(eval.finalize(&acc).unwrap(), Datum::Int64(2));
    }

    #[test]
    fn count_expr_skips_nulls() {
        let eval = AggFnEvaluator::new(AggFn::count(int_input()), 0);
        let mut acc = fresh_intermediate(&eval);
        update_all(&eval, &mut acc, &[Datum::Null, Datum::Int32(1)]);
        assert_eq!(eval.finalize(&acc).unwrap(), Datum::Int64(1));
    }

    #[test]
    fn sum_identity_is_null() {
        let eval = AggFnEvaluator::new(AggFn::sum(int_input()), 0);
        let acc = fresh_intermediate(&eval);
        assert_eq!(eval.finalize(&acc).unwrap(), Datum::Null);
    }

    #[test]
    fn min_max_sentinels_and_nulls() {
        let min = AggFnEvaluator::new(AggFn::min(int_input()), 0);
        let mut acc = fresh_intermediate(&min);
        // Sentinel-seeded but still NULL with no inputs.
        assert_eq!(min.finalize(&acc).unwrap(), Datum::Null);
        update_all(&min, &mut acc, &[Datum::Int32(5), Datum::Null, Datum::Int32(2)]);
        assert_eq!(min.finalize(&acc).unwrap(), Datum::Int32(2));

        let max = AggFnEvaluator::new(AggFn::max(int_input()), 0);
        let mut acc = fresh_intermediate(&max);
        update_all(&max, &mut acc, &[Datum::Int32(5), Datum::Int32(2)]);
        assert_eq!(max.finalize(&acc).unwrap(), Datum::Int32(5));
    }

    #[test]
    fn avg_divides_at_finalize() {
        let eval = AggFnEvaluator::new(AggFn::avg(int_input()), 0);
        let mut acc = fresh_intermediate(&eval);
        update_all(&eval, &mut acc, &[Datum::Int32(1), Datum::Int32(2), Datum::Null]);
        assert_eq!(eval.finalize(&acc).unwrap(), Datum::Float64(1.5));
    }

    #[test]
    fn decimal_sum_overflow_goes_null() {
        let input: ScalarExprRef = Arc::new(Column::new(
            0,
            ColumnType::Decimal {
                precision: 38,
                scale: 0,
            },
        ));
        let eval = AggFnEvaluator::new(AggFn::sum(input), 0);
        let mut acc = fresh_intermediate(&eval);
        let big = decimal::scale_multiplier(37) * 9;
        update_all(
            &eval,
            &mut acc,
            &[Datum::Decimal(big), Datum::Decimal(big)],
        );
        assert_eq!(eval.finalize(&acc).unwrap(), Datum::Null);
    }

    /// One-shot aggregation must agree with partial aggregation followed by
    /// a merge over serialized intermediates.
    #[test]
    fn merge_round_trip_matches_one_shot() {
        let inputs: Vec<Datum> = (0..100)
            .map(|i| {
                if i % 10 == 0 {
                    Datum::Null
                } else {
                    Datum::Int32(i * 3 % 17)
                }
            })
            .collect();
        let fns = [
            AggFn::count(int_input()),
            AggFn::sum(int_input()),
            AggFn::min(int_input()),
            AggFn::max(int_input()),
            AggFn::avg(int_input()),
            AggFn::ndv(int_input()),
        ];
        for agg_fn in fns {
            let eval = AggFnEvaluator::new(agg_fn.clone(), 0);

            let mut one_shot = fresh_intermediate(&eval);
            update_all(&eval, &mut one_shot, &inputs);

            let (left, right) = inputs.split_at(37);
            let mut a = fresh_intermediate(&eval);
            update_all(&eval, &mut a, left);
            let mut b = fresh_intermediate(&eval);
            update_all(&eval, &mut b, right);
            eval.serialize(&mut b);
            eval.merge(&b, &mut a).unwrap();

            assert_eq!(
                eval.finalize(&a).unwrap(),
                eval.finalize(&one_shot).unwrap(),
                "{:?} diverged after merge",
                agg_fn.kind
            );
        }
    }
}
