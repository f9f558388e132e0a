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

//! The expression-evaluator seam.
//!
//! Planning and expression compilation happen upstream; the operators only
//! require that an expression can report its output type and produce a
//! `{is_null, payload}` value for a row. The join additionally carries
//! equi-conjunct pairs and residual (non-equi) filters.

use std::fmt::Debug;
use std::sync::Arc;

use granite_common::{internal_err, ColumnType, Datum, Result, Row};

/// A row-wise scalar expression.
pub trait ScalarExpr: Send + Sync + Debug {
    fn data_type(&self) -> ColumnType;

    fn evaluate(&self, row: &Row) -> Result<Datum>;
}

pub type ScalarExprRef = Arc<dyn ScalarExpr>;

/// A column reference, the workhorse expression of the operators.
#[derive(Debug, Clone)]
pub struct Column {
    index: usize,
    ty: ColumnType,
}

impl Column {
    pub fn new(index: usize, ty: ColumnType) -> Self {
        Self { index, ty }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl ScalarExpr for Column {
    fn data_type(&self) -> ColumnType {
        self.ty
    }

    fn evaluate(&self, row: &Row) -> Result<Datum> {
        if self.index >= row.num_columns() {
            return internal_err!(
                "column {} out of range for row of arity {}",
                self.index,
                row.num_columns()
            );
        }
        Ok(row.value(self.index).clone())
    }
}

/// A literal value, used by tests and constant conjuncts.
#[derive(Debug, Clone)]
pub struct Literal {
    value: Datum,
    ty: ColumnType,
}

impl Literal {
    pub fn new(value: Datum, ty: ColumnType) -> Self {
        Self { value, ty }
    }
}

impl ScalarExpr for Literal {
    fn data_type(&self) -> ColumnType {
        self.ty
    }

    fn evaluate(&self, _row: &Row) -> Result<Datum> {
        Ok(self.value.clone())
    }
}

/// One equi-join conjunct: a build-side expression paired with the probe
/// side expression it is compared against.
#[derive(Debug, Clone)]
pub struct JoinKey {
    pub build: ScalarExprRef,
    pub probe: ScalarExprRef,
    /// `a <=> b` semantics: two NULL keys compare equal.
    pub is_not_distinct_from: bool,
}

impl JoinKey {
    pub fn new(build: ScalarExprRef, probe: ScalarExprRef) -> Self {
        Self {
            build,
            probe,
            is_not_distinct_from: false,
        }
    }

    pub fn with_null_safe_equality(mut self, null_safe: bool) -> Self {
        self.is_not_distinct_from = null_safe;
        self
    }
}

/// A residual (non-equi) join conjunct, evaluated over a probe row and a
/// build row. NULL results count as false, per SQL semantics.
pub trait JoinFilter: Send + Sync + Debug {
    fn evaluate(&self, probe: &Row, build: &Row) -> Result<bool>;
}

pub type JoinFilterRef = Arc<dyn JoinFilter>;

/// A [`JoinFilter`] backed by a plain function, sufficient for residual
/// predicates handed down by the planner seam and for tests.
pub struct FnJoinFilter<F>(pub F);

impl<F> Debug for FnJoinFilter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnJoinFilter")
    }
}

impl<F> JoinFilter for FnJoinFilter<F>
where
    F: Fn(&Row, &Row) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, probe: &Row, build: &Row) -> Result<bool> {
        (self.0)(probe, build)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_eval() {
        let row = Row::new(vec![Datum::Int32(5), Datum::Utf8("x".into())]);
        let col = Column::new(1, ColumnType::Utf8);
        assert_eq!(col.evaluate(&row).unwrap(), Datum::Utf8("x".into()));
        let bad = Column::new(7, ColumnType::Int32);
        assert!(bad.evaluate(&row).is_err());
    }

    #[test]
    fn fn_filter() {
        let filter = FnJoinFilter(|probe: &Row, build: &Row| {
            Ok(probe.value(0).total_cmp(build.value(0)).is_lt())
        });
        let a = Row::new(vec![Datum::Int32(1)]);
        let b = Row::new(vec![Datum::Int32(2)]);
        assert!(filter.evaluate(&a, &b).unwrap());
        assert!(!filter.evaluate(&b, &a).unwrap());
    }
}
