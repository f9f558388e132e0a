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

//! Common types for the Granite query engine: the error model, execution
//! options, the row/value model shared by all operators, and decimal
//! arithmetic helpers.

pub mod config;
pub mod decimal;
pub mod error;
pub mod row;
pub mod types;

pub use error::{QueryError, Result};
pub use row::{Row, RowBatch, RowSchema};
pub use types::{ColumnType, Datum};

/// Rounds `v` up to the next power of two. `roundup_pow2(0) == 1`.
pub fn roundup_pow2(v: usize) -> usize {
    v.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2_rounding() {
        assert_eq!(roundup_pow2(0), 1);
        assert_eq!(roundup_pow2(1), 1);
        assert_eq!(roundup_pow2(3), 4);
        assert_eq!(roundup_pow2(1024), 1024);
        assert_eq!(roundup_pow2(1025), 2048);
    }
}
