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

//! The pull interface between operators: batches of rows on demand.

use granite_common::{Result, Row, RowBatch};

/// A source of row batches. Operators pull from their children through this
/// seam; control returns to the caller only between batches.
pub trait BatchSource {
    /// The next batch, or `None` at end of stream.
    fn next_batch(&mut self) -> Result<Option<RowBatch>>;
}

/// An in-memory [`BatchSource`] over a vector of rows, mostly for tests and
/// small rescans.
pub struct MemorySource {
    rows: Vec<Row>,
    batch_size: usize,
    position: usize,
}

impl MemorySource {
    pub fn new(rows: Vec<Row>, batch_size: usize) -> Self {
        Self {
            rows,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }
}

impl BatchSource for MemorySource {
    fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.position >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.position + self.batch_size).min(self.rows.len());
        let mut batch = RowBatch::new(self.batch_size);
        for row in &self.rows[self.position..end] {
            batch.add_row(row.clone());
        }
        self.position = end;
        Ok(Some(batch))
    }
}
