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

//! Rows, row schemas and row batches.
//!
//! The serialized row layout is the on-write, in-memory tuple layout that
//! tuple-stream blocks persist verbatim: one null byte per column, then the
//! fixed-width slots, then any variable-length payloads within the same
//! block. Variable-length slots hold an offset (relative to the row start)
//! and a length.

use std::any::Any;
use std::sync::Arc;

use crate::error::Result;
use crate::internal_err;
use crate::types::{ColumnType, Datum};

/// An ordered list of column types plus the derived serialized layout.
#[derive(Debug, Clone)]
pub struct RowSchema {
    types: Arc<[ColumnType]>,
    /// Byte offset of each fixed slot, relative to the row start.
    slot_offsets: Arc<[usize]>,
    /// Null bytes plus fixed slots; var-len payloads follow.
    fixed_size: usize,
    has_var_len: bool,
}

impl RowSchema {
    pub fn new(types: Vec<ColumnType>) -> Self {
        let mut offset = types.len(); // one null byte per column
        let mut slot_offsets = Vec::with_capacity(types.len());
        let mut has_var_len = false;
        for ty in &types {
            slot_offsets.push(offset);
            offset += ty.fixed_width();
            has_var_len |= ty.is_var_len();
        }
        Self {
            types: types.into(),
            slot_offsets: slot_offsets.into(),
            fixed_size: offset,
            has_var_len,
        }
    }

    pub fn types(&self) -> &[ColumnType] {
        &self.types
    }

    pub fn num_columns(&self) -> usize {
        self.types.len()
    }

    /// Size of the null bytes plus the fixed slots.
    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    pub fn has_var_len(&self) -> bool {
        self.has_var_len
    }

    /// Concatenation of two schemas, used for join output rows.
    pub fn concat(&self, other: &RowSchema) -> RowSchema {
        let mut types = self.types.to_vec();
        types.extend_from_slice(&other.types);
        RowSchema::new(types)
    }

    /// Total serialized footprint of `row` under this schema.
    pub fn serialized_size(&self, row: &Row) -> usize {
        let mut size = self.fixed_size;
        if self.has_var_len {
            for value in row.values() {
                if let Some(bytes) = value.var_len_bytes() {
                    size += bytes.len();
                }
            }
        }
        size
    }

    /// Appends the serialized image of `row` to `out` and returns the number
    /// of bytes written.
    pub fn serialize(&self, row: &Row, out: &mut Vec<u8>) -> Result<usize> {
        if row.num_columns() != self.num_columns() {
            return internal_err!(
                "row arity {} does not match schema arity {}",
                row.num_columns(),
                self.num_columns()
            );
        }
        let row_start = out.len();
        out.resize(row_start + self.fixed_size, 0);
        let mut var_offset = self.fixed_size;
        for (i, (value, ty)) in row.values().iter().zip(self.types.iter()).enumerate()
        {
            if value.is_null() {
                out[row_start + i] = 1;
                continue;
            }
            let slot = row_start + self.slot_offsets[i];
            if let Some(bytes) = value.var_len_bytes() {
                out[slot..slot + 8].copy_from_slice(&(var_offset as u64).to_le_bytes());
                out[slot + 8..slot + 16]
                    .copy_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(bytes);
                var_offset += bytes.len();
            } else {
                let width = ty.fixed_width();
                value.encode_fixed(ty, &mut out[slot..slot + width])?;
            }
        }
        Ok(out.len() - row_start)
    }

    /// Reads one row starting at `offset` in `bytes`, returning the row and
    /// the number of bytes it occupied.
    pub fn deserialize(&self, bytes: &[u8], offset: usize) -> Result<(Row, usize)> {
        if offset + self.fixed_size > bytes.len() {
            return internal_err!(
                "row at offset {offset} overruns block of {} bytes",
                bytes.len()
            );
        }
        let row_bytes = &bytes[offset..];
        let mut values = Vec::with_capacity(self.num_columns());
        let mut size = self.fixed_size;
        for (i, ty) in self.types.iter().enumerate() {
            if row_bytes[i] != 0 {
                values.push(Datum::Null);
                continue;
            }
            let slot = self.slot_offsets[i];
            if ty.is_var_len() {
                let var_offset = u64::from_le_bytes(
                    row_bytes[slot..slot + 8].try_into().unwrap(),
                ) as usize;
                let len = u64::from_le_bytes(
                    row_bytes[slot + 8..slot + 16].try_into().unwrap(),
                ) as usize;
                if offset + var_offset + len > bytes.len() {
                    return internal_err!("var-len payload overruns block");
                }
                let payload = &bytes[offset + var_offset..offset + var_offset + len];
                values.push(match ty {
                    ColumnType::Utf8 => Datum::Utf8(
                        std::str::from_utf8(payload)
                            .map_err(|e| {
                                crate::internal_granite_err!(
                                    "corrupt utf8 payload: {e}"
                                )
                            })?
                            .to_string(),
                    ),
                    _ => Datum::Binary(payload.to_vec()),
                });
                size = size.max(var_offset + len);
            } else {
                let width = ty.fixed_width();
                values.push(Datum::decode_fixed(ty, &row_bytes[slot..slot + width])?);
            }
        }
        Ok((Row::new(values), size))
    }

    /// Overwrites the fixed slots of a previously serialized row in place.
    /// Only valid for schemas with no variable-length columns, where the
    /// serialized footprint cannot change.
    pub fn overwrite(&self, row: &Row, out: &mut [u8]) -> Result<()> {
        debug_assert!(!self.has_var_len);
        for byte in out[..self.num_columns()].iter_mut() {
            *byte = 0;
        }
        for (i, (value, ty)) in row.values().iter().zip(self.types.iter()).enumerate()
        {
            if value.is_null() {
                out[i] = 1;
                continue;
            }
            let slot = self.slot_offsets[i];
            let width = ty.fixed_width();
            value.encode_fixed(ty, &mut out[slot..slot + width])?;
        }
        Ok(())
    }
}

/// A materialized row of evaluated values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Box<[Datum]>,
}

impl Row {
    pub fn new(values: Vec<Datum>) -> Self {
        Self {
            values: values.into_boxed_slice(),
        }
    }

    /// A row of `n` nulls, used to pad the missing side of outer joins.
    pub fn nulls(n: usize) -> Self {
        Self::new(vec![Datum::Null; n])
    }

    pub fn num_columns(&self) -> usize {
        self.values.len()
    }

    pub fn value(&self, i: usize) -> &Datum {
        &self.values[i]
    }

    pub fn values(&self) -> &[Datum] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [Datum] {
        &mut self.values
    }

    /// `left` followed by `right`, used to form join output rows.
    pub fn concat(left: &Row, right: &Row) -> Row {
        let mut values = Vec::with_capacity(left.num_columns() + right.num_columns());
        values.extend_from_slice(&left.values);
        values.extend_from_slice(&right.values);
        Row::new(values)
    }
}

impl From<Vec<Datum>> for Row {
    fn from(values: Vec<Datum>) -> Self {
        Row::new(values)
    }
}

/// A batch of rows flowing between operators.
///
/// Operators may attach resources (e.g. closed tuple streams) whose memory
/// must stay alive until the consumer has finished with the batch.
pub struct RowBatch {
    rows: Vec<Row>,
    capacity: usize,
    attached: Vec<Box<dyn Any + Send>>,
}

impl RowBatch {
    pub fn new(capacity: usize) -> Self {
        Self {
            rows: Vec::with_capacity(capacity),
            capacity,
            attached: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn at_capacity(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn add_row(&mut self, row: Row) {
        debug_assert!(!self.at_capacity());
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn take_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Keep `resource` alive for as long as this batch.
    pub fn attach_resource(&mut self, resource: Box<dyn Any + Send>) {
        self.attached.push(resource);
    }

    /// Move the attached resources of `self` onto `target`, leaving the rows
    /// in place. Mirrors handing stream ownership down the operator tree.
    pub fn transfer_resource_ownership(&mut self, target: &mut RowBatch) {
        target.attached.append(&mut self.attached);
    }
}

impl std::fmt::Debug for RowBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RowBatch")
            .field("rows", &self.rows.len())
            .field("capacity", &self.capacity)
            .field("attached", &self.attached.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> RowSchema {
        RowSchema::new(vec![
            ColumnType::Int32,
            ColumnType::Utf8,
            ColumnType::Int64,
        ])
    }

    #[test]
    fn serialize_round_trip() {
        let schema = schema();
        let row = Row::new(vec![
            Datum::Int32(17),
            Datum::Utf8("granite".to_string()),
            Datum::Int64(-1),
        ]);
        let mut buf = Vec::new();
        let written = schema.serialize(&row, &mut buf).unwrap();
        assert_eq!(written, schema.serialized_size(&row));
        let (back, consumed) = schema.deserialize(&buf, 0).unwrap();
        assert_eq!(back, row);
        assert_eq!(consumed, written);
    }

    #[test]
    fn serialize_nulls() {
        let schema = schema();
        let row = Row::new(vec![Datum::Null, Datum::Null, Datum::Int64(3)]);
        let mut buf = Vec::new();
        schema.serialize(&row, &mut buf).unwrap();
        let (back, _) = schema.deserialize(&buf, 0).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn several_rows_back_to_back() {
        let schema = schema();
        let rows: Vec<Row> = (0..10)
            .map(|i| {
                Row::new(vec![
                    Datum::Int32(i),
                    Datum::Utf8(format!("row-{i}")),
                    Datum::Int64(i as i64 * 10),
                ])
            })
            .collect();
        let mut buf = Vec::new();
        for row in &rows {
            schema.serialize(row, &mut buf).unwrap();
        }
        let mut offset = 0;
        for row in &rows {
            let (back, consumed) = schema.deserialize(&buf, offset).unwrap();
            assert_eq!(&back, row);
            offset += consumed;
        }
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn overwrite_fixed_only() {
        let schema = RowSchema::new(vec![ColumnType::Int32, ColumnType::Int64]);
        let row = Row::new(vec![Datum::Int32(1), Datum::Int64(2)]);
        let mut buf = Vec::new();
        schema.serialize(&row, &mut buf).unwrap();
        let updated = Row::new(vec![Datum::Int32(7), Datum::Null]);
        schema.overwrite(&updated, &mut buf).unwrap();
        let (back, _) = schema.deserialize(&buf, 0).unwrap();
        assert_eq!(back, updated);
    }

    #[test]
    fn batch_capacity_and_resources() {
        let mut batch = RowBatch::new(2);
        batch.add_row(Row::nulls(1));
        assert!(!batch.at_capacity());
        batch.add_row(Row::nulls(1));
        assert!(batch.at_capacity());

        let mut target = RowBatch::new(2);
        batch.attach_resource(Box::new(vec![0u8; 16]));
        batch.transfer_resource_ownership(&mut target);
        assert_eq!(batch.attached.len(), 0);
        assert_eq!(target.attached.len(), 1);
    }
}
