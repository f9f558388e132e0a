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

//! [`TupleStream`]: an append-only, possibly-spilled row container backed by
//! fixed-size blocks, addressable by opaque [`RowIdx`].
//!
//! Streams begin on small buffers (1/128th and then 1/16th of the I/O block
//! size) so that tiny queries do not pay I/O-sized allocations, and switch to
//! I/O-sized blocks once a caller signals the stream is expected to spill.
//! Unpinning a stream writes its cold blocks to a spill file and releases
//! their memory; rows keep their insertion order across a spill/reload
//! round trip.

use granite_common::{internal_err, Result, Row, RowBatch, RowSchema};
use log::debug;

use crate::disk_manager::SpillFile;
use crate::memory_pool::MemoryReservation;
use crate::runtime_env::RuntimeEnv;
use std::sync::Arc;

/// Opaque address of a row within a [`TupleStream`], used as a hash table
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowIdx {
    pub block: u32,
    pub offset: u32,
}

impl RowIdx {
    pub fn to_u64(self) -> u64 {
        ((self.block as u64) << 32) | self.offset as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            block: (v >> 32) as u32,
            offset: v as u32,
        }
    }
}

#[derive(Debug)]
struct Block {
    /// In-memory contents; empty when the block lives only on disk.
    data: Vec<u8>,
    /// Reserved byte capacity of this block.
    capacity: usize,
    /// Bytes written (equal to `data.len()` while resident).
    len: usize,
    num_rows: usize,
    /// Offset of this block's image in the spill file, once written.
    spill_offset: Option<u64>,
    /// Whether the block's bytes are in memory (and counted against the
    /// stream's reservation).
    resident: bool,
}

impl Block {
    fn in_mem(&self) -> bool {
        self.resident
    }
}

/// Read cursor state; see [`TupleStream::prepare_for_read`].
#[derive(Debug, Default)]
struct ReadCursor {
    block: usize,
    offset: usize,
    rows_read: u64,
}

#[derive(Debug)]
pub struct TupleStream {
    name: String,
    schema: RowSchema,
    env: Arc<RuntimeEnv>,
    reservation: MemoryReservation,
    blocks: Vec<Block>,
    spill_file: Option<SpillFile>,
    num_rows: u64,
    bytes_unpinned: usize,
    /// Total bytes ever written to the spill file, for disk accounting.
    bytes_on_disk: usize,
    /// Whole-stream pin state. An unpinned stream keeps at most its write
    /// block (and, while reading, one read block) in memory.
    pinned: bool,
    use_small_buffers: bool,
    read_cursor: Option<ReadCursor>,
}

impl TupleStream {
    pub fn new(
        name: impl Into<String>,
        schema: RowSchema,
        env: Arc<RuntimeEnv>,
        reservation: MemoryReservation,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            env,
            reservation,
            blocks: Vec::new(),
            spill_file: None,
            num_rows: 0,
            bytes_unpinned: 0,
            bytes_on_disk: 0,
            pinned: true,
            use_small_buffers: true,
            read_cursor: None,
        }
    }

    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn using_small_buffers(&self) -> bool {
        self.use_small_buffers
    }

    /// Bytes of this stream currently resident in memory.
    pub fn bytes_in_mem(&self) -> usize {
        self.reservation.size()
    }

    /// Bytes of this stream currently on disk only.
    pub fn bytes_unpinned(&self) -> usize {
        self.bytes_unpinned
    }

    fn next_block_capacity(&self, min: usize) -> usize {
        let io_size = self.env.io_block_size();
        let size = if self.use_small_buffers {
            match self.blocks.len() {
                0 => (io_size / 128).max(64),
                1 => (io_size / 16).max(64),
                _ => io_size,
            }
        } else {
            io_size
        };
        size.max(min)
    }

    /// Appends a row, returning its address, or `Ok(None)` if the memory for
    /// a new block could not be reserved (the caller should free memory by
    /// spilling and retry).
    pub fn add_row(&mut self, row: &Row) -> Result<Option<RowIdx>> {
        debug_assert!(self.read_cursor.is_none(), "stream already reading");
        let size = self.schema.serialized_size(row);
        let needs_block = match self.blocks.last() {
            Some(block) => !block.resident || block.len + size > block.capacity,
            None => true,
        };
        if needs_block && !self.start_new_block(size)? {
            return Ok(None);
        }
        let block_idx = self.blocks.len() - 1;
        let block = &mut self.blocks[block_idx];
        let offset = block.len;
        let written = self.schema.serialize(row, &mut block.data)?;
        debug_assert_eq!(written, size);
        block.len += written;
        block.num_rows += 1;
        self.num_rows += 1;
        Ok(Some(RowIdx {
            block: block_idx as u32,
            offset: offset as u32,
        }))
    }

    /// Closes the current write block (spilling it if the stream is
    /// unpinned) and reserves a new one. Returns false on reservation
    /// failure.
    fn start_new_block(&mut self, min_capacity: usize) -> Result<bool> {
        if !self.pinned {
            // Rotate the full write block to disk before reserving the next,
            // so an unpinned stream holds one write block at a time.
            if let Some(last) = self.blocks.len().checked_sub(1) {
                self.spill_block(last)?;
            }
        }
        let capacity = self.next_block_capacity(min_capacity);
        if self.reservation.try_grow(capacity).is_err() {
            return Ok(false);
        }
        self.blocks.push(Block {
            data: Vec::with_capacity(capacity),
            capacity,
            len: 0,
            num_rows: 0,
            spill_offset: None,
            resident: true,
        });
        Ok(true)
    }

    /// Switches future block allocations to I/O-sized buffers, and makes
    /// sure the stream's write block is I/O-sized. Returns false if the
    /// buffer could not be reserved.
    pub fn switch_to_io_buffers(&mut self) -> Result<bool> {
        if !self.use_small_buffers {
            return Ok(true);
        }
        self.use_small_buffers = false;
        // Pre-reserve the I/O-sized write block so that probe rows arriving
        // later cannot fail on a small stream.
        self.start_new_block(0)
    }

    /// Writes block `idx` to the spill file (if not already there) and
    /// releases its memory.
    fn spill_block(&mut self, idx: usize) -> Result<()> {
        if !self.blocks[idx].in_mem() {
            return Ok(());
        }
        if self.blocks[idx].spill_offset.is_none() {
            if self.spill_file.is_none() {
                self.spill_file =
                    Some(self.env.disk_manager().create_tmp_file(&self.name)?);
            }
            self.env
                .disk_manager()
                .consume_disk_space(self.blocks[idx].len)?;
            let offset = self
                .spill_file
                .as_mut()
                .unwrap()
                .append_block(&self.blocks[idx].data)?;
            self.blocks[idx].spill_offset = Some(offset);
            self.bytes_on_disk += self.blocks[idx].len;
        }
        let block = &mut self.blocks[idx];
        self.bytes_unpinned += block.len;
        block.data = Vec::new();
        block.resident = false;
        self.reservation.shrink(block.capacity);
        Ok(())
    }

    /// Reloads block `idx` from the spill file. Fails with a resources error
    /// if the memory cannot be reserved.
    fn load_block(&mut self, idx: usize) -> Result<()> {
        if self.blocks[idx].in_mem() {
            return Ok(());
        }
        let (offset, len, capacity) = {
            let block = &self.blocks[idx];
            (block.spill_offset.unwrap(), block.len, block.capacity)
        };
        self.reservation.try_grow(capacity)?;
        let file = match self.spill_file.as_ref() {
            Some(file) => file,
            None => return internal_err!("stream {} lost its spill file", self.name),
        };
        let mut data = file.read_block(offset, len)?;
        data.reserve(capacity - data.len());
        self.blocks[idx].data = data;
        self.blocks[idx].resident = true;
        self.bytes_unpinned -= len;
        Ok(())
    }

    /// Unpins the stream: every block except (unless `unpin_all`) the write
    /// block is written to the spill file and its memory released.
    pub fn unpin_stream(&mut self, unpin_all: bool) -> Result<()> {
        let num_blocks = self.blocks.len();
        if num_blocks == 0 {
            self.pinned = false;
            return Ok(());
        }
        let keep_write_block = !unpin_all && self.read_cursor.is_none();
        let spill_until = if keep_write_block {
            num_blocks - 1
        } else {
            num_blocks
        };
        for idx in 0..spill_until {
            self.spill_block(idx)?;
        }
        self.pinned = false;
        debug!(
            "unpinned stream {}: {} rows, {} bytes on disk",
            self.name, self.num_rows, self.bytes_unpinned
        );
        Ok(())
    }

    /// Brings every block back into memory. Returns false if the memory
    /// could not be reserved (the stream stays unpinned).
    pub fn pin_stream(&mut self) -> Result<bool> {
        let needed: usize = self
            .blocks
            .iter()
            .filter(|b| !b.in_mem())
            .map(|b| b.capacity)
            .sum();
        if needed > 0 && self.reservation.try_grow(needed).is_err() {
            return Ok(false);
        }
        // Hand the pre-reserved bytes to load_block one block at a time.
        if needed > 0 {
            self.reservation.shrink(needed);
        }
        for idx in 0..self.blocks.len() {
            self.load_block(idx)?;
        }
        self.pinned = true;
        Ok(true)
    }

    /// Positions the read cursor at the first row. With `pinned` the whole
    /// stream is brought into memory (returning false if that fails);
    /// otherwise one block at a time is resident during the scan.
    pub fn prepare_for_read(&mut self, pinned: bool) -> Result<bool> {
        if pinned && !self.pin_stream()? {
            return Ok(false);
        }
        if !pinned && !self.blocks.is_empty() {
            // Need the first block resident to start the scan.
            if !self.blocks[0].in_mem() {
                self.load_block(0)?;
            }
        }
        self.read_cursor = Some(ReadCursor::default());
        Ok(true)
    }

    /// Reads the next rows into `batch` until it is at capacity or the
    /// stream is exhausted. Returns true at end of stream.
    pub fn get_next(&mut self, batch: &mut RowBatch) -> Result<bool> {
        let mut cursor = match self.read_cursor.take() {
            Some(c) => c,
            None => return internal_err!("stream {} is not prepared for read", self.name),
        };
        let eos = loop {
            if cursor.block >= self.blocks.len() {
                break true;
            }
            if batch.at_capacity() {
                break false;
            }
            if cursor.offset >= self.blocks[cursor.block].len {
                // Advance to the next block; in unpinned mode drop the one
                // just finished.
                if !self.pinned {
                    self.spill_block(cursor.block)?;
                }
                cursor.block += 1;
                cursor.offset = 0;
                if cursor.block < self.blocks.len() && !self.blocks[cursor.block].in_mem()
                {
                    self.load_block(cursor.block)?;
                }
                continue;
            }
            let block = &self.blocks[cursor.block];
            let (row, consumed) = self.schema.deserialize(&block.data, cursor.offset)?;
            cursor.offset += consumed;
            cursor.rows_read += 1;
            batch.add_row(row);
        };
        if !eos {
            self.read_cursor = Some(cursor);
        }
        Ok(eos)
    }

    /// Random access by row address. The block holding the row must be
    /// resident, which is guaranteed while the stream is pinned.
    pub fn read_row(&self, idx: RowIdx) -> Result<Row> {
        let block = match self.blocks.get(idx.block as usize) {
            Some(b) if b.in_mem() => b,
            Some(_) => {
                return internal_err!(
                    "row {:?} of stream {} addressed while its block is unpinned",
                    idx,
                    self.name
                )
            }
            None => return internal_err!("row {:?} out of range", idx),
        };
        let (row, _) = self.schema.deserialize(&block.data, idx.offset as usize)?;
        Ok(row)
    }

    /// Overwrites the fixed slots of the row at `idx` in place. Only valid
    /// for fixed-width schemas (aggregate intermediates).
    pub fn update_row(&mut self, idx: RowIdx, row: &Row) -> Result<()> {
        if self.schema.has_var_len() {
            return internal_err!("update_row on a var-len schema");
        }
        let fixed = self.schema.fixed_size();
        let block = match self.blocks.get_mut(idx.block as usize) {
            Some(b) if b.in_mem() => b,
            _ => return internal_err!("row {idx:?} not resident for update"),
        };
        let start = idx.offset as usize;
        self.schema.overwrite(row, &mut block.data[start..start + fixed])
    }

    /// Iterates `(address, row)` pairs in insertion order. The stream must
    /// be fully pinned (every block resident).
    pub fn pinned_rows(&self) -> PinnedRows<'_> {
        debug_assert!(self.blocks.iter().all(|b| b.in_mem()));
        PinnedRows {
            stream: self,
            block: 0,
            offset: 0,
            row_in_block: 0,
        }
    }

    /// Brings the entire stream into memory and returns all rows, or
    /// `Ok(None)` if the rows do not fit (the caller turns this into a
    /// side-specific error).
    pub fn get_rows(&mut self) -> Result<Option<Vec<Row>>> {
        if !self.pin_stream()? {
            return Ok(None);
        }
        let mut rows = Vec::with_capacity(self.num_rows as usize);
        for block in &self.blocks {
            let mut offset = 0;
            for _ in 0..block.num_rows {
                let (row, consumed) = self.schema.deserialize(&block.data, offset)?;
                offset += consumed;
                rows.push(row);
            }
        }
        Ok(Some(rows))
    }

    /// Releases all memory and disk space held by the stream.
    pub fn close(&mut self) {
        self.blocks.clear();
        self.reservation.free();
        self.env.disk_manager().release_disk_space(self.bytes_on_disk);
        self.bytes_on_disk = 0;
        self.bytes_unpinned = 0;
        self.spill_file = None;
        self.read_cursor = None;
    }

}

impl Drop for TupleStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Iterator over a pinned stream's rows and their addresses.
pub struct PinnedRows<'a> {
    stream: &'a TupleStream,
    block: usize,
    offset: usize,
    row_in_block: usize,
}

impl Iterator for PinnedRows<'_> {
    type Item = Result<(RowIdx, Row)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let block = self.stream.blocks.get(self.block)?;
            if self.row_in_block >= block.num_rows {
                self.block += 1;
                self.offset = 0;
                self.row_in_block = 0;
                continue;
            }
            let idx = RowIdx {
                block: self.block as u32,
                offset: self.offset as u32,
            };
            return match self.stream.schema.deserialize(&block.data, self.offset) {
                Ok((row, consumed)) => {
                    self.offset += consumed;
                    self.row_in_block += 1;
                    Some(Ok((idx, row)))
                }
                Err(e) => {
                    // Abort the scan on a corrupt block.
                    self.block = self.stream.blocks.len();
                    Some(Err(e))
                }
            };
        }
    }
}
