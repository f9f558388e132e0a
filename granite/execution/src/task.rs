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

//! Per-query task state: cooperative cancellation and periodic maintenance.
//!
//! Operators check the cancellation flag at least once per row batch and,
//! within long inner loops, every `maintenance_interval` iterations, so that
//! the latency to observe a cancellation stays bounded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use granite_common::{roundup_pow2, QueryError, Result};

#[derive(Debug, Default)]
pub struct TaskContext {
    cancelled: AtomicBool,
}

impl TaskContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request cooperative cancellation. Safe to call from another thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Err(Cancelled)` once [`TaskContext::cancel`] has been called.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        Ok(())
    }

    /// How many inner-loop iterations may pass between cancellation checks.
    pub fn maintenance_interval(batch_size: usize) -> usize {
        roundup_pow2(batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag() {
        let task = TaskContext::new();
        assert!(task.check_cancelled().is_ok());
        task.cancel();
        assert!(matches!(
            task.check_cancelled(),
            Err(QueryError::Cancelled)
        ));
    }

    #[test]
    fn maintenance_interval_is_pow2() {
        assert_eq!(TaskContext::maintenance_interval(1000), 1024);
        assert_eq!(TaskContext::maintenance_interval(1024), 1024);
    }
}
