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

//! Execution runtime environment: the memory pool and disk manager shared
//! by every operator of a fragment instance.

use std::sync::Arc;

use granite_common::Result;

use crate::disk_manager::{DiskManager, DiskManagerConfig};
use crate::memory_pool::{GreedyMemoryPool, MemoryPool, UnboundedMemoryPool};

/// Default I/O-sized block for tuple streams.
pub const DEFAULT_IO_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Shared execution resources.
#[derive(Debug)]
pub struct RuntimeEnv {
    memory_pool: Arc<dyn MemoryPool>,
    disk_manager: Arc<DiskManager>,
    io_block_size: usize,
}

impl RuntimeEnv {
    pub fn memory_pool(&self) -> &Arc<dyn MemoryPool> {
        &self.memory_pool
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    pub fn io_block_size(&self) -> usize {
        self.io_block_size
    }
}

/// Builder for [`RuntimeEnv`].
///
/// ```
/// use granite_execution::runtime_env::RuntimeEnvBuilder;
///
/// let env = RuntimeEnvBuilder::new()
///     .with_memory_limit(64 * 1024 * 1024)
///     .build()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct RuntimeEnvBuilder {
    memory_pool: Option<Arc<dyn MemoryPool>>,
    disk_manager_config: Option<DiskManagerConfig>,
    io_block_size: Option<usize>,
}

impl RuntimeEnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific memory pool implementation.
    pub fn with_memory_pool(mut self, pool: Arc<dyn MemoryPool>) -> Self {
        self.memory_pool = Some(pool);
        self
    }

    /// Shorthand for a greedy pool of `limit` bytes.
    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_pool = Some(Arc::new(GreedyMemoryPool::new(limit)));
        self
    }

    pub fn with_disk_manager_config(mut self, config: DiskManagerConfig) -> Self {
        self.disk_manager_config = Some(config);
        self
    }

    pub fn with_io_block_size(mut self, size: usize) -> Self {
        self.io_block_size = Some(size);
        self
    }

    pub fn build(self) -> Result<Arc<RuntimeEnv>> {
        let memory_pool = self
            .memory_pool
            .unwrap_or_else(|| Arc::new(UnboundedMemoryPool::default()));
        let disk_manager =
            DiskManager::try_new(self.disk_manager_config.unwrap_or_default())?;
        Ok(Arc::new(RuntimeEnv {
            memory_pool,
            disk_manager,
            io_block_size: self.io_block_size.unwrap_or(DEFAULT_IO_BLOCK_SIZE),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_pool::MemoryLimit;

    #[test]
    fn default_env_is_unbounded() {
        let env = RuntimeEnvBuilder::new().build().unwrap();
        assert_eq!(env.memory_pool().memory_limit(), MemoryLimit::Infinite);
        assert_eq!(env.io_block_size(), DEFAULT_IO_BLOCK_SIZE);
    }

    #[test]
    fn limited_env() {
        let env = RuntimeEnvBuilder::new()
            .with_memory_limit(1024)
            .with_io_block_size(256)
            .build()
            .unwrap();
        assert_eq!(env.memory_pool().memory_limit(), MemoryLimit::Finite(1024));
        assert_eq!(env.io_block_size(), 256);
    }
}
