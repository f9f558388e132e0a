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

//! [`DiskManager`]: manages the spill files that unpinned tuple-stream
//! blocks are written to. Block contents are the on-write in-memory tuple
//! layout; no re-encoding happens on the way to disk.

use granite_common::{resources_err, resources_granite_err, Result};
use log::debug;
use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::{Builder, NamedTempFile, TempDir};

const DEFAULT_MAX_TEMP_DIRECTORY_SIZE: usize = 100 * 1024 * 1024 * 1024; // 100GB

/// Configuration for temporary disk access
#[derive(Debug, Clone, Default)]
pub enum DiskManagerConfig {
    /// Create spill files within a temporary directory chosen by the OS
    #[default]
    NewOs,

    /// Create spill files within the specified directories
    NewSpecified(Vec<PathBuf>),

    /// Disable spilling; attempts to create spill files will error
    Disabled,
}

impl DiskManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_specified(paths: Vec<PathBuf>) -> Self {
        Self::NewSpecified(paths)
    }
}

/// Manages spill files generated during query execution.
#[derive(Debug)]
pub struct DiskManager {
    /// TempDirs to put spill files in.
    ///
    /// If `Some(vec![])` a new OS-specified temporary directory will be
    /// created on first use. If `None`, spilling is disabled.
    local_dirs: Mutex<Option<Vec<Arc<TempDir>>>>,

    /// The maximum number of bytes the spill directories may hold.
    max_temp_directory_size: usize,

    /// Spilled bytes currently on disk.
    used_disk_space: AtomicUsize,
}

impl DiskManager {
    pub fn try_new(config: DiskManagerConfig) -> Result<Arc<Self>> {
        let local_dirs = match config {
            DiskManagerConfig::NewOs => Some(vec![]),
            DiskManagerConfig::NewSpecified(conf_dirs) => {
                let local_dirs = create_local_dirs(conf_dirs)?;
                debug!("Created local dirs {local_dirs:?} as Granite spill directories");
                Some(local_dirs)
            }
            DiskManagerConfig::Disabled => None,
        };
        Ok(Arc::new(Self {
            local_dirs: Mutex::new(local_dirs),
            max_temp_directory_size: DEFAULT_MAX_TEMP_DIRECTORY_SIZE,
            used_disk_space: AtomicUsize::new(0),
        }))
    }

    /// Return true if this disk manager supports creating spill files.
    pub fn tmp_files_enabled(&self) -> bool {
        self.local_dirs.lock().is_some()
    }

    pub fn used_disk_space(&self) -> usize {
        self.used_disk_space.load(Ordering::Relaxed)
    }

    /// Return a spill file from a randomized choice of the configured
    /// locations.
    pub fn create_tmp_file(&self, request_description: &str) -> Result<SpillFile> {
        let mut guard = self.local_dirs.lock();
        let local_dirs = guard.as_mut().ok_or_else(|| {
            resources_granite_err!(
                "Memory Exhausted while {request_description} (DiskManager is disabled)"
            )
        })?;

        // Create a temporary directory on demand
        if local_dirs.is_empty() {
            let tempdir = tempfile::tempdir()?;
            debug!(
                "Created directory '{:?}' as Granite spill directory for {}",
                tempdir.path().to_string_lossy(),
                request_description,
            );
            local_dirs.push(Arc::new(tempdir));
        }

        let dir_index = thread_rng().gen_range(0..local_dirs.len());
        Ok(SpillFile {
            _parent_temp_dir: Arc::clone(&local_dirs[dir_index]),
            tempfile: Builder::new()
                .prefix("granite-spill-")
                .tempfile_in(local_dirs[dir_index].as_ref())?,
            len: 0,
        })
    }

    /// Record that `bytes` more spill data are about to be written, failing
    /// if the disk budget would be exceeded.
    pub fn consume_disk_space(&self, bytes: usize) -> Result<()> {
        let used = self.used_disk_space.fetch_add(bytes, Ordering::Relaxed);
        if used + bytes > self.max_temp_directory_size {
            self.used_disk_space.fetch_sub(bytes, Ordering::Relaxed);
            return resources_err!(
                "spilling would exceed the {} byte scratch disk limit",
                self.max_temp_directory_size
            );
        }
        Ok(())
    }

    pub fn release_disk_space(&self, bytes: usize) {
        self.used_disk_space.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// A spill file that also keeps its parent temporary directory alive.
///
/// Blocks are appended with [`SpillFile::append_block`] and re-read by the
/// returned offset; the file is deleted when the last handle drops.
#[derive(Debug)]
pub struct SpillFile {
    _parent_temp_dir: Arc<TempDir>,
    tempfile: NamedTempFile,
    len: u64,
}

impl SpillFile {
    pub fn path(&self) -> &Path {
        self.tempfile.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `data` and returns the offset it was written at.
    pub fn append_block(&mut self, data: &[u8]) -> Result<u64> {
        let offset = self.len;
        let mut file = self.tempfile.as_file();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(offset)
    }

    /// Reads `len` bytes starting at `offset` into a fresh buffer.
    pub fn read_block(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.tempfile.as_file();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Setup local dirs by creating one new dir in each of the given dirs.
fn create_local_dirs(local_dirs: Vec<PathBuf>) -> Result<Vec<Arc<TempDir>>> {
    local_dirs
        .iter()
        .map(|root| {
            if !Path::new(root).exists() {
                std::fs::create_dir(root)?;
            }
            Ok(Arc::new(
                Builder::new().prefix("granite-").tempdir_in(root)?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_temp_dir_creation() -> Result<()> {
        let dm = DiskManager::try_new(DiskManagerConfig::new())?;
        assert_eq!(0, local_dir_snapshot(&dm).len());

        // Creating a spill file materializes the directory on demand
        let spill = dm.create_tmp_file("Testing")?;
        assert_eq!(1, local_dir_snapshot(&dm).len());
        assert!(spill.path().exists());
        Ok(())
    }

    fn local_dir_snapshot(dm: &DiskManager) -> Vec<PathBuf> {
        dm.local_dirs
            .lock()
            .iter()
            .flatten()
            .map(|p| p.path().into())
            .collect()
    }

    #[test]
    fn file_in_right_dir() -> Result<()> {
        let local_dir = TempDir::new().unwrap();
        let config = DiskManagerConfig::new_specified(vec![local_dir.path().into()]);
        let dm = DiskManager::try_new(config)?;
        assert!(dm.tmp_files_enabled());
        let spill = dm.create_tmp_file("Testing")?;
        assert!(spill.path().starts_with(local_dir.path()));
        Ok(())
    }

    #[test]
    fn disabled_disk_manager_errors() {
        let dm = DiskManager::try_new(DiskManagerConfig::Disabled).unwrap();
        assert!(!dm.tmp_files_enabled());
        let err = dm.create_tmp_file("Testing").unwrap_err();
        assert!(err.is_mem_limit(), "{err}");
    }

    #[test]
    fn block_round_trip() -> Result<()> {
        let dm = DiskManager::try_new(DiskManagerConfig::new())?;
        let mut spill = dm.create_tmp_file("Testing")?;
        let a = spill.append_block(b"hello")?;
        let b = spill.append_block(b"granite")?;
        assert_eq!(spill.read_block(a, 5)?, b"hello");
        assert_eq!(spill.read_block(b, 7)?, b"granite");
        assert_eq!(spill.len(), 12);
        Ok(())
    }

    #[test]
    fn file_removed_on_drop() -> Result<()> {
        let dm = DiskManager::try_new(DiskManagerConfig::new())?;
        let spill = dm.create_tmp_file("Testing")?;
        let path = spill.path().to_owned();
        assert!(path.exists());
        drop(spill);
        assert!(!path.exists());
        Ok(())
    }
}
