use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dfs_cache::{ByteChannel, FileOpener, ReadableChannel};
use dfs_types::{PackDescription, PackExt, PackSource, RepositoryDescription};
use parking_lot::RwLock;

use crate::error::OdbResult;
use crate::storage::{now_millis, DfsOutputStream, DfsStorage};

#[derive(Default)]
struct State {
    packs: Vec<PackDescription>,
    files: HashMap<String, Bytes>,
}

/// Storage that keeps every file in memory.
///
/// Intended for tests and embedding. Files of retired packs stay readable
/// until rolled back, so readers holding an older pack list keep working.
pub struct InMemoryStorage {
    repository: RepositoryDescription,
    state: Arc<RwLock<State>>,
    sequence: AtomicU64,
    clock: AtomicU64,
    block_size: u32,
}

impl InMemoryStorage {
    pub fn new(repository: RepositoryDescription) -> Self {
        Self {
            repository,
            state: Arc::new(RwLock::new(State::default())),
            sequence: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            block_size: 0,
        }
    }

    /// Report `block_size` as the preferred block size of every file.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Number of files held, committed or not.
    pub fn file_count(&self) -> usize {
        self.state.read().files.len()
    }

    /// Replace the contents of a stored file.
    pub fn overwrite_file(&self, desc: &PackDescription, ext: PackExt, data: Vec<u8>) {
        self.state.write().files.insert(desc.file_name(ext), Bytes::from(data));
    }

    /// Drop a stored file, as if the backend lost it.
    pub fn remove_file(&self, desc: &PackDescription, ext: PackExt) -> bool {
        self.state.write().files.remove(&desc.file_name(ext)).is_some()
    }

    /// Strictly increasing modification times, even within one millisecond.
    fn tick(&self) -> u64 {
        let now = now_millis();
        let mut prev = self.clock.load(Ordering::Acquire);
        loop {
            let next = now.max(prev + 1);
            match self
                .clock
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

impl FileOpener for InMemoryStorage {
    fn open_file(&self, desc: &PackDescription, ext: PackExt) -> io::Result<Box<dyn ReadableChannel>> {
        let name = desc.file_name(ext);
        match self.state.read().files.get(&name) {
            Some(data) => {
                let mut channel = ByteChannel::new(data.clone());
                if self.block_size > 0 {
                    channel = channel.with_block_size(self.block_size);
                }
                Ok(Box::new(channel))
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, name)),
        }
    }
}

impl DfsStorage for InMemoryStorage {
    fn repository(&self) -> &RepositoryDescription {
        &self.repository
    }

    fn list_packs(&self) -> OdbResult<Vec<PackDescription>> {
        Ok(self.state.read().packs.clone())
    }

    fn new_pack(&self, source: PackSource) -> OdbResult<PackDescription> {
        let n = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("pack-{n}-{}", source.name());
        let mut desc = PackDescription::new(self.repository.clone(), name, source);
        desc.last_modified = self.tick();
        Ok(desc)
    }

    fn write_file(&self, desc: &PackDescription, ext: PackExt) -> OdbResult<Box<dyn DfsOutputStream>> {
        Ok(Box::new(MemoryOutput {
            name: desc.file_name(ext),
            buf: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }

    fn commit_pack(&self, added: &[PackDescription], replaced: &[PackDescription]) -> OdbResult<()> {
        let mut state = self.state.write();
        state
            .packs
            .retain(|p| !replaced.contains(p) && !added.contains(p));
        state.packs.extend(added.iter().cloned());
        Ok(())
    }

    fn rollback_pack(&self, descs: &[PackDescription]) -> OdbResult<()> {
        let mut state = self.state.write();
        for desc in descs {
            for ext in PackExt::ALL {
                state.files.remove(&desc.file_name(ext));
            }
        }
        Ok(())
    }
}

struct MemoryOutput {
    name: String,
    buf: Vec<u8>,
    state: Arc<RwLock<State>>,
}

impl Write for MemoryOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DfsOutputStream for MemoryOutput {
    fn close(self: Box<Self>) -> io::Result<()> {
        let this = *self;
        this.state.write().files.insert(this.name, Bytes::from(this.buf));
        Ok(())
    }
}
