//! Packs stored as plain files in one directory.
//!
//! Each committed pack has a JSON sidecar `<pack>.desc.json` holding its
//! [`PackDescription`]; listing reads the sidecars, so a pack whose files
//! are written but not committed stays invisible.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use dfs_cache::{FileOpener, ReadableChannel};
use dfs_types::{PackDescription, PackExt, PackSource, RepositoryDescription};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OdbResult;
use crate::storage::{now_millis, DfsOutputStream, DfsStorage};

const SIDECAR_SUFFIX: &str = ".desc.json";

/// Storage over a local directory.
pub struct LocalDirStorage {
    repository: RepositoryDescription,
    dir: PathBuf,
    block_size: u32,
}

impl LocalDirStorage {
    /// Use `dir` (created if missing) for the packs of `repository`.
    pub fn open(repository: RepositoryDescription, dir: impl AsRef<Path>) -> OdbResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            repository,
            dir,
            block_size: 0,
        })
    }

    /// Report `block_size` as the preferred block size of every file.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, desc: &PackDescription, ext: PackExt) -> PathBuf {
        self.dir.join(desc.file_name(ext))
    }

    fn sidecar(&self, desc: &PackDescription) -> PathBuf {
        self.dir.join(format!("{}{SIDECAR_SUFFIX}", desc.pack_name))
    }
}

impl FileOpener for LocalDirStorage {
    fn open_file(&self, desc: &PackDescription, ext: PackExt) -> io::Result<Box<dyn ReadableChannel>> {
        let file = File::open(self.path(desc, ext))?;
        let size = file.metadata()?.len();
        Ok(Box::new(FileChannel {
            file,
            position: 0,
            size,
            block_size: self.block_size,
        }))
    }
}

impl DfsStorage for LocalDirStorage {
    fn repository(&self) -> &RepositoryDescription {
        &self.repository
    }

    fn list_packs(&self) -> OdbResult<Vec<PackDescription>> {
        let mut packs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_sidecar = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX));
            if !is_sidecar {
                continue;
            }
            let mut desc: PackDescription = serde_json::from_slice(&fs::read(&path)?)?;
            if desc.repository != self.repository {
                warn!(path = %path.display(), "skipping pack of another repository");
                continue;
            }
            for ext in desc.extensions().collect::<Vec<_>>() {
                if desc.file_size(ext) == 0 {
                    if let Ok(meta) = fs::metadata(self.path(&desc, ext)) {
                        desc.set_file_size(ext, meta.len());
                    }
                }
            }
            packs.push(desc);
        }
        debug!(dir = %self.dir.display(), packs = packs.len(), "listed packs");
        Ok(packs)
    }

    fn new_pack(&self, source: PackSource) -> OdbResult<PackDescription> {
        let name = format!("pack-{}-{}", Uuid::now_v7().simple(), source.name());
        let mut desc = PackDescription::new(self.repository.clone(), name, source);
        desc.last_modified = now_millis();
        Ok(desc)
    }

    fn write_file(&self, desc: &PackDescription, ext: PackExt) -> OdbResult<Box<dyn DfsOutputStream>> {
        let tmp = NamedTempFile::new_in(&self.dir)?;
        let writer = BufWriter::new(tmp.reopen()?);
        Ok(Box::new(FileOutput {
            tmp,
            writer,
            target: self.path(desc, ext),
            block_size: self.block_size,
        }))
    }

    fn commit_pack(&self, added: &[PackDescription], replaced: &[PackDescription]) -> OdbResult<()> {
        for desc in added {
            let mut tmp = NamedTempFile::new_in(&self.dir)?;
            serde_json::to_writer_pretty(&mut tmp, desc)?;
            tmp.as_file().sync_all()?;
            tmp.persist(self.sidecar(desc)).map_err(|e| e.error)?;
        }
        for desc in replaced {
            remove_if_present(&self.sidecar(desc))?;
            for ext in desc.extensions() {
                remove_if_present(&self.path(desc, ext))?;
            }
        }
        debug!(added = added.len(), replaced = replaced.len(), "committed packs");
        Ok(())
    }

    fn rollback_pack(&self, descs: &[PackDescription]) -> OdbResult<()> {
        for desc in descs {
            for ext in PackExt::ALL {
                remove_if_present(&self.path(desc, ext))?;
            }
        }
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

struct FileChannel {
    file: File,
    position: u64,
    size: u64,
    block_size: u32,
}

impl ReadableChannel for FileChannel {
    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    fn size(&mut self) -> io::Result<Option<u64>> {
        Ok(Some(self.size))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// Writes to a temporary file in the pack directory, renamed into place
/// on close.
struct FileOutput {
    tmp: NamedTempFile,
    writer: BufWriter<File>,
    target: PathBuf,
    block_size: u32,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl DfsOutputStream for FileOutput {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let FileOutput {
            tmp,
            writer,
            target,
            ..
        } = *self;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        tmp.persist(target).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &Path) -> LocalDirStorage {
        LocalDirStorage::open(RepositoryDescription::new("local"), dir).unwrap()
    }

    fn write(s: &LocalDirStorage, desc: &PackDescription, ext: PackExt, data: &[u8]) {
        let mut out = s.write_file(desc, ext).unwrap();
        out.write_all(data).unwrap();
        out.close().unwrap();
    }

    #[test]
    fn committed_packs_are_listed_with_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());
        let mut desc = s.new_pack(PackSource::Receive).unwrap();
        desc.add_file_ext(PackExt::Pack).add_file_ext(PackExt::Index);
        write(&s, &desc, PackExt::Pack, b"0123456789");
        write(&s, &desc, PackExt::Index, b"idx");
        assert!(s.list_packs().unwrap().is_empty());

        s.commit_pack(&[desc.clone()], &[]).unwrap();
        let reopened = storage(dir.path());
        let listed = reopened.list_packs().unwrap();
        assert_eq!(listed, vec![desc]);
        assert_eq!(listed[0].file_size(PackExt::Pack), 10);
        assert_eq!(listed[0].source, PackSource::Receive);
    }

    #[test]
    fn channel_reads_at_positions() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path()).with_block_size(4096);
        let desc = s.new_pack(PackSource::Insert).unwrap();
        write(&s, &desc, PackExt::Pack, b"abcdefgh");

        let mut rc = s.open_file(&desc, PackExt::Pack).unwrap();
        assert_eq!(rc.size().unwrap(), Some(8));
        assert_eq!(rc.block_size(), 4096);
        rc.set_position(5).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(dfs_cache::read_fully(rc.as_mut(), &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"fgh");
        assert_eq!(rc.position(), 8);
    }

    #[test]
    fn replaced_and_rolled_back_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let s = storage(dir.path());
        let mut old = s.new_pack(PackSource::Insert).unwrap();
        old.add_file_ext(PackExt::Pack);
        write(&s, &old, PackExt::Pack, b"old");
        s.commit_pack(&[old.clone()], &[]).unwrap();

        let mut new = s.new_pack(PackSource::Compact).unwrap();
        new.add_file_ext(PackExt::Pack);
        write(&s, &new, PackExt::Pack, b"new");
        s.commit_pack(&[new.clone()], &[old.clone()]).unwrap();
        assert_eq!(s.list_packs().unwrap(), vec![new.clone()]);
        assert!(s.open_file(&old, PackExt::Pack).is_err());

        let abandoned = s.new_pack(PackSource::Insert).unwrap();
        write(&s, &abandoned, PackExt::Pack, b"tmp");
        s.rollback_pack(&[abandoned.clone()]).unwrap();
        assert!(s.open_file(&abandoned, PackExt::Pack).is_err());
    }
}
