use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fs_err as fs;

use crate::content_id::ContentId;

const SHARDS: &str = "0123456789abcdef";
const BODY_EXTENSION: &str = "body";

/// Per-id files holding the payload beyond the inline header, sharded by leading hex digit.
#[derive(Debug, Clone)]
pub struct BodyStore {
    root: PathBuf,
}

impl BodyStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, id: &ContentId) -> PathBuf {
        self.root
            .join(id.shard().to_string())
            .join(format!("{id}.{BODY_EXTENSION}"))
    }

    pub fn create_dirs(&self) -> io::Result<()> {
        for shard in SHARDS.chars() {
            fs::create_dir_all(self.root.join(shard.to_string()))?;
        }
        Ok(())
    }

    /// Size of the body file, `None` if there is none.
    pub fn file_size(&self, id: &ContentId) -> io::Result<Option<u64>> {
        match fs::metadata(self.path(id)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read exactly `len` bytes from `offset`. A short file is an `UnexpectedEof` error.
    pub fn read(&self, id: &ContentId, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = fs::File::open(self.path(id))?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|err| io::Error::new(io::ErrorKind::OutOfMemory, err))?;
        buf.resize(len, 0);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Replace the body of `id`.
    pub fn write(&self, id: &ContentId, data: &[u8]) -> io::Result<()> {
        fs::write(self.path(id), data)
    }

    /// Returns whether a file was removed.
    pub fn remove(&self, id: &ContentId) -> io::Result<bool> {
        remove_file(&self.path(id))
    }

    /// Delete every body file. With `remove_dirs`, the shard directories go as well.
    pub fn remove_all(&self, remove_dirs: bool) -> io::Result<usize> {
        let mut removed = 0;
        for shard in SHARDS.chars() {
            let dir = self.root.join(shard.to_string());
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            for entry in entries {
                let path = entry?.path();
                if path.is_file() && remove_file(&path)? {
                    removed += 1;
                }
            }
            if remove_dirs {
                fs::remove_dir(&dir)?;
            }
        }
        log::info!(
            "Deleted {removed} texture body files under {}",
            self.root.display()
        );
        Ok(removed)
    }
}

pub(crate) fn remove_file(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}
