use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs_err::{File, OpenOptions};

/// A file made of fixed-size slots, addressed by slot index.
#[derive(Debug)]
pub struct SlotFile {
    path: PathBuf,
    slot_size: usize,
    file: Option<File>,
}

impl SlotFile {
    pub fn open(path: &Path, slot_size: usize, read_only: bool) -> io::Result<Self> {
        let file = if read_only {
            match File::open(path) {
                Ok(file) => Some(file),
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => return Err(err),
            }
        } else {
            Some(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?,
            )
        };
        Ok(Self {
            path: path.to_path_buf(),
            slot_size,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Read `len` bytes starting `offset` bytes into the slot. A short read is an error.
    pub fn read(&mut self, slot: u32, offset: usize, len: usize) -> io::Result<Vec<u8>> {
        debug_assert!(offset + len <= self.slot_size);
        let position = self.position(slot) + offset as u64;
        let file = self.file_mut()?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|err| io::Error::new(io::ErrorKind::OutOfMemory, err))?;
        buf.resize(len, 0);
        file.seek(SeekFrom::Start(position))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write `data` at the start of the slot, zero-padding the rest of the slot.
    pub fn write(&mut self, slot: u32, data: &[u8]) -> io::Result<()> {
        let len = data.len().min(self.slot_size);
        let mut record = vec![0u8; self.slot_size];
        record[..len].copy_from_slice(&data[..len]);

        let position = self.position(slot);
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(&record)
    }

    pub fn copy_slot(&mut self, from: u32, to: u32) -> io::Result<()> {
        if from == to {
            return Ok(());
        }
        let record = self.read(from, 0, self.slot_size)?;
        self.write(to, &record)
    }

    /// Drop all slots at and after `slots`.
    pub fn truncate(&mut self, slots: u32) -> io::Result<()> {
        let len = self.position(slots);
        let file = self.file_mut()?;
        file.set_len(len)
    }

    fn position(&self, slot: u32) -> u64 {
        slot as u64 * self.slot_size as u64
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        let path = &self.path;
        self.file.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("slot file {} is not available", path.display()),
            )
        })
    }
}
