//! Tiny raster previews stored next to index slots.

use std::io;
use std::path::Path;

use crate::raster::Raster;
use crate::slot_file::SlotFile;

pub const THUMBNAIL_MAX_SIDE: u32 = 16;
const THUMBNAIL_HEADER_SIZE: usize = 16;
pub const THUMBNAIL_SLOT_SIZE: usize =
    (THUMBNAIL_MAX_SIDE * THUMBNAIL_MAX_SIDE * 4) as usize + THUMBNAIL_HEADER_SIZE;

#[derive(Debug)]
pub struct ThumbnailStore {
    slots: SlotFile,
}

impl ThumbnailStore {
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        Ok(Self {
            slots: SlotFile::open(path, THUMBNAIL_SLOT_SIZE, read_only)?,
        })
    }

    /// Store a preview of `raster`, scaled down to fit the slot.
    pub fn write(&mut self, slot: u32, raster: &Raster) -> io::Result<()> {
        if !raster.is_valid() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "raster is not valid",
            ));
        }
        let (scaled, halvings) = raster.scaled_to_fit(THUMBNAIL_MAX_SIDE);

        let mut record = Vec::with_capacity(THUMBNAIL_SLOT_SIZE);
        record.extend_from_slice(&scaled.width.to_le_bytes());
        record.extend_from_slice(&scaled.height.to_le_bytes());
        record.extend_from_slice(&u32::from(scaled.components).to_le_bytes());
        record.extend_from_slice(&halvings.to_le_bytes());
        record.extend_from_slice(&scaled.data[..scaled.expected_len()]);
        self.slots.write(slot, &record)
    }

    /// Returns `None` for an empty or unreadable slot.
    pub fn read(&mut self, slot: u32) -> io::Result<Option<Raster>> {
        let record = match self.slots.read(slot, 0, THUMBNAIL_SLOT_SIZE) {
            Ok(record) => record,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        };
        let field = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&record[i * 4..i * 4 + 4]);
            u32::from_le_bytes(buf)
        };
        let (width, height, components) = (field(0), field(1), field(2));
        if width == 0
            || height == 0
            || width > THUMBNAIL_MAX_SIDE
            || height > THUMBNAIL_MAX_SIDE
            || !(1..=4).contains(&components)
        {
            return Ok(None);
        }
        let len = (width * height * components) as usize;
        let data = record[THUMBNAIL_HEADER_SIZE..THUMBNAIL_HEADER_SIZE + len].to_vec();
        Ok(Some(Raster::new(width, height, components as u8, data)))
    }

    pub fn clear_slot(&mut self, slot: u32) -> io::Result<()> {
        self.slots.write(slot, &[])
    }

    pub fn copy_slot(&mut self, from: u32, to: u32) -> io::Result<()> {
        self.slots.copy_slot(from, to)
    }

    pub fn truncate(&mut self, slots: u32) -> io::Result<()> {
        self.slots.truncate(slots)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::Builder;

    use super::*;

    #[test]
    fn test_thumbnail_is_scaled() {
        let dir = Builder::new().prefix("thumbnails").tempdir().unwrap();
        let mut store = ThumbnailStore::open(&dir.path().join("thumbs"), false).unwrap();

        let raster = Raster::new(128, 64, 4, vec![200; 128 * 64 * 4]);
        store.write(3, &raster).unwrap();

        let thumb = store.read(3).unwrap().unwrap();
        assert_eq!((thumb.width, thumb.height, thumb.components), (16, 8, 4));
        assert!(thumb.data.iter().all(|&b| b == 200));

        // Unwritten slot before the last one reads as empty
        assert_eq!(store.read(1).unwrap(), None);
        // Past the end of the file
        assert_eq!(store.read(10).unwrap(), None);

        store.clear_slot(3).unwrap();
        assert_eq!(store.read(3).unwrap(), None);
    }

    #[test]
    fn test_invalid_raster_rejected() {
        let dir = Builder::new().prefix("thumbnails").tempdir().unwrap();
        let mut store = ThumbnailStore::open(&dir.path().join("thumbs"), false).unwrap();
        let raster = Raster::new(4, 4, 3, vec![0; 5]);
        assert!(store.write(0, &raster).is_err());
    }
}
