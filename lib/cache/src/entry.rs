//! On-disk records of the cache index.

use crate::content_id::ContentId;

/// Version tag of the index layout. A different value means a different cache generation.
pub const INDEX_VERSION: f32 = 10001.0;
/// Pointer width the index was written with.
pub const ADDRESS_WIDTH: u32 = 64;

pub const INDEX_HEADER_SIZE: usize = 12;
pub const ENTRY_RECORD_SIZE: usize = 28;

/// Bytes of every payload kept inline in the header data file. The rest goes to a body file.
pub const INLINE_HEADER_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHeader {
    pub version: f32,
    pub address_width: u32,
    pub entry_count: u32,
}

impl IndexHeader {
    pub fn current(entry_count: u32) -> Self {
        Self {
            version: INDEX_VERSION,
            address_width: ADDRESS_WIDTH,
            entry_count,
        }
    }

    pub fn is_current(&self) -> bool {
        self.version == INDEX_VERSION && self.address_width == ADDRESS_WIDTH
    }

    pub fn to_bytes(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut buf = [0u8; INDEX_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.address_width.to_le_bytes());
        buf[8..12].copy_from_slice(&self.entry_count.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; INDEX_HEADER_SIZE]) -> Self {
        Self {
            version: f32::from_le_bytes(le4(buf, 0)),
            address_width: u32::from_le_bytes(le4(buf, 4)),
            entry_count: u32::from_le_bytes(le4(buf, 8)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: ContentId,
    /// Logical size of the whole asset. Negative for a free slot.
    pub image_size: i32,
    /// Bytes stored in the body file, beyond the inline header.
    pub body_size: i32,
    pub last_access: u32,
}

impl CacheEntry {
    pub fn free() -> Self {
        Self {
            id: ContentId::default(),
            image_size: -1,
            body_size: 0,
            last_access: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.image_size <= 0
    }

    /// The body can never hold the whole image: the inline header always holds a part of it.
    pub fn is_corrupted(&self) -> bool {
        !self.is_free() && (self.body_size < 0 || self.body_size >= self.image_size)
    }

    pub fn is_live(&self) -> bool {
        !self.is_free() && !self.is_corrupted()
    }

    /// Number of payload bytes held by the cache for this entry.
    pub fn cached_size(&self) -> usize {
        if self.is_free() {
            return 0;
        }
        let stored = INLINE_HEADER_SIZE + self.body_size.max(0) as usize;
        stored.min(self.image_size as usize)
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_RECORD_SIZE] {
        let mut buf = [0u8; ENTRY_RECORD_SIZE];
        buf[0..16].copy_from_slice(self.id.as_bytes());
        buf[16..20].copy_from_slice(&self.image_size.to_le_bytes());
        buf[20..24].copy_from_slice(&self.body_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.last_access.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; ENTRY_RECORD_SIZE]) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(&buf[0..16]);
        Self {
            id: ContentId::from_bytes(id),
            image_size: i32::from_le_bytes(le4(buf, 16)),
            body_size: i32::from_le_bytes(le4(buf, 20)),
            last_access: u32::from_le_bytes(le4(buf, 24)),
        }
    }
}

/// Size of the body part of a payload of `data_size` bytes.
pub fn body_size_for(data_size: usize) -> i32 {
    data_size.saturating_sub(INLINE_HEADER_SIZE) as i32
}

fn le4(buf: &[u8], at: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[at..at + 4]);
    out
}
