//! Byte-count arithmetic of progressive (JPEG-2000 style) texture streams.

use cache::INLINE_HEADER_SIZE;

/// Size of the first packet of a simulator transfer.
pub const FIRST_PACKET_SIZE: usize = 600;
/// Size of every other packet of a simulator transfer, except possibly the last one.
pub const MAX_IMG_PACKET_SIZE: usize = 1000;
pub const MAX_DISCARD_LEVEL: i32 = 5;
pub const MAX_IMAGE_SIZE: u32 = 2048;
pub const MAX_IMAGE_COMPONENTS: u32 = 8;
/// Stands for "the whole asset, however large".
pub const MAX_IMAGE_DATA_SIZE: usize =
    (MAX_IMAGE_SIZE * MAX_IMAGE_SIZE * MAX_IMAGE_COMPONENTS) as usize;

/// Bytes needed to decode a `width` x `height` image with `components` channels at `discard`.
pub fn calc_data_size_j2c(width: u32, height: u32, components: u32, discard: i32) -> usize {
    let discard = discard.clamp(0, MAX_DISCARD_LEVEL) as u32;
    let width = (width >> discard).max(1) as usize;
    let height = (height >> discard).max(1) as usize;
    (width * height * components as usize / 8).max(FIRST_PACKET_SIZE)
}

/// Size and discard level to request for a new fetch.
///
/// Dimensions of zero mean the caller knows nothing about the image, in which case only the
/// smallest useful prefix is fetched, at the coarsest level.
pub fn desired_fetch(width: u32, height: u32, components: u32, discard: i32) -> (usize, i32) {
    if discard == 0 {
        (MAX_IMAGE_DATA_SIZE, 0)
    } else if width > 0 && height > 0 && components > 0 {
        (calc_data_size_j2c(width, height, components, discard), discard)
    } else {
        (INLINE_HEADER_SIZE, MAX_DISCARD_LEVEL)
    }
}

/// Finest level `loaded` bytes can decode, if `desired_size` bytes decode at `desired_discard`.
///
/// Every coarser level needs a quarter of the bytes of the finer one.
pub fn supported_discard(loaded: usize, desired_discard: i32, desired_size: usize) -> i32 {
    let mut discard = desired_discard.clamp(0, MAX_DISCARD_LEVEL);
    let mut needed = desired_size;
    while discard < MAX_DISCARD_LEVEL && loaded < needed {
        discard += 1;
        needed = (needed / 4).max(FIRST_PACKET_SIZE);
    }
    discard
}

/// Packets of a transfer of `total_size` bytes.
pub fn packet_count(total_size: usize) -> usize {
    if total_size <= FIRST_PACKET_SIZE {
        return 1;
    }
    (total_size - FIRST_PACKET_SIZE).div_ceil(MAX_IMG_PACKET_SIZE) + 1
}

/// Number of whole packets `data_size` bytes make up, if they line up with packet boundaries.
pub fn packets_in_prefix(data_size: usize) -> Option<usize> {
    if data_size < FIRST_PACKET_SIZE {
        return None;
    }
    let tail = data_size - FIRST_PACKET_SIZE;
    (tail % MAX_IMG_PACKET_SIZE == 0).then_some(tail / MAX_IMG_PACKET_SIZE + 1)
}
