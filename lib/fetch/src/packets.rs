//! Reassembly of simulator image transfers.
//!
//! A transfer is split into a first packet of [`FIRST_PACKET_SIZE`] bytes followed by packets of
//! [`MAX_IMG_PACKET_SIZE`] bytes, the last one possibly shorter. Packets may arrive in any order;
//! only the contiguous run starting at the first missing packet counts as loaded.

use bytes::Bytes;
use thiserror::Error;

use crate::j2c::{packet_count, packets_in_prefix, FIRST_PACKET_SIZE, MAX_IMG_PACKET_SIZE};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketRejected {
    #[error("packet {index} is past the end of a {total} packets transfer")]
    OutOfRange { index: usize, total: usize },
    #[error("packet {index} has a bad size {size}")]
    BadSize { index: usize, size: usize },
    #[error("duplicate packet {index}")]
    Duplicate { index: usize },
    #[error("transfer already started")]
    AlreadyStarted,
    #[error("no transfer header received")]
    NotStarted,
}

/// What to do with bytes already held when a transfer (re)starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketResume {
    /// Nothing held, the transfer starts at packet 0.
    Fresh,
    /// Held bytes line up with packet boundaries, the transfer continues after them.
    Continue,
    /// Held bytes don't match the packet layout and must be dropped.
    Mismatch,
}

#[derive(Debug, Default)]
pub struct PacketBuffer {
    packets: Vec<Option<Bytes>>,
    total_packets: usize,
    /// First packet that isn't part of the bytes held before the transfer.
    first_packet: usize,
    /// Last packet of the contiguous run, if any.
    last_packet: Option<usize>,
    file_size: usize,
}

impl PacketBuffer {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Align the buffer with `held` bytes of an asset of `file_size` bytes (0 if unknown).
    pub fn resume_from(&mut self, held: usize, file_size: usize) -> PacketResume {
        self.clear();
        if held == 0 {
            return PacketResume::Fresh;
        }
        match packets_in_prefix(held) {
            Some(packets) if file_size > 0 => {
                self.first_packet = packets;
                self.last_packet = Some(packets - 1);
                self.total_packets = packet_count(file_size);
                self.file_size = file_size;
                PacketResume::Continue
            }
            _ => PacketResume::Mismatch,
        }
    }

    /// Seed the transfer from its header, which carries packet 0.
    pub fn start(
        &mut self,
        total_packets: usize,
        file_size: usize,
        data: Bytes,
    ) -> Result<(), PacketRejected> {
        if self.last_packet.is_some() {
            return Err(PacketRejected::AlreadyStarted);
        }
        let expected = FIRST_PACKET_SIZE.min(file_size);
        if data.is_empty() || data.len() != expected {
            return Err(PacketRejected::BadSize {
                index: 0,
                size: data.len(),
            });
        }
        self.total_packets = total_packets.max(1);
        self.file_size = file_size;
        self.insert(0, data)
    }

    pub fn insert(&mut self, index: usize, data: Bytes) -> Result<(), PacketRejected> {
        if self.total_packets == 0 {
            return Err(PacketRejected::NotStarted);
        }
        if index >= self.total_packets {
            return Err(PacketRejected::OutOfRange {
                index,
                total: self.total_packets,
            });
        }
        let is_last = index == self.total_packets - 1;
        let size_ok = if index == 0 {
            !data.is_empty() && data.len() <= FIRST_PACKET_SIZE
        } else if is_last {
            !data.is_empty() && data.len() <= MAX_IMG_PACKET_SIZE
        } else {
            data.len() == MAX_IMG_PACKET_SIZE
        };
        if !size_ok {
            return Err(PacketRejected::BadSize {
                index,
                size: data.len(),
            });
        }

        let held_before = self.first_packet > 0 && index < self.first_packet;
        if held_before || self.packets.get(index).is_some_and(Option::is_some) {
            return Err(PacketRejected::Duplicate { index });
        }
        if index >= self.packets.len() {
            self.packets.resize(index + 1, None);
        }
        self.packets[index] = Some(data);

        let mut next = self.last_packet.map_or(0, |last| last + 1);
        while self.packets.get(next).is_some_and(Option::is_some) {
            self.last_packet = Some(next);
            next += 1;
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.last_packet.is_some()
    }

    /// Packet to ask the simulator for next.
    pub fn next_packet(&self) -> usize {
        self.last_packet.map_or(0, |last| last + 1)
    }

    pub fn total_packets(&self) -> usize {
        self.total_packets
    }

    pub fn file_size(&self) -> usize {
        self.file_size
    }

    pub fn is_complete(&self) -> bool {
        self.total_packets > 0 && self.last_packet.is_some_and(|last| last + 1 >= self.total_packets)
    }

    /// Bytes of the contiguous run received during this transfer.
    pub fn received_len(&self) -> usize {
        self.new_packets().map(Bytes::len).sum()
    }

    fn new_packets(&self) -> impl Iterator<Item = &Bytes> {
        let end = self.last_packet.map_or(0, |last| last + 1);
        self.packets
            .get(self.first_packet..end)
            .unwrap_or_default()
            .iter()
            .flatten()
    }

    /// Assemble `held` plus the received run once `requested` bytes or the whole asset are there.
    ///
    /// Returns the new buffer and whether it holds the whole asset.
    pub fn take_loaded(&self, held: &[u8], requested: usize) -> Option<(Vec<u8>, bool)> {
        if self.last_packet.map_or(true, |last| last < self.first_packet) {
            return None;
        }
        let prefix = if self.first_packet > 0 { held } else { &[][..] };
        let buffer_size = prefix.len() + self.received_len();
        let have_all = self.is_complete();
        if buffer_size < requested && !have_all {
            return None;
        }

        let mut data = Vec::with_capacity(buffer_size);
        data.extend_from_slice(prefix);
        for packet in self.new_packets() {
            data.extend_from_slice(packet);
        }
        Some((data, have_all))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn transfer(file_size: usize) -> Vec<Bytes> {
        let data: Vec<u8> = (0..file_size).map(|i| (i % 251) as u8).collect();
        let mut packets = vec![Bytes::copy_from_slice(&data[..FIRST_PACKET_SIZE.min(file_size)])];
        let mut at = FIRST_PACKET_SIZE;
        while at < file_size {
            let end = (at + MAX_IMG_PACKET_SIZE).min(file_size);
            packets.push(Bytes::copy_from_slice(&data[at..end]));
            at = end;
        }
        packets
    }

    fn concat(packets: &[Bytes]) -> Vec<u8> {
        packets.iter().flat_map(|p| p.iter().copied()).collect()
    }

    #[test]
    fn test_bad_packets_rejected() {
        let packets = transfer(2_900);
        let mut buffer = PacketBuffer::default();

        assert_eq!(
            buffer.insert(1, packets[1].clone()),
            Err(PacketRejected::NotStarted)
        );
        assert!(buffer.start(4, 2_900, Bytes::from_static(&[1; 100])).is_err());
        buffer.start(4, 2_900, packets[0].clone()).unwrap();
        assert_eq!(
            buffer.start(4, 2_900, packets[0].clone()),
            Err(PacketRejected::AlreadyStarted)
        );

        assert_eq!(
            buffer.insert(2, Bytes::from_static(&[0; 999])),
            Err(PacketRejected::BadSize { index: 2, size: 999 })
        );
        assert_eq!(
            buffer.insert(4, packets[3].clone()),
            Err(PacketRejected::OutOfRange { index: 4, total: 4 })
        );
        buffer.insert(1, packets[1].clone()).unwrap();
        assert_eq!(
            buffer.insert(1, Bytes::from_static(&[9; 1000])),
            Err(PacketRejected::Duplicate { index: 1 })
        );
        assert_eq!(buffer.next_packet(), 2);

        buffer.insert(3, packets[3].clone()).unwrap();
        assert_eq!(buffer.take_loaded(&[], 2_900), None);
        buffer.insert(2, packets[2].clone()).unwrap();
        let (data, have_all) = buffer.take_loaded(&[], 2_900).unwrap();
        assert!(have_all);
        assert_eq!(data, concat(&packets));
    }

    #[test]
    fn test_requested_prefix_is_enough() {
        let packets = transfer(5_600);
        let mut buffer = PacketBuffer::default();
        buffer.start(6, 5_600, packets[0].clone()).unwrap();
        buffer.insert(1, packets[1].clone()).unwrap();

        assert_eq!(buffer.take_loaded(&[], 2_000), None);
        buffer.insert(2, packets[2].clone()).unwrap();
        let (data, have_all) = buffer.take_loaded(&[], 2_000).unwrap();
        assert!(!have_all);
        assert_eq!(data, concat(&packets[..3]));
    }

    #[test]
    fn test_resume_after_cached_prefix() {
        let packets = transfer(3_600);
        let held = concat(&packets[..2]);

        let mut buffer = PacketBuffer::default();
        assert_eq!(buffer.resume_from(held.len(), 3_600), PacketResume::Continue);
        assert_eq!(buffer.next_packet(), 2);
        assert_eq!(
            buffer.insert(1, packets[1].clone()),
            Err(PacketRejected::Duplicate { index: 1 })
        );
        buffer.insert(2, packets[2].clone()).unwrap();
        buffer.insert(3, packets[3].clone()).unwrap();

        let (data, have_all) = buffer.take_loaded(&held, 3_600).unwrap();
        assert!(have_all);
        assert_eq!(data, concat(&packets));

        assert_eq!(buffer.resume_from(1_024, 3_600), PacketResume::Mismatch);
        assert_eq!(buffer.resume_from(0, 0), PacketResume::Fresh);
    }

    proptest! {
        #[test]
        fn test_reassembly_in_any_order(
            (count, order, gap, duplicates) in (2usize..12)
                .prop_flat_map(|count| (
                    Just(count),
                    Just((1..count).collect::<Vec<_>>()).prop_shuffle(),
                    proptest::option::of(1..count),
                    proptest::collection::vec(1..count, 0..4),
                )),
            last_size in 1usize..=MAX_IMG_PACKET_SIZE,
        ) {
            let file_size = FIRST_PACKET_SIZE + (count - 2) * MAX_IMG_PACKET_SIZE + last_size;
            let packets = transfer(file_size);
            prop_assert_eq!(packets.len(), count);

            let mut buffer = PacketBuffer::default();
            buffer.start(count, file_size, packets[0].clone()).unwrap();
            let mut inserted = vec![false; count];
            inserted[0] = true;
            let sequence = order.iter().chain(duplicates.iter()).copied();
            for index in sequence.filter(|&index| Some(index) != gap) {
                let result = buffer.insert(index, packets[index].clone());
                if inserted[index] {
                    prop_assert_eq!(result, Err(PacketRejected::Duplicate { index }));
                } else {
                    prop_assert!(result.is_ok());
                    inserted[index] = true;
                }
            }

            match gap {
                Some(gap) => {
                    prop_assert_eq!(buffer.next_packet(), gap);
                    prop_assert_eq!(buffer.take_loaded(&[], file_size), None);
                    // Whatever arrived before the gap is intact
                    let (prefix, have_all) = buffer.take_loaded(&[], 1).unwrap();
                    prop_assert!(!have_all);
                    prop_assert_eq!(prefix, concat(&packets[..gap]));
                }
                None => {
                    let (data, have_all) = buffer.take_loaded(&[], file_size).unwrap();
                    prop_assert!(have_all);
                    prop_assert_eq!(data, concat(&packets));
                }
            }
        }
    }
}
