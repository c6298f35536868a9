//! Outgoing side of the simulator (UDP) image transfer protocol.

use std::net::SocketAddr;

use cache::ContentId;
use itertools::Itertools;

/// Address of the simulator serving a request.
pub type SimHost = SocketAddr;

/// Image type of a plain texture request.
pub const IMAGE_TYPE_NORMAL: u8 = 0;

/// One entry of an image request message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageRequestBlock {
    pub id: ContentId,
    /// Discard level wanted, or -1 to cancel the transfer.
    pub discard: i8,
    pub priority: f32,
    /// First packet still needed.
    pub packet: u32,
    pub image_type: u8,
}

impl ImageRequestBlock {
    pub fn cancel(id: ContentId) -> Self {
        Self {
            id,
            discard: -1,
            priority: 0.0,
            packet: 0,
            image_type: IMAGE_TYPE_NORMAL,
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.discard < 0
    }
}

/// Sends image request messages to simulators.
pub trait SimulatorChannel: Send + Sync {
    fn send_image_requests(&self, host: SimHost, blocks: Vec<ImageRequestBlock>);
}

/// Split `blocks` into messages of at most `per_message` entries and send them.
pub(crate) fn send_batched(
    channel: &dyn SimulatorChannel,
    host: SimHost,
    blocks: impl IntoIterator<Item = ImageRequestBlock>,
    per_message: usize,
) -> usize {
    let mut messages = 0;
    for chunk in &blocks.into_iter().chunks(per_message.max(1)) {
        channel.send_image_requests(host, chunk.collect());
        messages += 1;
    }
    messages
}
