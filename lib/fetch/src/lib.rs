//! Texture fetch pipeline.
//!
//! Every requested texture gets a [`FetchCoordinator`] request running a state machine: the
//! disk cache is consulted first, missing bytes come over ranged HTTP or from a simulator's
//! packet stream, the result is decoded and, when it came from the network, written back.

pub mod config;
pub mod coordinator;
pub mod decode;
pub mod error;
pub mod http;
pub mod j2c;
pub mod packets;
mod queues;
pub mod request;
pub mod retry;
pub mod simulator;
mod worker;

pub use config::FetchConfig;
pub use coordinator::FetchCoordinator;
pub use decode::{DecodeService, DecodedImage, ImageDecoder, PassThroughDecoder, ThreadedDecoder};
pub use error::{DecodeError, FetchError, Result, TransportError};
pub use http::{ContentRange, HttpReply, HttpTransport, RangeRequest, ReqwestTransport};
pub use request::{FetchSource, FetchState, FetchStatus};
pub use simulator::{ImageRequestBlock, SimHost, SimulatorChannel};
