//! Sans-IO core of the FTL ingest client: wire codecs, handshake helpers,
//! the retransmission ring, pacing, clocks, statistics and bitrate decisions.

pub mod abr;
pub mod clock;
pub mod error;
pub mod h264;
pub mod handshake;
pub mod ingest;
pub mod nack;
pub mod pacing;
pub mod rtcp;
pub mod rtp;
pub mod stats;
pub mod status;
pub mod types;

pub use error::{ErrorKind, FtlError, ResponseCode};
pub use status::StatusMessage;
