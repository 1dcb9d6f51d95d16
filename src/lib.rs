// Wire codecs and protocol arithmetic live in the sans-IO core
pub use ftlcore::{ErrorKind, FtlError, ResponseCode, StatusMessage};
pub use ftlcore::{abr as bitrate, speed_test as speed, stats, status as messages, types};

pub mod abr;
pub mod config;
pub mod control;
pub mod ingest;
pub mod keepalive;
pub mod media;
pub mod session;
pub mod speed_test;
pub mod status;

pub use abr::BitrateChangeHandler;
pub use config::{AUTO_INGEST, IngestParams, TransportConfig};
pub use ingest::{IngestDirectory, StaticIngestDirectory};
pub use media::MediaTransport;
pub use session::{IngestSession, SessionState};
pub use status::StatusQueue;
