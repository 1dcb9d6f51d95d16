use ftlcore::FtlError;
use ftlcore::abr::AbrConfig;
use ftlcore::handshake::{LEGACY_MEDIA_PORT, StreamKey, parse_stream_key};
use ftlcore::nack::DEFAULT_RING_CAPACITY;
use ftlcore::rtp::RTP_HEADER_LEN;
use ftlcore::types::{AudioCodec, VideoCodec};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hostname that asks the session to pick the closest ingest itself.
pub const AUTO_INGEST: &str = "auto";

/// What the host application knows about the stream it wants to publish.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestParams {
    pub ingest_hostname: String,
    pub stream_key: String,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    /// Pacing target for the video sender; zero or less disables pacing.
    pub peak_kbps: i64,
    pub fps_num: u32,
    pub fps_den: u32,
    pub vendor_name: String,
    pub vendor_version: String,
}

impl Default for IngestParams {
    fn default() -> Self {
        Self {
            ingest_hostname: AUTO_INGEST.to_string(),
            stream_key: String::new(),
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Opus,
            peak_kbps: 0,
            fps_num: 30,
            fps_den: 1,
            vendor_name: env!("CARGO_PKG_NAME").to_string(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl std::fmt::Debug for IngestParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestParams")
            .field("ingest_hostname", &self.ingest_hostname)
            .field("stream_key", &"<redacted>")
            .field("video_codec", &self.video_codec)
            .field("audio_codec", &self.audio_codec)
            .field("peak_kbps", &self.peak_kbps)
            .field("fps_num", &self.fps_num)
            .field("fps_den", &self.fps_den)
            .field("vendor_name", &self.vendor_name)
            .field("vendor_version", &self.vendor_version)
            .finish()
    }
}

impl IngestParams {
    pub fn new(ingest_hostname: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self {
            ingest_hostname: ingest_hostname.into(),
            stream_key: stream_key.into(),
            ..Default::default()
        }
    }

    pub fn with_peak_kbps(mut self, peak_kbps: i64) -> Self {
        self.peak_kbps = peak_kbps;
        self
    }

    pub fn with_frame_rate(mut self, fps_num: u32, fps_den: u32) -> Self {
        self.fps_num = fps_num;
        self.fps_den = fps_den;
        self
    }

    pub fn with_vendor(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.vendor_name = name.into();
        self.vendor_version = version.into();
        self
    }

    pub fn is_auto_ingest(&self) -> bool {
        self.ingest_hostname.eq_ignore_ascii_case(AUTO_INGEST)
    }

    /// Checks the parameters and extracts the channel credentials.
    pub fn validate(&self) -> Result<StreamKey, FtlError> {
        if self.ingest_hostname.is_empty() || self.fps_num == 0 || self.fps_den == 0 {
            return Err(FtlError::ConfigError);
        }
        Ok(parse_stream_key(&self.stream_key)?)
    }
}

/// Socket, timer and buffer settings of the transport. Durations are kept in
/// milliseconds so the struct reads naturally from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub control_port: u16,
    pub probe_port: u16,
    pub probe_timeout_ms: u64,
    pub probe_spacing_ms: u64,
    pub recv_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub keepalive_warn_tolerance_ms: u64,
    pub watchdog_poll_ms: u64,
    /// Silence from the ingest tolerated before the session is declared dead.
    pub no_ping_timeout_ms: u64,
    pub legacy_media_port: u16,
    pub max_mtu: usize,
    pub nack_capacity: usize,
    pub ping_interval_ms: u64,
    pub sender_report_interval_ms: u64,
    pub stats_interval_ms: u64,
    pub status_queue_capacity: usize,
    pub abr: AbrConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            control_port: 8084,
            probe_port: 8079,
            probe_timeout_ms: 500,
            probe_spacing_ms: 5,
            recv_timeout_ms: 5000,
            keepalive_interval_ms: 5000,
            keepalive_warn_tolerance_ms: 1000,
            watchdog_poll_ms: 500,
            no_ping_timeout_ms: 6 * 5000,
            legacy_media_port: LEGACY_MEDIA_PORT,
            max_mtu: 1392,
            nack_capacity: DEFAULT_RING_CAPACITY,
            ping_interval_ms: 25,
            sender_report_interval_ms: 1000,
            stats_interval_ms: 5000,
            status_queue_capacity: 10,
            abr: AbrConfig::default(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), FtlError> {
        let ring_ok = self.nack_capacity.is_power_of_two()
            && (2..=1 << 15).contains(&self.nack_capacity);
        // A fragment must carry at least one payload byte after the FU-A bytes.
        let mtu_ok = self.max_mtu > RTP_HEADER_LEN + 2;

        if !ring_ok || !mtu_ok || self.status_queue_capacity == 0 || self.ping_interval_ms == 0 {
            return Err(FtlError::ConfigError);
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_spacing(&self) -> Duration {
        Duration::from_millis(self.probe_spacing_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_warn_after(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms + self.keepalive_warn_tolerance_ms)
    }

    pub fn watchdog_poll(&self) -> Duration {
        Duration::from_millis(self.watchdog_poll_ms)
    }

    pub fn no_ping_timeout(&self) -> Duration {
        Duration::from_millis(self.no_ping_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn sender_report_interval(&self) -> Duration {
        Duration::from_millis(self.sender_report_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}
