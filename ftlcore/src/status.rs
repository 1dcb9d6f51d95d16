//! Messages delivered to the caller through the status queue.

use crate::error::FtlError;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => Self::Error,
            log::Level::Warn => Self::Warn,
            log::Level::Info => Self::Info,
            log::Level::Debug | log::Level::Trace => Self::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Connected,
    Disconnected,
    Destroyed,
    IngestErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventReason {
    None,
    NoMedia,
    ApiRequest,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub kind: EventKind,
    pub reason: EventReason,
    /// `None` for events that do not stem from a failure.
    pub error: Option<FtlError>,
}

impl StatusEvent {
    pub fn connected() -> Self {
        Self {
            kind: EventKind::Connected,
            reason: EventReason::None,
            error: None,
        }
    }

    /// Disconnect detected by the engine itself.
    pub fn dropped(error: FtlError) -> Self {
        let reason = if error == FtlError::NoMediaTimeout {
            EventReason::NoMedia
        } else {
            EventReason::Unknown
        };
        Self {
            kind: EventKind::Disconnected,
            reason,
            error: Some(error),
        }
    }

    pub fn user_disconnect() -> Self {
        Self {
            kind: EventKind::Disconnected,
            reason: EventReason::ApiRequest,
            error: Some(FtlError::UserDisconnect),
        }
    }

    pub fn destroyed() -> Self {
        Self {
            kind: EventKind::Destroyed,
            reason: EventReason::ApiRequest,
            error: None,
        }
    }
}

/// Cumulative packet counters for one media component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PacketStats {
    pub period_ms: i64,
    pub sent: u64,
    pub nack_requests: u64,
    pub lost: u64,
    pub recovered: u64,
    pub late: u64,
}

/// RTT and transmit delay over the last reporting interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct InstantPacketStats {
    pub period_ms: i64,
    pub min_rtt: i64,
    pub max_rtt: i64,
    pub avg_rtt: i64,
    pub min_xmit_delay: i64,
    pub max_xmit_delay: i64,
    pub avg_xmit_delay: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VideoFrameStats {
    pub period_ms: i64,
    pub frames_queued: u64,
    pub frames_sent: u64,
    pub bytes_queued: u64,
    pub bytes_sent: u64,
    pub bw_throttling_count: u64,
    /// Ring buffer occupancy in percent.
    pub queue_fullness: u32,
    pub max_frame_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BitrateChangeKind {
    Decreased,
    Increased,
    Stabilized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BitrateChangeReason {
    BandwidthConstrained,
    UpgradeExcessive,
    BandwidthAvailable,
    StabilizeOnLowerBitrate,
    StabilizeOnOriginalBitrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BitrateChanged {
    pub kind: BitrateChangeKind,
    pub reason: BitrateChangeReason,
    pub current_bitrate: u64,
    pub previous_bitrate: u64,
    pub nacks_to_frames_ratio: f32,
    pub avg_rtt: f32,
    pub avg_frames_dropped: u64,
    pub queue_fullness: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatusMessage {
    Log(LogMessage),
    Event(StatusEvent),
    VideoPackets(PacketStats),
    VideoPacketsInstant(InstantPacketStats),
    Video(VideoFrameStats),
    BitrateChanged(BitrateChanged),
}

impl StatusMessage {
    pub fn log(level: impl Into<LogLevel>, message: impl Into<String>) -> Self {
        Self::Log(LogMessage {
            level: level.into(),
            message: message.into(),
        })
    }

    pub fn as_event(&self) -> Option<&StatusEvent> {
        match self {
            Self::Event(ev) => Some(ev),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_event_reason() {
        let ev = StatusEvent::dropped(FtlError::NoMediaTimeout);
        assert_eq!(ev.reason, EventReason::NoMedia);
        assert_eq!(ev.kind, EventKind::Disconnected);

        let ev = StatusEvent::dropped(FtlError::NoPingResponse);
        assert_eq!(ev.reason, EventReason::Unknown);
        assert_eq!(ev.error, Some(FtlError::NoPingResponse));
    }

    #[test]
    fn test_status_message_serializes() {
        let msg = StatusMessage::Event(StatusEvent::user_disconnect());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("UserDisconnect"));
        assert!(json.contains("ApiRequest"));
    }
}
