use serde::{Deserialize, Serialize};

/// RTP payload type used for video packets.
pub const VIDEO_PAYLOAD_TYPE: u8 = 96;
/// RTP payload type used for audio packets.
pub const AUDIO_PAYLOAD_TYPE: u8 = 97;

pub const VIDEO_CLOCK_RATE: u32 = 90_000;
pub const AUDIO_CLOCK_RATE: u32 = 48_000;

/// Duration of one audio packet when the caller does not supply timestamps.
pub const AUDIO_PACKET_DURATION_MS: i64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn payload_type(self) -> u8 {
        match self {
            Self::Audio => AUDIO_PAYLOAD_TYPE,
            Self::Video => VIDEO_PAYLOAD_TYPE,
        }
    }

    pub fn clock_rate(self) -> u32 {
        match self {
            Self::Audio => AUDIO_CLOCK_RATE,
            Self::Video => VIDEO_CLOCK_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VideoCodec {
    #[default]
    H264,
    Vp8,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::Vp8 => "VP8",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioCodec {
    #[default]
    Opus,
    Aac,
}

impl AudioCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opus => "OPUS",
            Self::Aac => "AAC",
        }
    }
}
