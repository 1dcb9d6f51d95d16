//! Pure pieces of the control-channel handshake: stream key parsing, command
//! framing, response parsing and the HMAC challenge signature.

use crate::error::{FtlError, ResponseCode};
use crate::types::{AudioCodec, VideoCodec};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use thiserror::Error;

pub const PROTOCOL_VERSION_MAJOR: u32 = 0;
pub const PROTOCOL_VERSION_MINOR: u32 = 9;

/// Media port used when the ingest does not announce one.
pub const LEGACY_MEDIA_PORT: u16 = 8082;
pub const MAX_COMMAND_LEN: usize = 512;
pub const MAX_KEY_LEN: usize = 100;

/// Suffix terminating every control command.
pub const COMMAND_TERMINATOR: &str = "\r\n\r\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Stream key must look like <channel>-<key>")]
    MalformedStreamKey,
    #[error("HMAC request rejected: {0:?}")]
    ChallengeRejected(ResponseCode),
    #[error("Challenge is not valid hex: {0}")]
    InvalidChallenge(String),
    #[error("Command exceeds {MAX_COMMAND_LEN} bytes")]
    CommandTooLong,
    #[error("Invalid HMAC key")]
    InvalidKey,
}

impl From<HandshakeError> for FtlError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::MalformedStreamKey | HandshakeError::InvalidKey => {
                FtlError::BadOrInvalidStreamKey
            }
            HandshakeError::ChallengeRejected(_) | HandshakeError::InvalidChallenge(_) => {
                FtlError::IngestNoResponse
            }
            HandshakeError::CommandTooLong => FtlError::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, HandshakeError>;

/// Channel id and shared secret extracted from a `"<channel>-<key>"` stream key.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamKey {
    pub channel_id: u32,
    pub key: String,
}

impl std::fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamKey")
            .field("channel_id", &self.channel_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Splits a stream key at the first `-` or `,`.
pub fn parse_stream_key(stream_key: &str) -> Result<StreamKey> {
    let split = stream_key
        .find(['-', ','])
        .ok_or(HandshakeError::MalformedStreamKey)?;
    let (channel, rest) = stream_key.split_at(split);
    let key = &rest[1..];

    if key.len() >= MAX_KEY_LEN {
        return Err(HandshakeError::MalformedStreamKey);
    }

    let channel_id = channel
        .trim()
        .parse::<u32>()
        .map_err(|_| HandshakeError::MalformedStreamKey)?;

    Ok(StreamKey {
        channel_id,
        key: key.to_string(),
    })
}

/// Frames a command for the wire.
pub fn format_command(cmd: &str) -> Result<String> {
    let framed = format!("{cmd}{COMMAND_TERMINATOR}");
    if framed.len() >= MAX_COMMAND_LEN {
        return Err(HandshakeError::CommandTooLong);
    }
    Ok(framed)
}

/// Reads the leading integer of a response line.
pub fn read_response_code(line: &str) -> ResponseCode {
    let trimmed = line.trim_start();
    let digits_end = trimmed
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());

    match trimmed[..digits_end].parse::<i32>() {
        Ok(code) => ResponseCode::from(code),
        Err(_) => ResponseCode::Unknown(-1),
    }
}

/// Extracts the challenge bytes from a `200 <hex>` reply to `HMAC`.
pub fn parse_challenge(line: &str) -> Result<Vec<u8>> {
    let code = read_response_code(line);
    if code != ResponseCode::Ok {
        return Err(HandshakeError::ChallengeRejected(code));
    }

    let hex_part = line
        .get(4..)
        .map(|s| s.trim_end_matches(['\r', '\n']))
        .unwrap_or_default();

    if hex_part.len() % 2 != 0 {
        return Err(HandshakeError::InvalidChallenge(format!(
            "odd length {}",
            hex_part.len()
        )));
    }

    hex::decode(hex_part).map_err(|e| HandshakeError::InvalidChallenge(e.to_string()))
}

/// HMAC-SHA512 of the challenge keyed with the stream secret, as lowercase hex.
pub fn compute_hmac(key: &str, challenge: &[u8]) -> Result<String> {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(key.as_bytes()).map_err(|_| HandshakeError::InvalidKey)?;
    mac.update(challenge);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn connect_command(channel_id: u32, hmac_hex: &str) -> String {
    format!("CONNECT {channel_id} ${hmac_hex}")
}

pub fn ping_command(channel_id: u32) -> String {
    format!("PING {channel_id}")
}

/// Parses the port out of `200 hi. Use UDP port 8082`.
pub fn parse_media_port(response: &str) -> Option<u16> {
    let dot = response.find('.')?;
    if dot == 0 {
        return None;
    }
    let rest = response[dot..].strip_prefix(". Use UDP port")?.trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse::<u16>().ok().filter(|port| *port > 0)
}

/// Stream description sent after a successful `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub vendor_name: String,
    pub vendor_version: String,
    pub video_codec: VideoCodec,
    pub video_width: u32,
    pub video_height: u32,
    pub video_payload_type: u8,
    pub video_ssrc: u32,
    pub audio_codec: AudioCodec,
    pub audio_payload_type: u8,
    pub audio_ssrc: u32,
}

impl SessionMetadata {
    /// Metadata lines in the order the ingest expects them, version first.
    pub fn commands(&self) -> Vec<String> {
        vec![
            format!("ProtocolVersion: {PROTOCOL_VERSION_MAJOR}.{PROTOCOL_VERSION_MINOR}"),
            format!("VendorName: {}", self.vendor_name),
            format!("VendorVersion: {}", self.vendor_version),
            "Video: true".to_string(),
            format!("VideoCodec: {}", self.video_codec.as_str()),
            format!("VideoHeight: {}", self.video_height),
            format!("VideoWidth: {}", self.video_width),
            format!("VideoPayloadType: {}", self.video_payload_type),
            format!("VideoIngestSSRC: {}", self.video_ssrc),
            "Audio: true".to_string(),
            format!("AudioCodec: {}", self.audio_codec.as_str()),
            format!("AudioPayloadType: {}", self.audio_payload_type),
            format!("AudioIngestSSRC: {}", self.audio_ssrc),
        ]
    }
}
