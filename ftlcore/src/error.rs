use serde::Serialize;
use thiserror::Error;

/// Broad category an [`FtlError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Socket level failures: DNS, connect, closed or timed out sockets.
    Transport,
    /// The ingest rejected a request or the caller misused the protocol.
    Protocol,
    /// A running session ended.
    Session,
    /// Allocation and status-queue conditions.
    Resource,
}

/// Every failure the ingest engine reports, either as a returned error or as the
/// error code carried by a disconnect event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize)]
pub enum FtlError {
    #[error("Failed to get an ip address for the specified ingest (DNS lookup failure)")]
    DnsFailure,
    #[error("An unknown error occurred connecting to the socket")]
    ConnectError,
    #[error("The socket is no longer connected")]
    SocketNotConnected,
    #[error("the ingest socket was closed")]
    IngestSocketClosed,
    #[error("the ingest socket was hit a timeout.")]
    IngestSocketTimeout,
    #[error("ingest did not respond to request")]
    IngestNoResponse,

    #[error("A request to the ingest was invalid")]
    BadRequest,
    #[error("This channel is not authorized to connect to this ingest")]
    Unauthorized,
    #[error("The current version of the FTL-SDK is no longer supported")]
    OldVersion,
    #[error("The Audio SSRC is already in use")]
    AudioSsrcCollision,
    #[error("The Video SSRC is already in use")]
    VideoSsrcCollision,
    #[error("Invalid stream key")]
    BadOrInvalidStreamKey,
    #[error("Channel is already actively streaming")]
    ChannelInUse,
    #[error(
        "The location you are attempting to stream from is not authorized to do so by the local government"
    )]
    RegionUnsupported,
    #[error("The current game set by this profile can't be streamed")]
    GameBlocked,
    #[error("The channel is already connected")]
    AlreadyConnected,
    #[error("The channel is not connected")]
    NotConnected,
    #[error("The Ingest rejected the stream")]
    StreamRejected,
    #[error("The specified media type is not supported")]
    UnsupportedMediaType,
    #[error("An Internal error occurred")]
    InternalError,
    #[error("The parameters supplied are invalid or incomplete")]
    ConfigError,
    #[error("Unknown status code")]
    UnknownErrorCode,

    #[error("The ingest did not receive any audio or video media for an extended period of time")]
    NoMediaTimeout,
    #[error("ingest did not respond to keepalive")]
    NoPingResponse,
    #[error("ftl ingest disconnect api was called")]
    UserDisconnect,
    #[error("the speed test was aborted, possibly due to a network interruption")]
    SpeedTestAborted,
    #[error("The stream is not active")]
    NotActiveStream,

    #[error("Internal memory allocation error")]
    MallocFailure,
    #[error("The status queue is full")]
    QueueFull,
    #[error("The status queue is empty")]
    QueueEmpty,
    #[error("Timed out waiting for status message")]
    StatusTimeout,
    #[error("The parameters were not correctly initialized")]
    NotInitialized,
    #[error("dropping packets until a key frame is received")]
    WaitingForKeyFrame,
}

impl FtlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DnsFailure
            | Self::ConnectError
            | Self::SocketNotConnected
            | Self::IngestSocketClosed
            | Self::IngestSocketTimeout
            | Self::IngestNoResponse => ErrorKind::Transport,

            Self::BadRequest
            | Self::Unauthorized
            | Self::OldVersion
            | Self::AudioSsrcCollision
            | Self::VideoSsrcCollision
            | Self::BadOrInvalidStreamKey
            | Self::ChannelInUse
            | Self::RegionUnsupported
            | Self::GameBlocked
            | Self::AlreadyConnected
            | Self::NotConnected
            | Self::StreamRejected
            | Self::UnsupportedMediaType
            | Self::InternalError
            | Self::ConfigError
            | Self::UnknownErrorCode => ErrorKind::Protocol,

            Self::NoMediaTimeout
            | Self::NoPingResponse
            | Self::UserDisconnect
            | Self::SpeedTestAborted
            | Self::NotActiveStream => ErrorKind::Session,

            Self::MallocFailure
            | Self::QueueFull
            | Self::QueueEmpty
            | Self::StatusTimeout
            | Self::NotInitialized
            | Self::WaitingForKeyFrame => ErrorKind::Resource,
        }
    }
}

/// Numeric response codes sent by the ingest on the control channel.
///
/// Codes 900 and above never travel on the wire; they describe local socket
/// and command failures in the same space so the handshake can treat them
/// uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResponseCode {
    Ok,
    Ping,
    BadRequest,
    Unauthorized,
    OldVersion,
    AudioSsrcCollision,
    VideoSsrcCollision,
    InvalidStreamKey,
    ChannelInUse,
    RegionUnsupported,
    NoMediaTimeout,
    GameBlocked,
    InternalServerError,
    InternalMemoryError,
    InternalCommandError,
    InternalSocketClosed,
    InternalSocketTimeout,
    Unknown(i32),
}

impl From<i32> for ResponseCode {
    fn from(code: i32) -> Self {
        match code {
            200 => Self::Ok,
            201 => Self::Ping,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            402 => Self::OldVersion,
            403 => Self::AudioSsrcCollision,
            404 => Self::VideoSsrcCollision,
            405 => Self::InvalidStreamKey,
            406 => Self::ChannelInUse,
            407 => Self::RegionUnsupported,
            408 => Self::NoMediaTimeout,
            409 => Self::GameBlocked,
            500 => Self::InternalServerError,
            900 => Self::InternalMemoryError,
            901 => Self::InternalCommandError,
            902 => Self::InternalSocketClosed,
            903 => Self::InternalSocketTimeout,
            _ => Self::Unknown(code),
        }
    }
}

impl ResponseCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::Ok => 200,
            Self::Ping => 201,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::OldVersion => 402,
            Self::AudioSsrcCollision => 403,
            Self::VideoSsrcCollision => 404,
            Self::InvalidStreamKey => 405,
            Self::ChannelInUse => 406,
            Self::RegionUnsupported => 407,
            Self::NoMediaTimeout => 408,
            Self::GameBlocked => 409,
            Self::InternalServerError => 500,
            Self::InternalMemoryError => 900,
            Self::InternalCommandError => 901,
            Self::InternalSocketClosed => 902,
            Self::InternalSocketTimeout => 903,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Ping)
    }

    /// Maps the response to the error it stands for, or `None` on success.
    pub fn to_error(self) -> Option<FtlError> {
        let err = match self {
            Self::Ok | Self::Ping => return None,
            Self::BadRequest => FtlError::BadRequest,
            Self::Unauthorized => FtlError::Unauthorized,
            Self::OldVersion => FtlError::OldVersion,
            Self::AudioSsrcCollision => FtlError::AudioSsrcCollision,
            Self::VideoSsrcCollision => FtlError::VideoSsrcCollision,
            Self::InvalidStreamKey => FtlError::BadOrInvalidStreamKey,
            Self::ChannelInUse => FtlError::ChannelInUse,
            Self::RegionUnsupported => FtlError::RegionUnsupported,
            Self::NoMediaTimeout => FtlError::NoMediaTimeout,
            Self::GameBlocked => FtlError::GameBlocked,
            Self::InternalServerError
            | Self::InternalMemoryError
            | Self::InternalCommandError
            | Self::Unknown(_) => FtlError::InternalError,
            Self::InternalSocketClosed => FtlError::IngestSocketClosed,
            Self::InternalSocketTimeout => FtlError::IngestSocketTimeout,
        };
        Some(err)
    }

    /// Log-friendly explanation of a rejection.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Ok => "ingest accepted our parameters",
            Self::Ping => "ingest ping echo",
            Self::BadRequest => "ingest responded bad request",
            Self::Unauthorized => "channel is not authorized for FTL",
            Self::OldVersion => "this version of the FTL protocol is deprecated",
            Self::AudioSsrcCollision => "audio SSRC collision from this IP address",
            Self::VideoSsrcCollision => "video SSRC collision from this IP address",
            Self::InvalidStreamKey => "the stream key or channel id is incorrect",
            Self::ChannelInUse => "the channel id is already actively streaming",
            Self::RegionUnsupported => "the region is not authorized to stream",
            Self::NoMediaTimeout => {
                "the server did not receive media (audio or video) for an extended period of time"
            }
            Self::GameBlocked => "the current game set by this profile can't be streamed",
            Self::InternalServerError => "parameters accepted, but ingest couldn't start FTL",
            Self::InternalMemoryError => "server memory error",
            Self::InternalCommandError => "server command error",
            Self::InternalSocketClosed => "ingest socket closed",
            Self::InternalSocketTimeout => "ingest socket timeout",
            Self::Unknown(_) => "ingest unknown response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_code_round_trip() {
        for code in [200, 201, 400, 401, 402, 403, 404, 405, 406, 407, 408, 409, 500, 900, 903] {
            assert_eq!(ResponseCode::from(code).code(), code);
        }
        assert_eq!(ResponseCode::from(777), ResponseCode::Unknown(777));
    }

    #[test]
    fn test_rejections_map_to_errors() {
        assert_eq!(ResponseCode::Ok.to_error(), None);
        assert_eq!(ResponseCode::Ping.to_error(), None);
        assert_eq!(
            ResponseCode::from(405).to_error(),
            Some(FtlError::BadOrInvalidStreamKey)
        );
        assert_eq!(ResponseCode::from(406).to_error(), Some(FtlError::ChannelInUse));
        assert_eq!(ResponseCode::from(409).to_error(), Some(FtlError::GameBlocked));
        assert_eq!(
            ResponseCode::from(902).to_error(),
            Some(FtlError::IngestSocketClosed)
        );
        assert_eq!(ResponseCode::from(123).to_error(), Some(FtlError::InternalError));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(FtlError::DnsFailure.kind(), ErrorKind::Transport);
        assert_eq!(FtlError::ChannelInUse.kind(), ErrorKind::Protocol);
        assert_eq!(FtlError::NoPingResponse.kind(), ErrorKind::Session);
        assert_eq!(FtlError::QueueFull.kind(), ErrorKind::Resource);
        assert_eq!(FtlError::BadOrInvalidStreamKey.to_string(), "Invalid stream key");
    }
}
