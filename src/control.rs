//! TCP control channel: command framing, response reads and the connect
//! handshake.

use ftlcore::handshake::{
    HandshakeError, SessionMetadata, StreamKey, compute_hmac, connect_command, format_command,
    parse_challenge, parse_media_port, read_response_code,
};
use ftlcore::{FtlError, ResponseCode};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Longest response line the ingest is expected to send.
const MAX_RESPONSE_LEN: usize = 1024;

#[derive(Debug)]
pub struct ControlChannel {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
    recv_timeout: Duration,
}

impl ControlChannel {
    /// Resolves `host` and connects to the first address that accepts.
    pub async fn connect(host: &str, port: u16, recv_timeout: Duration) -> Result<Self, FtlError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| {
                warn!(target: "Ingest/Control", "Failed to resolve ingest {host}: {e}");
                FtlError::DnsFailure
            })?
            .collect();

        if addrs.is_empty() {
            return Err(FtlError::DnsFailure);
        }

        for addr in addrs {
            debug!(target: "Ingest/Control", "Got IP {}", addr.ip());
            match timeout(recv_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Self::from_stream(stream, recv_timeout),
                Ok(Err(e)) => {
                    debug!(target: "Ingest/Control", "Connect to {addr} failed: {e}");
                }
                Err(_) => {
                    debug!(target: "Ingest/Control", "Connect to {addr} timed out");
                }
            }
        }

        warn!(target: "Ingest/Control", "Failed to connect to ingest {host}:{port}");
        Err(FtlError::ConnectError)
    }

    pub fn from_stream(stream: TcpStream, recv_timeout: Duration) -> Result<Self, FtlError> {
        let peer = stream.peer_addr().map_err(|_| FtlError::SocketNotConnected)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "Ingest/Control", "Failed to set TCP_NODELAY: {e}");
        }
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(BufReader::new(read)),
            writer: Mutex::new(write),
            peer,
            recv_timeout,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Frames and writes one command without waiting for an answer.
    pub async fn send_command(&self, cmd: &str) -> Result<(), FtlError> {
        let framed = format_command(cmd)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(framed.as_bytes())
            .await
            .map_err(|_| FtlError::SocketNotConnected)
    }

    /// Reads one `\n` terminated response line.
    pub async fn read_response(&self) -> Result<String, FtlError> {
        let mut reader = self.reader.lock().await;
        Self::read_line(&mut reader, self.recv_timeout).await
    }

    async fn read_line(
        reader: &mut BufReader<OwnedReadHalf>,
        wait: Duration,
    ) -> Result<String, FtlError> {
        let mut line = String::new();
        let read = timeout(wait, async {
            let mut limited = (&mut *reader).take(MAX_RESPONSE_LEN as u64);
            limited.read_line(&mut line).await
        })
        .await;

        match read {
            Err(_) => Err(FtlError::IngestSocketTimeout),
            Ok(Err(_)) | Ok(Ok(0)) => Err(FtlError::IngestSocketClosed),
            Ok(Ok(_)) => Ok(line),
        }
    }

    /// Sends a command and returns the response line, failing on anything but
    /// `200`.
    pub async fn request(&self, cmd: &str) -> Result<String, FtlError> {
        self.send_command(cmd).await?;
        let line = self.read_response().await?;
        match read_response_code(&line) {
            ResponseCode::Ok => Ok(line),
            code => {
                warn!(target: "Ingest/Control", "Ingest answered {} to {:?}: {}", code.code(), first_word(cmd), code.describe());
                Err(code.to_error().unwrap_or(FtlError::InternalError))
            }
        }
    }

    /// Reads a response only if bytes are already waiting on the socket.
    pub async fn poll_response(&self) -> Result<Option<String>, FtlError> {
        let mut reader = self.reader.lock().await;
        let waiting = match timeout(Duration::ZERO, reader.fill_buf()).await {
            Err(_) => return Ok(None),
            Ok(Err(_)) => return Err(FtlError::IngestSocketClosed),
            Ok(Ok(buf)) => !buf.is_empty(),
        };
        if !waiting {
            return Err(FtlError::IngestSocketClosed);
        }
        Self::read_line(&mut reader, self.recv_timeout).await.map(Some)
    }

    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(target: "Ingest/Control", "Control socket shutdown: {e}");
        }
    }
}

fn first_word(cmd: &str) -> &str {
    cmd.split_whitespace().next().unwrap_or(cmd)
}

/// Runs the challenge, `CONNECT`, metadata exchange. Returns the UDP port
/// the ingest assigned for media.
pub async fn handshake(
    channel: &ControlChannel,
    key: &StreamKey,
    metadata: &SessionMetadata,
    legacy_media_port: u16,
) -> Result<u16, FtlError> {
    channel.send_command("HMAC").await?;
    let challenge_line = channel.read_response().await?;
    let challenge = parse_challenge(&challenge_line).map_err(|e| {
        warn!(target: "Ingest/Control", "Could not get a signed HMAC: {e}");
        FtlError::from(e)
    })?;

    let hmac = compute_hmac(&key.key, &challenge).map_err(|e: HandshakeError| {
        warn!(target: "Ingest/Control", "HMAC signing failed: {e}");
        FtlError::from(e)
    })?;

    channel
        .request(&connect_command(key.channel_id, &hmac))
        .await?;

    // The ingest acknowledges the metadata block as a whole.
    for line in metadata.commands() {
        channel.send_command(&line).await?;
    }

    let response = channel.request(".").await?;
    let port = parse_media_port(&response).unwrap_or_else(|| {
        info!(target: "Ingest/Control", "No media port announced, using {legacy_media_port}");
        legacy_media_port
    });

    Ok(port)
}
