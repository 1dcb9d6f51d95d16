#![allow(dead_code)]

use ftl_ingest::{IngestSession, StatusMessage};
use ftlcore::h264::FuaDepacketizer;
use ftlcore::handshake::compute_hmac;
use ftlcore::rtp::RtpHeader;
use ftlcore::status::{EventKind, StatusEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const CHALLENGE: [u8; 8] = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
/// Recorded in place of a command when the client closes the control socket.
pub const CONTROL_EOF: &str = "<eof>";

/// How the fake ingest answers.
#[derive(Debug, Clone)]
pub struct Script {
    pub secret: String,
    /// Code answering `HMAC`; anything but 200 is sent without a challenge.
    pub hmac_code: u16,
    /// Code sent for a `CONNECT` with a valid HMAC.
    pub connect_code: u16,
    /// Code answering the `.` that ends the metadata block.
    pub dot_code: u16,
    pub answer_pings: bool,
    /// Sent unprompted right after the metadata block is acknowledged.
    pub unsolicited: Option<String>,
}

impl Script {
    pub fn accepting(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            hmac_code: 200,
            connect_code: 200,
            dot_code: 200,
            answer_pings: true,
            unsolicited: None,
        }
    }
}

/// Loopback ingest: a TCP control server plus a UDP media peer.
pub struct FakeIngest {
    pub control_port: u16,
    pub media: Arc<UdpSocket>,
    pub commands: mpsc::UnboundedReceiver<String>,
    server: JoinHandle<()>,
}

impl FakeIngest {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_port = listener.local_addr().unwrap().port();
        let media = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let media_port = media.local_addr().unwrap().port();
        let (tx, commands) = mpsc::unbounded_channel();

        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();

                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line.trim_end().to_string(),
                        Ok(None) | Err(_) => {
                            let _ = tx.send(CONTROL_EOF.to_string());
                            break;
                        }
                    };
                    if line.is_empty() {
                        continue;
                    }
                    let _ = tx.send(line.clone());

                    let reply = if line == "HMAC" && script.hmac_code != 200 {
                        Some(format!("{}\n", script.hmac_code))
                    } else if line == "HMAC" {
                        Some(format!("200 {}\n", hex::encode(CHALLENGE)))
                    } else if let Some(rest) = line.strip_prefix("CONNECT ") {
                        let expected = compute_hmac(&script.secret, &CHALLENGE).unwrap();
                        let offered = rest.split_once(" $").map(|(_, hmac)| hmac).unwrap_or("");
                        if offered == expected {
                            Some(format!("{}\n", script.connect_code))
                        } else {
                            Some("401\n".to_string())
                        }
                    } else if line == "." && script.dot_code != 200 {
                        Some(format!("{}\n", script.dot_code))
                    } else if line == "." {
                        let mut reply = format!("200 hi. Use UDP port {media_port}\n");
                        if let Some(extra) = &script.unsolicited {
                            reply.push_str(extra);
                        }
                        Some(reply)
                    } else if line.starts_with("PING ") {
                        script.answer_pings.then(|| "201\n".to_string())
                    } else if line == "DISCONNECT" {
                        break;
                    } else {
                        None
                    };

                    if let Some(reply) = reply {
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            control_port,
            media,
            commands,
            server,
        }
    }

    pub fn media_port(&self) -> u16 {
        self.media.local_addr().unwrap().port()
    }

    /// Collects every command received so far.
    pub fn drain_commands(&mut self) -> Vec<String> {
        let mut received = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            received.push(command);
        }
        received
    }

    /// Waits until the client has closed the control socket, returning the
    /// commands seen before that.
    pub async fn wait_for_eof(&mut self) -> Vec<String> {
        let mut received = Vec::new();
        loop {
            let command = tokio::time::timeout(Duration::from_secs(3), self.commands.recv())
                .await
                .expect("control socket left open")
                .expect("control server stopped");
            if command == CONTROL_EOF {
                return received;
            }
            received.push(command);
        }
    }

    /// Waits for the next media datagram matching `filter`.
    pub async fn recv_media(&self, filter: impl Fn(&[u8]) -> bool) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = tokio::time::timeout(Duration::from_secs(3), self.media.recv_from(&mut buf))
                .await
                .expect("media datagram")
                .unwrap();
            if filter(&buf[..len]) {
                return (buf[..len].to_vec(), from);
            }
        }
    }
}

impl Drop for FakeIngest {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// RTP video packets, marker bit ignored.
pub fn is_video(packet: &[u8]) -> bool {
    packet.len() >= 12 && packet[1] & 0x7f == 96
}

/// Rebuilds the NAL units carried by a run of video packets.
pub fn reassemble(packets: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut depacketizer = FuaDepacketizer::new();
    packets
        .iter()
        .filter_map(|packet| {
            let (_, offset) = RtpHeader::decode(packet).unwrap();
            depacketizer.push(&packet[offset..])
        })
        .collect()
}

pub async fn wait_for_event(session: &IngestSession, kind: EventKind) -> StatusEvent {
    loop {
        match session.get_status(Duration::from_secs(3)).await {
            Ok(StatusMessage::Event(event)) if event.kind == kind => return event,
            Ok(_) => continue,
            Err(e) => panic!("no {kind:?} event: {e}"),
        }
    }
}
