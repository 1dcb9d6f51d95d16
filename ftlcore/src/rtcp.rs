//! RTCP packets exchanged on the media socket.
//!
//! Outbound we send pings (PT 250) and sender reports (PT 200). Inbound the
//! ingest answers with generic NACKs (PT 205, FMT 1) and echoes our pings.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|  FMT=1  |   PT=205      |          length               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SSRC of packet sender                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SSRC of media source                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            PID                |             BLP               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::io;
use thiserror::Error;

pub const RTCP_VERSION: u8 = 2;

/// FMT value shared by NACKs and pings.
pub const FEEDBACK_FMT: u8 = 1;

pub const PING_PACKET_LEN: usize = 20;
pub const SENDER_REPORT_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPayloadType {
    SenderReport = 200,
    TransportFeedback = 205,
    /// Non-standard round-trip probe echoed by the ingest.
    Ping = 250,
}

impl TryFrom<u8> for RtcpPayloadType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            200 => Ok(Self::SenderReport),
            205 => Ok(Self::TransportFeedback),
            250 => Ok(Self::Ping),
            _ => Err(value),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("packet too short: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("invalid RTCP version: {0}")]
    BadVersion(u8),
    #[error("unsupported RTCP packet fmt={fmt} pt={pt}")]
    Unsupported { fmt: u8, pt: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub count_or_fmt: u8,
    pub payload_type: u8,
    /// Length in 32-bit words minus one.
    pub length: u16,
}

impl RtcpHeader {
    pub const SIZE: usize = 4;

    pub fn new(payload_type: RtcpPayloadType, count_or_fmt: u8, length: u16) -> Self {
        Self {
            count_or_fmt,
            payload_type: payload_type as u8,
            length,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, io::Error> {
        if buf.len() < Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer too small for RTCP header",
            ));
        }

        buf[0] = (RTCP_VERSION << 6) | (self.count_or_fmt & 0x1F);
        buf[1] = self.payload_type;
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());

        Ok(Self::SIZE)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < Self::SIZE {
            return Err(WireError::Truncated {
                needed: Self::SIZE,
                got: buf.len(),
            });
        }

        let version = (buf[0] >> 6) & 0x03;
        if version != RTCP_VERSION {
            return Err(WireError::BadVersion(version));
        }

        Ok(Self {
            count_or_fmt: buf[0] & 0x1F,
            payload_type: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Size announced by the length field.
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }
}

/// PID plus a bitmask where bit i marks `pid + i + 1` as lost too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackEntry {
    pub pid: u16,
    pub blp: u16,
}

impl NackEntry {
    pub fn single(seq: u16) -> Self {
        Self { pid: seq, blp: 0 }
    }

    /// Packs the first sequence as PID and any of the next 16 into BLP.
    pub fn from_sequences(sequences: &[u16]) -> Option<Self> {
        let (&pid, rest) = sequences.split_first()?;
        let blp = rest.iter().fold(0u16, |blp, &seq| {
            let diff = seq.wrapping_sub(pid);
            if (1..=16).contains(&diff) {
                blp | (1 << (diff - 1))
            } else {
                blp
            }
        });
        Some(Self { pid, blp })
    }

    /// PID first, then each flagged follower in ascending bit order.
    pub fn lost_sequences(&self) -> Vec<u16> {
        std::iter::once(self.pid)
            .chain(
                (0..16u16)
                    .filter(|i| (self.blp >> i) & 1 != 0)
                    .map(|i| self.pid.wrapping_add(i + 1)),
            )
            .collect()
    }
}

/// Generic NACK as sent by the ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackFeedback {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub entries: Vec<NackEntry>,
}

impl NackFeedback {
    pub fn size(&self) -> usize {
        RtcpHeader::SIZE + 8 + self.entries.len() * 4
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        let header = RtcpHeader::new(
            RtcpPayloadType::TransportFeedback,
            FEEDBACK_FMT,
            (self.size() / 4 - 1) as u16,
        );
        buf[0] = (RTCP_VERSION << 6) | (header.count_or_fmt & 0x1F);
        buf[1] = header.payload_type;
        buf[2..4].copy_from_slice(&header.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.sender_ssrc.to_be_bytes());
        buf[8..12].copy_from_slice(&self.media_ssrc.to_be_bytes());

        for (i, entry) in self.entries.iter().enumerate() {
            let offset = 12 + i * 4;
            buf[offset..offset + 2].copy_from_slice(&entry.pid.to_be_bytes());
            buf[offset + 2..offset + 4].copy_from_slice(&entry.blp.to_be_bytes());
        }

        buf
    }

    /// Decodes the body following an already validated header.
    fn decode_body(header: &RtcpHeader, buf: &[u8]) -> Result<Self, WireError> {
        let needed = header.packet_size();
        if needed > buf.len() || needed < 12 {
            return Err(WireError::Truncated {
                needed: needed.max(12),
                got: buf.len(),
            });
        }

        let sender_ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let media_ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let count = (header.length as usize).saturating_sub(2);
        let entries = buf[12..needed]
            .chunks_exact(4)
            .take(count)
            .map(|fci| NackEntry {
                pid: u16::from_be_bytes([fci[0], fci[1]]),
                blp: u16::from_be_bytes([fci[2], fci[3]]),
            })
            .collect();

        Ok(Self {
            sender_ssrc,
            media_ssrc,
            entries,
        })
    }

    /// Every requested sequence, in wire order.
    pub fn requested(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.iter().flat_map(|e| e.lost_sequences())
    }
}

/// Round-trip probe. The body carries the send time as seconds and
/// microseconds so the echo can be timed without any local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPacket {
    pub sent_at_usec: u64,
}

impl PingPacket {
    pub fn encode(&self) -> [u8; PING_PACKET_LEN] {
        let mut buf = [0u8; PING_PACKET_LEN];
        buf[0] = (RTCP_VERSION << 6) | FEEDBACK_FMT;
        buf[1] = RtcpPayloadType::Ping as u8;
        // The ingest expects the byte size here, not the word count.
        buf[2..4].copy_from_slice(&(PING_PACKET_LEN as u16).to_be_bytes());
        buf[4..12].copy_from_slice(&(self.sent_at_usec / 1_000_000).to_be_bytes());
        buf[12..20].copy_from_slice(&(self.sent_at_usec % 1_000_000).to_be_bytes());
        buf
    }

    fn decode_body(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < PING_PACKET_LEN {
            return Err(WireError::Truncated {
                needed: PING_PACKET_LEN,
                got: buf.len(),
            });
        }
        let mut secs = [0u8; 8];
        let mut usecs = [0u8; 8];
        secs.copy_from_slice(&buf[4..12]);
        usecs.copy_from_slice(&buf[12..20]);
        let sent_at_usec = u64::from_be_bytes(secs)
            .saturating_mul(1_000_000)
            .saturating_add(u64::from_be_bytes(usecs));
        Ok(Self { sent_at_usec })
    }
}

/// RTCP sender report without reception blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    pub fn encode(&self) -> [u8; SENDER_REPORT_LEN] {
        let mut buf = [0u8; SENDER_REPORT_LEN];
        buf[0] = RTCP_VERSION << 6;
        buf[1] = RtcpPayloadType::SenderReport as u8;
        buf[2..4].copy_from_slice(&((SENDER_REPORT_LEN / 4 - 1) as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[8..16].copy_from_slice(&self.ntp_timestamp.to_be_bytes());
        buf[16..20].copy_from_slice(&self.rtp_timestamp.to_be_bytes());
        buf[20..24].copy_from_slice(&self.packet_count.to_be_bytes());
        buf[24..28].copy_from_slice(&self.octet_count.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < SENDER_REPORT_LEN {
            return Err(WireError::Truncated {
                needed: SENDER_REPORT_LEN,
                got: buf.len(),
            });
        }
        let header = RtcpHeader::decode(buf)?;
        if header.payload_type != RtcpPayloadType::SenderReport as u8 {
            return Err(WireError::Unsupported {
                fmt: header.count_or_fmt,
                pt: header.payload_type,
            });
        }
        let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Ok(Self {
            ssrc: word(4),
            ntp_timestamp: ((word(8) as u64) << 32) | word(12) as u64,
            rtp_timestamp: word(16),
            packet_count: word(20),
            octet_count: word(24),
        })
    }
}

/// Inbound feedback the media receiver acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Nack(NackFeedback),
    PingEcho(PingPacket),
}

/// Classifies a datagram received from the ingest.
pub fn parse_feedback(buf: &[u8]) -> Result<Feedback, WireError> {
    let header = RtcpHeader::decode(buf)?;

    match (header.count_or_fmt, RtcpPayloadType::try_from(header.payload_type)) {
        (FEEDBACK_FMT, Ok(RtcpPayloadType::TransportFeedback)) => {
            NackFeedback::decode_body(&header, buf).map(Feedback::Nack)
        }
        (FEEDBACK_FMT, Ok(RtcpPayloadType::Ping)) => {
            PingPacket::decode_body(buf).map(Feedback::PingEcho)
        }
        (fmt, _) => Err(WireError::Unsupported {
            fmt,
            pt: header.payload_type,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtcp_header_encode_decode() {
        let header = RtcpHeader::new(RtcpPayloadType::TransportFeedback, 1, 3);
        let mut buf = [0u8; 4];
        header.encode(&mut buf).unwrap();

        let decoded = RtcpHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.packet_size(), 16);
    }

    #[test]
    fn test_nack_entry_with_blp() {
        let entry = NackEntry {
            pid: 1000,
            blp: 0b0000000000010101,
        };
        assert_eq!(entry.lost_sequences(), vec![1000, 1001, 1003, 1005]);
        assert_eq!(
            NackEntry::from_sequences(&[1000, 1001, 1003, 1005]),
            Some(entry)
        );
        assert_eq!(NackEntry::from_sequences(&[]), None);
    }

    #[test]
    fn test_nack_entry_wraps() {
        let entry = NackEntry { pid: 65535, blp: 1 };
        assert_eq!(entry.lost_sequences(), vec![65535, 0]);
    }

    #[test]
    fn test_parse_nack_feedback() {
        let nack = NackFeedback {
            sender_ssrc: 0x11111111,
            media_ssrc: 0x22222222,
            entries: vec![NackEntry::single(10), NackEntry { pid: 20, blp: 0b11 }],
        };
        let encoded = nack.encode();
        assert_eq!(encoded.len(), 20);

        let Feedback::Nack(decoded) = parse_feedback(&encoded).unwrap() else {
            panic!("expected a NACK");
        };
        assert_eq!(decoded, nack);
        assert_eq!(decoded.requested().collect::<Vec<_>>(), vec![10, 20, 21, 22]);
    }

    #[test]
    fn test_parse_nack_rejects_overlong_length() {
        let mut encoded = NackFeedback {
            sender_ssrc: 1,
            media_ssrc: 2,
            entries: vec![NackEntry::single(5)],
        }
        .encode();
        encoded[3] = 9;
        assert!(matches!(
            parse_feedback(&encoded),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_ping_echo() {
        let ping = PingPacket {
            sent_at_usec: 12_345_678_901,
        };
        let encoded = ping.encode();
        assert_eq!(encoded[0], 0x81);
        assert_eq!(encoded[1], 250);
        assert_eq!(u16::from_be_bytes([encoded[2], encoded[3]]), 20);

        assert_eq!(parse_feedback(&encoded).unwrap(), Feedback::PingEcho(ping));
    }

    #[test]
    fn test_sender_report_layout() {
        let sr = SenderReport {
            ssrc: 43,
            ntp_timestamp: 0x0102030405060708,
            rtp_timestamp: 90_000,
            packet_count: 12,
            octet_count: 3400,
        };
        let encoded = sr.encode();
        assert_eq!(encoded[0], 0x80);
        assert_eq!(encoded[1], 200);
        assert_eq!(&encoded[2..4], &[0, 6]);
        assert_eq!(&encoded[8..12], &[1, 2, 3, 4]);
        assert_eq!(SenderReport::decode(&encoded).unwrap(), sr);
    }

    #[test]
    fn test_parse_feedback_rejects_unknown() {
        let buf = [0x80, 201, 0, 1, 0, 0, 0, 0];
        assert_eq!(
            parse_feedback(&buf),
            Err(WireError::Unsupported { fmt: 0, pt: 201 })
        );
        assert!(matches!(parse_feedback(&[0x81]), Err(WireError::Truncated { .. })));
    }
}
