//! RTP framing for the media packets sent to the ingest.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

/// Fixed 12-byte RTP header. The ingest never sees CSRCs or extensions from
/// us, but decoding skips them so captured traffic can be inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, io::Error> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer too small for RTP header",
            ));
        }

        // V(2) P(1) X(1) CC(4)
        buf[0] = RTP_VERSION << 6;
        // M(1) PT(7)
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        Ok(RTP_HEADER_LEN)
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u8(RTP_VERSION << 6);
        out.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        out.put_u16(self.sequence_number);
        out.put_u32(self.timestamp);
        out.put_u32(self.ssrc);
    }

    /// Decodes a header and returns it with the offset of the payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), io::Error> {
        if buf.len() < RTP_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "buffer too small for RTP header",
            ));
        }

        let version = (buf[0] >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid RTP version: {version}"),
            ));
        }

        let extension = (buf[0] >> 4) & 0x01 != 0;
        let csrc_count = (buf[0] & 0x0F) as usize;
        let mut offset = RTP_HEADER_LEN + csrc_count * 4;

        if extension {
            if buf.len() < offset + 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated RTP header extension",
                ));
            }
            let words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }

        if buf.len() < offset {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "buffer too small for CSRC list",
            ));
        }

        let header = Self {
            marker: (buf[1] >> 7) & 0x01 != 0,
            payload_type: buf[1] & 0x7F,
            sequence_number: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };

        Ok((header, offset))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    pub fn size(&self) -> usize {
        RTP_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size());
        self.header.write_to(&mut out);
        out.extend_from_slice(&self.payload);
        out.freeze()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, io::Error> {
        let (header, offset) = RtpHeader::decode(buf)?;
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf[offset..]),
        })
    }
}
