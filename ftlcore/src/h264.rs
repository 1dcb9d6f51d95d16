//! H.264 NAL helpers and FU-A fragmentation (RFC 6184 section 5.8).

use crate::rtp::RTP_HEADER_LEN;
use bytes::{BufMut, BytesMut};

/// NAL type carried in the FU indicator.
pub const FU_A_TYPE: u8 = 28;
/// FU indicator plus FU header.
pub const FU_A_OVERHEAD: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    Slice,
    Idr,
    Sei,
    Sps,
    Pps,
    AccessUnitDelimiter,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::Slice,
            5 => Self::Idr,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::AccessUnitDelimiter,
            other => Self::Other(other),
        }
    }
}

/// First byte of a NAL unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader(pub u8);

impl NalHeader {
    pub fn unit_type(self) -> NalUnitType {
        NalUnitType::from(self.0)
    }

    /// `nal_ref_idc`; zero means the NAL can be dropped without corrupting
    /// later frames.
    pub fn nri(self) -> u8 {
        (self.0 >> 5) & 0x03
    }
}

/// One RTP payload produced from a NAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// FU indicator and header, `None` for a NAL sent whole.
    pub fu: Option<[u8; 2]>,
    pub payload: &'a [u8],
    /// Nothing of the NAL remains after this fragment.
    pub last: bool,
}

impl Fragment<'_> {
    pub fn len(&self) -> usize {
        self.payload.len() + if self.fu.is_some() { FU_A_OVERHEAD } else { 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        if let Some(fu) = self.fu {
            out.put_slice(&fu);
        }
        out.put_slice(self.payload);
    }
}

/// Splits a NAL into payloads that fit in `mtu` once the RTP header is added.
pub fn fragments(nal: &[u8], mtu: usize) -> Fragments<'_> {
    Fragments {
        rest: nal,
        mtu,
        fu_header: None,
        started: false,
    }
}

#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    rest: &'a [u8],
    mtu: usize,
    fu_header: Option<u8>,
    started: bool,
}

impl Fragments<'_> {
    fn max_fragment(&self) -> usize {
        self.mtu
            .saturating_sub(RTP_HEADER_LEN + FU_A_OVERHEAD)
            .max(1)
    }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Fragment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let max = self.max_fragment();

        if !self.started {
            self.started = true;

            if self.rest.len() <= self.mtu.saturating_sub(RTP_HEADER_LEN) {
                let payload = std::mem::take(&mut self.rest);
                return Some(Fragment {
                    fu: None,
                    payload,
                    last: true,
                });
            }

            let header = self.rest[0];
            self.fu_header = Some(header);
            let body = &self.rest[1..];
            let take = max.min(body.len());
            let (payload, rest) = body.split_at(take);
            self.rest = rest;

            return Some(Fragment {
                fu: Some(fu_bytes(header, true, false)),
                payload,
                last: self.rest.is_empty(),
            });
        }

        let header = self.fu_header?;
        if self.rest.is_empty() {
            return None;
        }

        let end = self.rest.len() <= max;
        let take = max.min(self.rest.len());
        let (payload, rest) = self.rest.split_at(take);
        self.rest = rest;

        Some(Fragment {
            fu: Some(fu_bytes(header, false, end)),
            payload,
            last: self.rest.is_empty(),
        })
    }
}

fn fu_bytes(nal_header: u8, start: bool, end: bool) -> [u8; 2] {
    let indicator = (nal_header & 0x60) | FU_A_TYPE;
    let header = ((start as u8) << 7) | ((end as u8) << 6) | (nal_header & 0x1F);
    [indicator, header]
}

/// Reassembles NAL units from RTP payloads, as the ingest does.
#[derive(Debug, Default)]
pub struct FuaDepacketizer {
    partial: Option<Vec<u8>>,
}

impl FuaDepacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one payload; returns a NAL once it is complete.
    pub fn push(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        let first = *payload.first()?;

        if first & 0x1F != FU_A_TYPE {
            self.partial = None;
            return Some(payload.to_vec());
        }

        let fu_header = *payload.get(1)?;
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            let mut nal = Vec::with_capacity(payload.len() * 4);
            nal.push((first & 0xE0) | (fu_header & 0x1F));
            self.partial = Some(nal);
        }

        let nal = self.partial.as_mut()?;
        nal.extend_from_slice(&payload[FU_A_OVERHEAD..]);

        if end { self.partial.take() } else { None }
    }
}
