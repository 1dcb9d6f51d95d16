//! Per-component transmit statistics and the snapshots built from them.

use crate::status::{InstantPacketStats, PacketStats, VideoFrameStats};
use serde::Serialize;

/// Running min/max/total of a millisecond measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DelayStats {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub total: i64,
    pub samples: u64,
}

impl DelayStats {
    pub fn record(&mut self, ms: i64) {
        self.min = Some(self.min.map_or(ms, |m| m.min(ms)));
        self.max = Some(self.max.map_or(ms, |m| m.max(ms)));
        self.total += ms;
        self.samples += 1;
    }

    pub fn average(&self) -> i64 {
        if self.samples == 0 {
            0
        } else {
            self.total / self.samples as i64
        }
    }

    pub fn reset_extremes(&mut self) {
        self.min = None;
        self.max = None;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaStats {
    /// Frames accepted from the caller.
    pub frames_received: u64,
    pub frames_sent: u64,
    pub dropped_frames: u64,
    pub packets_queued: u64,
    pub bytes_queued: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Media bytes sent, RTP headers excluded.
    pub payload_bytes_sent: u64,
    pub nack_requests: u64,
    pub bw_throttling_count: u64,
    pub current_frame_size: u64,
    pub max_frame_size: u64,
    pub xmit_delay: DelayStats,
    pub rtt: DelayStats,
}

/// Snapshot polled by the bitrate controller.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct VideoStatsSnapshot {
    pub frames_sent: u64,
    pub nack_requests: u64,
    pub avg_rtt: u64,
    pub frames_dropped: u64,
    pub queue_fullness: f32,
}

impl MediaStats {
    /// Accounts a packet accepted into the ring.
    pub fn record_queued(&mut self, packet_len: usize, payload_len: usize) {
        self.packets_queued += 1;
        self.bytes_queued += packet_len as u64;
        self.payload_bytes_sent += payload_len as u64;
    }

    /// Accounts a NAL handed to the packetizer; closes the frame on
    /// `end_of_frame`.
    pub fn record_nal(&mut self, nal_len: usize, end_of_frame: bool) {
        self.current_frame_size += nal_len as u64;
        if end_of_frame {
            self.frames_received += 1;
            self.max_frame_size = self.max_frame_size.max(self.current_frame_size);
            self.current_frame_size = 0;
        }
    }

    pub fn record_dropped_frame(&mut self) {
        self.dropped_frames += 1;
    }

    pub fn record_sent(&mut self, packet_len: usize, end_of_frame: bool, xmit_delay_ms: i64) {
        self.packets_sent += 1;
        self.bytes_sent += packet_len as u64;
        if end_of_frame {
            self.frames_sent += 1;
        }
        self.xmit_delay.record(xmit_delay_ms);
    }

    pub fn packet_stats(&self, period_ms: i64) -> PacketStats {
        PacketStats {
            period_ms,
            sent: self.packets_sent,
            nack_requests: self.nack_requests,
            // Loss, recovery and lateness need receiver reports, which the
            // ingest never sends.
            lost: 0,
            recovered: 0,
            late: 0,
        }
    }

    /// Builds the interval report and clears the delay extremes. RTT totals
    /// are left for the bitrate controller, which owns their reset.
    pub fn take_instant_stats(&mut self, period_ms: i64) -> InstantPacketStats {
        let stats = InstantPacketStats {
            period_ms,
            min_rtt: self.rtt.min.unwrap_or(0),
            max_rtt: self.rtt.max.unwrap_or(0),
            avg_rtt: self.rtt.average(),
            min_xmit_delay: self.xmit_delay.min.unwrap_or(0),
            max_xmit_delay: self.xmit_delay.max.unwrap_or(0),
            avg_xmit_delay: self.xmit_delay.average(),
        };
        self.xmit_delay.reset();
        self.rtt.reset_extremes();
        stats
    }

    pub fn take_frame_stats(&mut self, period_ms: i64, queue_fullness: f32) -> VideoFrameStats {
        let stats = VideoFrameStats {
            period_ms,
            frames_queued: self.frames_received,
            frames_sent: self.frames_sent,
            bytes_queued: self.bytes_queued,
            bytes_sent: self.bytes_sent,
            bw_throttling_count: self.bw_throttling_count,
            queue_fullness: (queue_fullness * 100.0) as u32,
            max_frame_size: self.max_frame_size,
        };
        self.max_frame_size = 0;
        stats
    }

    /// Reads the counters the bitrate controller samples and restarts the
    /// RTT average.
    pub fn take_video_snapshot(&mut self, queue_fullness: f32) -> VideoStatsSnapshot {
        let snapshot = VideoStatsSnapshot {
            frames_sent: self.frames_sent,
            nack_requests: self.nack_requests,
            avg_rtt: self.rtt.average().max(0) as u64,
            frames_dropped: self.dropped_frames,
            queue_fullness,
        };
        self.rtt.reset();
        snapshot
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
