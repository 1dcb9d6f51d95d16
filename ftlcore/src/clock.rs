//! Media clocks: RTP timestamps from decode timestamps, the NTP mapping used
//! by sender reports, and synthetic timestamps for callers without a DTS.

use crate::types::AUDIO_PACKET_DURATION_MS;

const USEC_PER_SEC: i128 = 1_000_000;

/// Seconds between 1900-01-01 (NTP era 0) and the Unix epoch.
pub const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Converts decode timestamps in microseconds to RTP ticks.
#[derive(Debug, Clone)]
pub struct RtpClock {
    clock_rate: u32,
    base_dts_usec: Option<i64>,
    last_dts_usec: i64,
    timestamp: u32,
}

impl RtpClock {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            base_dts_usec: None,
            last_dts_usec: 0,
            timestamp: 0,
        }
    }

    /// Advances to `dts_usec`, latching it as the base on first use, and
    /// returns the RTP timestamp rounded to the nearest tick.
    pub fn update(&mut self, dts_usec: i64) -> u32 {
        let base = *self.base_dts_usec.get_or_insert(dts_usec);
        let ticks = (dts_usec as i128 - base as i128) * self.clock_rate as i128;
        self.timestamp = ((ticks + USEC_PER_SEC / 2).div_euclid(USEC_PER_SEC)) as u32;
        self.last_dts_usec = dts_usec;
        self.timestamp
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn base_dts_usec(&self) -> Option<i64> {
        self.base_dts_usec
    }

    pub fn last_dts_usec(&self) -> i64 {
        self.last_dts_usec
    }

    /// Microseconds of media clocked since the base.
    pub fn elapsed_usec(&self) -> Option<i64> {
        self.base_dts_usec.map(|base| self.last_dts_usec - base)
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.clock_rate);
    }
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn unix_now_usec() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

/// 64-bit NTP timestamp (32.32 fixed point) for a Unix time in microseconds.
pub fn ntp_from_unix_usec(unix_usec: u64) -> u64 {
    let secs = unix_usec / 1_000_000 + NTP_UNIX_OFFSET_SECS;
    let frac = ((unix_usec % 1_000_000) << 32) / 1_000_000;
    (secs << 32) | frac
}

/// Wall-clock anchor for sender reports. Captured once from the first
/// timestamped packet; afterwards NTP time advances with the media DTS only.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderReportClock {
    base_unix_usec: Option<u64>,
}

impl SenderReportClock {
    pub fn anchor(&mut self, unix_usec: impl FnOnce() -> u64) {
        if self.base_unix_usec.is_none() {
            self.base_unix_usec = Some(unix_usec());
        }
    }

    pub fn is_anchored(&self) -> bool {
        self.base_unix_usec.is_some()
    }

    /// NTP time of a component whose clock has advanced `media_usec` past
    /// its base DTS.
    pub fn ntp_for(&self, media_usec: i64) -> Option<u64> {
        let base = self.base_unix_usec?;
        let unix = (base as i64).saturating_add(media_usec).max(0) as u64;
        Some(ntp_from_unix_usec(unix))
    }

    pub fn reset(&mut self) {
        self.base_unix_usec = None;
    }
}

/// Synthesizes DTS values for callers that only hand over frames.
#[derive(Debug, Clone)]
pub struct DtsGenerator {
    audio_dts_usec: i64,
    video_dts_usec: i64,
    frame_step_usec: i64,
    /// Remainder of `fps_den * 1e6 / fps_num`, in units of 1/fps_num usec.
    frame_step_rem: i64,
    frame_error: i64,
    fps_num: i64,
}

impl DtsGenerator {
    pub fn new(fps_num: u32, fps_den: u32) -> Self {
        let num = fps_num.max(1) as i64;
        let interval = fps_den.max(1) as i64 * 1_000_000;
        Self {
            audio_dts_usec: 0,
            video_dts_usec: 0,
            frame_step_usec: interval / num,
            frame_step_rem: interval % num,
            frame_error: 0,
            fps_num: num,
        }
    }

    /// DTS for the next audio packet.
    pub fn next_audio(&mut self) -> i64 {
        let dts = self.audio_dts_usec;
        self.audio_dts_usec += AUDIO_PACKET_DURATION_MS * 1000;
        dts
    }

    /// DTS for the next video NAL; the clock moves on once a frame ends.
    pub fn next_video(&mut self, end_of_frame: bool) -> i64 {
        let dts = self.video_dts_usec;
        if end_of_frame {
            self.video_dts_usec += self.frame_step_usec;
            self.frame_error += self.frame_step_rem;
            if self.frame_error >= self.fps_num {
                self.frame_error -= self.fps_num;
                self.video_dts_usec += 1;
            }
        }
        dts
    }
}
