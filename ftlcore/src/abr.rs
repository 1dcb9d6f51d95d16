//! Adaptive bitrate decisions.
//!
//! The controller is fed cumulative video counters once per sample interval,
//! keeps per-interval deltas in a small circular window and, once the window
//! is full, decides whether the encoder should go down, go up, or be reported
//! stable. Proposals are only adopted after the host accepts them.

use crate::stats::VideoStatsSnapshot;
use crate::status::{BitrateChangeKind, BitrateChangeReason, BitrateChanged};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    pub sample_interval_ms: u64,
    pub window_size: usize,
    pub cooldown_ms: u64,
    /// Minimum time after a revert before upgrades resume.
    pub upgrade_freeze_ms: u64,
    /// Congestion within this long after an upgrade reverts it.
    pub upgrade_excessive_ms: u64,

    pub constrained_nack_ratio: f32,
    pub constrained_dropped_per_sec: u64,
    pub constrained_rtt_ms: f32,
    pub constrained_queue_fullness: f32,

    pub stable_nack_ratio: f32,
    pub stable_rtt_ms: f32,
    pub stable_queue_fullness: f32,

    pub downgrade_percent: u64,
    pub revert_percent: u64,
    pub upgrade_step_bps: u64,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 1000,
            window_size: 5,
            cooldown_ms: 10_000,
            upgrade_freeze_ms: 180_000,
            upgrade_excessive_ms: 60_000,
            constrained_nack_ratio: 0.1,
            constrained_dropped_per_sec: 3,
            constrained_rtt_ms: 300.0,
            constrained_queue_fullness: 0.3,
            stable_nack_ratio: 0.01,
            stable_rtt_ms: 100.0,
            stable_queue_fullness: 0.1,
            downgrade_percent: 50,
            revert_percent: 80,
            upgrade_step_bps: 256_000,
        }
    }
}

impl AbrConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    fn window_secs(&self) -> u64 {
        (self.window_size as u64 * self.sample_interval_ms / 1000).max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Sample {
    nacks: u64,
    frames_sent: u64,
    avg_rtt: u64,
    frames_dropped: u64,
}

/// Aggregates over a full window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMetrics {
    pub nacks: u64,
    pub frames_sent: u64,
    pub nacks_to_frames_ratio: f32,
    pub avg_rtt: f32,
    pub dropped_per_sec: u64,
    pub queue_fullness: f32,
}

/// A change the host is asked to apply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Proposal {
    pub bitrate: u64,
    pub kind: BitrateChangeKind,
    pub reason: BitrateChangeReason,
    pub metrics: WindowMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Window not full yet, or nothing to do.
    Hold,
    Propose(Proposal),
    /// Bitrate settled after an earlier change; report once.
    Stabilized(BitrateChanged),
}

#[derive(Debug)]
pub struct BitrateController {
    config: AbrConfig,
    current: u64,
    min: u64,
    max: u64,
    window: Vec<Sample>,
    position: usize,
    full: bool,
    baseline: VideoStatsSnapshot,
    queue_fullness: f32,
    last_upgrade: Instant,
    freeze_started: Option<Instant>,
    revert_first: bool,
    check_stability: bool,
}

impl BitrateController {
    /// Bounds given in either order; `initial` is clamped into them.
    pub fn new(
        config: AbrConfig,
        initial: u64,
        min: u64,
        max: u64,
        baseline: VideoStatsSnapshot,
        now: Instant,
    ) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        let window = vec![Sample::default(); config.window_size.max(1)];
        Self {
            config,
            current: initial.clamp(min, max),
            min,
            max,
            window,
            position: 0,
            full: false,
            queue_fullness: baseline.queue_fullness,
            baseline,
            last_upgrade: now,
            freeze_started: None,
            revert_first: false,
            check_stability: false,
        }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn config(&self) -> &AbrConfig {
        &self.config
    }

    /// Encoder bitrate expressed as the sender's pacing target.
    pub fn peak_kbps(&self) -> i64 {
        (5 * self.current / 1000) as i64
    }

    fn clamp(&self, bitrate: u64) -> u64 {
        bitrate.clamp(self.min, self.max)
    }

    /// Pushes the deltas since the previous sample into the window.
    pub fn record(&mut self, snapshot: VideoStatsSnapshot) {
        let sample = Sample {
            nacks: snapshot
                .nack_requests
                .saturating_sub(self.baseline.nack_requests),
            frames_sent: snapshot.frames_sent.saturating_sub(self.baseline.frames_sent),
            avg_rtt: snapshot.avg_rtt,
            frames_dropped: snapshot
                .frames_dropped
                .saturating_sub(self.baseline.frames_dropped),
        };
        self.baseline = snapshot;
        self.queue_fullness = snapshot.queue_fullness;

        self.window[self.position] = sample;
        if self.position + 1 >= self.window.len() {
            self.full = true;
        }
        self.position = (self.position + 1) % self.window.len();
    }

    pub fn metrics(&self) -> Option<WindowMetrics> {
        if !self.full {
            return None;
        }

        let nacks: u64 = self.window.iter().map(|s| s.nacks).sum();
        let frames_sent: u64 = self.window.iter().map(|s| s.frames_sent).sum();
        let rtt_total: u64 = self.window.iter().map(|s| s.avg_rtt).sum();
        let dropped: u64 = self.window.iter().map(|s| s.frames_dropped).sum();

        let nacks_to_frames_ratio = if frames_sent == 0 {
            0.0
        } else {
            nacks as f32 / frames_sent as f32
        };

        Some(WindowMetrics {
            nacks,
            frames_sent,
            nacks_to_frames_ratio,
            avg_rtt: rtt_total as f32 / self.window.len() as f32,
            dropped_per_sec: dropped / self.config.window_secs(),
            queue_fullness: self.queue_fullness,
        })
    }

    pub fn is_reduction_required(&self, m: &WindowMetrics) -> bool {
        m.nacks_to_frames_ratio > self.config.constrained_nack_ratio
            || m.dropped_per_sec > self.config.constrained_dropped_per_sec
            || m.avg_rtt > self.config.constrained_rtt_ms
            || m.queue_fullness > self.config.constrained_queue_fullness
    }

    pub fn is_stable(&self, m: &WindowMetrics) -> bool {
        m.nacks_to_frames_ratio < self.config.stable_nack_ratio
            && m.dropped_per_sec == 0
            && m.avg_rtt < self.config.stable_rtt_ms
            && m.queue_fullness < self.config.stable_queue_fullness
    }

    fn upgrades_frozen(&self, now: Instant) -> bool {
        self.freeze_started.is_some_and(|start| {
            now.saturating_duration_since(start) <= Duration::from_millis(self.config.upgrade_freeze_ms)
        })
    }

    /// Evaluates the window after [`record`](Self::record). Any proposal must
    /// be answered with [`commit`](Self::commit).
    pub fn evaluate(&mut self, now: Instant) -> Decision {
        let Some(m) = self.metrics() else {
            return Decision::Hold;
        };

        if self.is_reduction_required(&m) {
            let since_upgrade = now.saturating_duration_since(self.last_upgrade);
            if self.revert_first
                && since_upgrade < Duration::from_millis(self.config.upgrade_excessive_ms)
            {
                return Decision::Propose(Proposal {
                    bitrate: self.clamp(self.config.revert_percent * self.current / 100),
                    kind: BitrateChangeKind::Decreased,
                    reason: BitrateChangeReason::UpgradeExcessive,
                    metrics: m,
                });
            }

            self.check_stability = false;
            return Decision::Propose(Proposal {
                bitrate: self.clamp(self.config.downgrade_percent * self.current / 100),
                kind: BitrateChangeKind::Decreased,
                reason: BitrateChangeReason::BandwidthConstrained,
                metrics: m,
            });
        }

        if self.is_stable(&m) && !self.upgrades_frozen(now) {
            let bitrate = self.clamp(self.current.saturating_add(self.config.upgrade_step_bps));
            if bitrate != self.current {
                self.revert_first = true;
                return Decision::Propose(Proposal {
                    bitrate,
                    kind: BitrateChangeKind::Increased,
                    reason: BitrateChangeReason::BandwidthAvailable,
                    metrics: m,
                });
            }
        }

        if self.check_stability {
            self.check_stability = false;
            let (reason, current) = if self.current == self.max {
                (BitrateChangeReason::StabilizeOnOriginalBitrate, self.max)
            } else {
                (BitrateChangeReason::StabilizeOnLowerBitrate, self.current)
            };
            return Decision::Stabilized(BitrateChanged {
                kind: BitrateChangeKind::Stabilized,
                reason,
                current_bitrate: current,
                previous_bitrate: self.current,
                nacks_to_frames_ratio: m.nacks_to_frames_ratio,
                avg_rtt: m.avg_rtt,
                avg_frames_dropped: m.dropped_per_sec,
                queue_fullness: m.queue_fullness,
            });
        }

        Decision::Hold
    }

    /// Records the host's answer to a proposal. Returns the change to report
    /// when it was accepted.
    pub fn commit(&mut self, proposal: Proposal, accepted: bool, now: Instant) -> Option<BitrateChanged> {
        if !accepted {
            return None;
        }

        let previous = self.current;
        self.current = proposal.bitrate;

        let mut ratio = proposal.metrics.nacks_to_frames_ratio;
        match proposal.reason {
            BitrateChangeReason::UpgradeExcessive => {
                self.freeze_started = Some(now);
                self.revert_first = false;
                self.check_stability = true;
                ratio = 0.0;
            }
            BitrateChangeReason::BandwidthAvailable => {
                self.last_upgrade = now;
                if proposal.bitrate == self.max {
                    self.check_stability = true;
                }
            }
            _ => {}
        }

        Some(BitrateChanged {
            kind: proposal.kind,
            reason: proposal.reason,
            current_bitrate: self.current,
            previous_bitrate: previous,
            nacks_to_frames_ratio: ratio,
            avg_rtt: proposal.metrics.avg_rtt,
            avg_frames_dropped: proposal.metrics.dropped_per_sec,
            queue_fullness: proposal.metrics.queue_fullness,
        })
    }

    /// Empties the window and takes `snapshot` as the new baseline, so the
    /// cooldown after a change does not leak into the next decision.
    pub fn rebase(&mut self, snapshot: VideoStatsSnapshot) {
        self.window.fill(Sample::default());
        self.position = 0;
        self.full = false;
        self.baseline = snapshot;
        self.queue_fullness = snapshot.queue_fullness;
    }
}
