use bytes::BytesMut;
use ftlcore::FtlError;
use ftlcore::clock::RtpClock;
use ftlcore::nack::{NackRing, PacketMeta};
use ftlcore::rtp::{RTP_HEADER_LEN, RtpHeader};
use ftlcore::stats::MediaStats;
use ftlcore::types::MediaKind;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;
use tokio::sync::Semaphore;

/// Producer-side state, owned by whoever holds the component's send lock.
#[derive(Debug)]
pub(crate) struct ProducerState {
    /// Video only: drop NALs until the next SPS.
    pub wait_for_idr: bool,
}

/// One outgoing RTP stream (audio or video).
#[derive(Debug)]
pub(crate) struct MediaComponent {
    pub kind: MediaKind,
    pub ssrc: u32,
    pub payload_type: u8,
    pub ring: NackRing,
    pub pkt_ready: Semaphore,
    pub nack_enabled: AtomicBool,
    /// Pacing target; only the video sender reads it.
    pub peak_kbps: AtomicI64,
    producer: Mutex<ProducerState>,
    clock: Mutex<RtpClock>,
    stats: Mutex<MediaStats>,
    stats_epoch: Mutex<Instant>,
}

fn recover<'a, T>(guard: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    guard.unwrap_or_else(PoisonError::into_inner)
}

impl MediaComponent {
    pub fn new(kind: MediaKind, ssrc: u32, ring_capacity: usize, peak_kbps: i64) -> Result<Self, FtlError> {
        Ok(Self {
            kind,
            ssrc,
            payload_type: kind.payload_type(),
            ring: NackRing::new(ring_capacity)?,
            pkt_ready: Semaphore::new(0),
            nack_enabled: AtomicBool::new(true),
            peak_kbps: AtomicI64::new(peak_kbps),
            producer: Mutex::new(ProducerState {
                wait_for_idr: kind == MediaKind::Video,
            }),
            clock: Mutex::new(RtpClock::new(kind.clock_rate())),
            stats: Mutex::new(MediaStats::default()),
            stats_epoch: Mutex::new(Instant::now()),
        })
    }

    /// Takes the send lock without waiting; `None` means another send is in
    /// progress and the caller should drop its data.
    pub fn try_produce(&self) -> Option<MutexGuard<'_, ProducerState>> {
        match self.producer.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Blocks until any in-flight send has finished.
    pub fn lock_producer(&self) -> MutexGuard<'_, ProducerState> {
        recover(self.producer.lock())
    }

    pub fn stats(&self) -> MutexGuard<'_, MediaStats> {
        recover(self.stats.lock())
    }

    pub fn clock(&self) -> MutexGuard<'_, RtpClock> {
        recover(self.clock.lock())
    }

    /// Milliseconds since the statistics were last cleared.
    pub fn stats_age_ms(&self) -> i64 {
        recover(self.stats_epoch.lock()).elapsed().as_millis() as i64
    }

    pub fn is_nack_enabled(&self) -> bool {
        self.nack_enabled.load(Ordering::Relaxed)
    }

    pub fn set_nack_enabled(&self, enabled: bool) {
        self.nack_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Builds a packet at the next sequence number and queues it for the
    /// sender. Returns the packet size, or `None` if the ring is full.
    pub fn queue_packet(
        &self,
        timestamp: u32,
        marker: bool,
        meta: PacketMeta,
        payload_len: usize,
        write_payload: impl FnOnce(&mut BytesMut),
    ) -> Option<usize> {
        let packet_len = RTP_HEADER_LEN + payload_len;
        self.ring.push(Instant::now(), meta, |sequence| {
            let mut buf = BytesMut::with_capacity(packet_len);
            RtpHeader::new(self.payload_type, sequence, timestamp, self.ssrc)
                .with_marker(marker)
                .write_to(&mut buf);
            write_payload(&mut buf);
            buf.freeze()
        })?;

        self.stats().record_queued(packet_len, payload_len);
        self.pkt_ready.add_permits(1);
        Some(packet_len)
    }

    /// Rewinds the stream to its just-created state: empty ring, unset base
    /// DTS and cleared counters.
    pub fn reset(&self) {
        self.ring.reset();
        self.clock().reset();
        self.stats().reset();
        *recover(self.stats_epoch.lock()) = Instant::now();
    }
}
