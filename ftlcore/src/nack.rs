//! Retransmission ring shared by the producer, the paced sender and the NACK
//! handler of one media component.
//!
//! Slots are addressed by `sequence & mask`. The producer cursor only ever
//! advances past slots the transmit cursor has already released, so a packet
//! waiting to go out is never overwritten. Once transmitted a slot stays
//! readable for resends until the producer wraps onto it again.
//!
//! The transmit cursor only moves under the transmit lock, which also guards
//! [`NackRing::reset`]. A packet peeked before a reset can no longer be
//! committed after it.

use crate::error::FtlError;
use bytes::Bytes;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_RING_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Default)]
pub struct Slot {
    /// Sequence number of the cached packet, `None` until first written.
    pub sequence: Option<u16>,
    pub packet: Bytes,
    pub insert_time: Option<Instant>,
    pub xmit_time: Option<Instant>,
    pub keyframe: bool,
    pub end_of_frame: bool,
}

/// Metadata recorded with a queued packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketMeta {
    pub keyframe: bool,
    pub end_of_frame: bool,
}

/// The packet under the transmit cursor.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub sequence: u16,
    pub packet: Bytes,
    pub queued_for: Duration,
    pub end_of_frame: bool,
    epoch: u64,
}

/// A cached packet found for a NACK.
#[derive(Debug, Clone)]
pub struct Resend {
    pub packet: Bytes,
    /// Time since the original transmit, if it went out already.
    pub since_xmit: Option<Duration>,
    pub keyframe: bool,
}

#[derive(Debug)]
pub enum Lookup {
    Found(Resend),
    /// The slot now holds a different sequence (or nothing).
    Evicted { cached: Option<u16> },
}

pub struct NackRing {
    slots: Box<[Mutex<Slot>]>,
    mask: u16,
    produce: AtomicU16,
    transmit: AtomicU16,
    /// Bumped by every reset.
    transmit_lock: Mutex<u64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NackRing {
    /// `capacity` must be a power of two no larger than the sequence space.
    pub fn new(capacity: usize) -> Result<Self, FtlError> {
        if !capacity.is_power_of_two() || capacity < 2 || capacity > 1 << 15 {
            return Err(FtlError::ConfigError);
        }

        let slots = (0..capacity)
            .map(|_| Mutex::new(Slot::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            slots,
            mask: (capacity - 1) as u16,
            produce: AtomicU16::new(0),
            transmit: AtomicU16::new(0),
            transmit_lock: Mutex::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_index(&self, sequence: u16) -> usize {
        (sequence & self.mask) as usize
    }

    /// Packets queued but not yet handed to the sender.
    pub fn pending(&self) -> usize {
        let produce = self.produce.load(Ordering::Acquire);
        let transmit = self.transmit.load(Ordering::Acquire);
        produce.wrapping_sub(transmit) as usize
    }

    pub fn is_full(&self) -> bool {
        self.pending() >= self.capacity()
    }

    /// Share of the ring waiting to be transmitted, 0.0 to 1.0.
    pub fn queue_fullness(&self) -> f32 {
        self.pending() as f32 / self.capacity() as f32
    }

    /// Sequence the next pushed packet will carry.
    pub fn next_sequence(&self) -> u16 {
        self.produce.load(Ordering::Acquire)
    }

    /// Queues a packet built for the next sequence number. Returns `None`
    /// without calling `build` when the ring is full.
    ///
    /// Only one producer may push at a time; callers serialize through the
    /// component lock.
    pub fn push(
        &self,
        now: Instant,
        meta: PacketMeta,
        build: impl FnOnce(u16) -> Bytes,
    ) -> Option<u16> {
        if self.is_full() {
            return None;
        }

        let sequence = self.produce.load(Ordering::Acquire);
        {
            let mut slot = lock(&self.slots[self.slot_index(sequence)]);
            slot.packet = build(sequence);
            slot.sequence = Some(sequence);
            slot.insert_time = Some(now);
            slot.xmit_time = None;
            slot.keyframe = meta.keyframe;
            slot.end_of_frame = meta.end_of_frame;
        }
        self.produce
            .store(sequence.wrapping_add(1), Ordering::Release);

        Some(sequence)
    }

    /// Returns the packet under the transmit cursor without releasing its
    /// slot.
    pub fn peek_next(&self, now: Instant) -> Option<Outgoing> {
        let epoch = lock(&self.transmit_lock);
        let sequence = self.transmit.load(Ordering::Acquire);
        if sequence == self.produce.load(Ordering::Acquire) {
            return None;
        }

        let slot = lock(&self.slots[self.slot_index(sequence)]);
        Some(Outgoing {
            sequence,
            packet: slot.packet.clone(),
            queued_for: slot
                .insert_time
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default(),
            end_of_frame: slot.end_of_frame,
            epoch: *epoch,
        })
    }

    /// Stamps the transmit time of a peeked packet and hands its slot back
    /// to the producer. Returns false, leaving the ring untouched, when the
    /// ring was reset since the peek.
    pub fn commit(&self, outgoing: &Outgoing, now: Instant) -> bool {
        let epoch = lock(&self.transmit_lock);
        if *epoch != outgoing.epoch || self.transmit.load(Ordering::Acquire) != outgoing.sequence {
            return false;
        }

        lock(&self.slots[self.slot_index(outgoing.sequence)]).xmit_time = Some(now);
        self.transmit
            .store(outgoing.sequence.wrapping_add(1), Ordering::Release);
        true
    }

    /// Peeks and commits in one step.
    pub fn take_next(&self, now: Instant) -> Option<Outgoing> {
        let outgoing = self.peek_next(now)?;
        self.commit(&outgoing, now).then_some(outgoing)
    }

    /// Finds the cached bytes for a NACKed sequence.
    pub fn lookup(&self, sequence: u16, now: Instant) -> Lookup {
        let slot = lock(&self.slots[self.slot_index(sequence)]);
        if slot.sequence != Some(sequence) {
            return Lookup::Evicted {
                cached: slot.sequence,
            };
        }

        Lookup::Found(Resend {
            packet: slot.packet.clone(),
            since_xmit: slot.xmit_time.map(|t| now.saturating_duration_since(t)),
            keyframe: slot.keyframe,
        })
    }

    /// Empties every slot and rewinds both cursors to zero. The caller must
    /// hold off the producer; a concurrent sender is fenced by the transmit
    /// lock.
    pub fn reset(&self) {
        let mut epoch = lock(&self.transmit_lock);
        *epoch = epoch.wrapping_add(1);
        for slot in self.slots.iter() {
            *lock(slot) = Slot::default();
        }
        self.transmit.store(0, Ordering::Release);
        self.produce.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for NackRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NackRing")
            .field("capacity", &self.capacity())
            .field("produce", &self.produce.load(Ordering::Relaxed))
            .field("transmit", &self.transmit.load(Ordering::Relaxed))
            .finish()
    }
}
