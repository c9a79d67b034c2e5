//! Bounded packet queue shared between MIDI I/O threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::packet::MidiPacket;
use crate::now_micros;

/// Default number of packets a queue can hold.
pub const DEFAULT_CAPACITY: usize = 4096;

struct Ring {
    slots: Vec<MidiPacket>,
    head: usize,
    len: usize,
}

impl Ring {
    fn push(&mut self, packet: MidiPacket) -> bool {
        let capacity = self.slots.len();
        if self.len >= capacity {
            return false;
        }
        let tail = (self.head + self.len) % capacity;
        self.slots[tail] = packet;
        self.len += 1;
        true
    }

    fn pop(&mut self) -> Option<MidiPacket> {
        if self.len == 0 {
            return None;
        }
        let packet = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        Some(packet)
    }
}

/// Fixed-capacity FIFO of [`MidiPacket`]s.
///
/// Storage is allocated once. Pushing into a full queue drops the packet
/// instead of blocking the producer. Consumers can block on
/// [`MidiQueue::wait_for_data`] or drain a whole batch under one lock with
/// [`MidiQueue::drain`].
pub struct MidiQueue {
    ring: Mutex<Ring>,
    available: Condvar,
    dropped: AtomicU64,
}

impl MidiQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                slots: vec![MidiPacket::default(); capacity],
                head: 0,
                len: 0,
            }),
            available: Condvar::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().slots.len()
    }

    /// Appends a packet. Returns `false` when the queue was full and the
    /// packet was dropped.
    pub fn push(&self, packet: MidiPacket) -> bool {
        let accepted = self.ring.lock().push(packet);
        if accepted {
            self.available.notify_one();
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Appends packets in order until the queue is full. Returns how many
    /// were accepted.
    pub fn push_batch(&self, packets: &[MidiPacket]) -> usize {
        if packets.is_empty() {
            return 0;
        }
        let now = now_micros();
        let mut max_latency = 0;
        let mut accepted = 0;
        {
            let mut ring = self.ring.lock();
            for packet in packets {
                if !ring.push(*packet) {
                    break;
                }
                accepted += 1;
                if packet.timestamp != 0 {
                    max_latency = max_latency.max(now.saturating_sub(packet.timestamp));
                }
            }
        }
        let rejected = packets.len() - accepted;
        if rejected > 0 {
            self.dropped.fetch_add(rejected as u64, Ordering::Relaxed);
        }
        tracing::trace!(
            accepted,
            rejected,
            max_latency_us = max_latency,
            "midi batch enqueued"
        );
        if accepted > 0 {
            self.available.notify_one();
        }
        accepted
    }

    pub fn pop(&self) -> Option<MidiPacket> {
        self.ring.lock().pop()
    }

    pub fn peek(&self) -> Option<MidiPacket> {
        let ring = self.ring.lock();
        (ring.len > 0).then(|| ring.slots[ring.head])
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of packets rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Blocks until at least one packet is queued or `timeout` elapses.
    /// Returns whether data is available.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let mut ring = self.ring.lock();
        if ring.len > 0 {
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        self.available
            .wait_while_for(&mut ring, |ring| ring.len == 0, timeout);
        ring.len > 0
    }

    /// Holds the queue lock and yields packets until the queue is empty.
    ///
    /// Producers block while the returned iterator is alive, so a whole batch
    /// can be coalesced into one transfer.
    pub fn drain(&self) -> Drain<'_> {
        Drain {
            ring: self.ring.lock(),
        }
    }

    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.head = 0;
        ring.len = 0;
    }
}

impl Default for MidiQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Draining iterator returned by [`MidiQueue::drain`].
pub struct Drain<'a> {
    ring: MutexGuard<'a, Ring>,
}

impl Iterator for Drain<'_> {
    type Item = MidiPacket;

    fn next(&mut self) -> Option<MidiPacket> {
        self.ring.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.ring.len, Some(self.ring.len))
    }
}

impl ExactSizeIterator for Drain<'_> {}
