//! Bounded frame ring with drop-oldest eviction.
//!
//! The ring decouples the capture worker from the processing pipeline. Each
//! slot moves through `Free -> Writing -> Full -> Reading -> Free`; all state
//! transitions happen under one mutex while the frame payloads themselves
//! live behind per-slot locks, so a reader holds a stable reference for as
//! long as its slot stays in `Reading`.
//!
//! `put_begin` never blocks: when no `Free` slot exists it evicts the oldest
//! `Full` slot. A slot currently being read is never evicted. `get_begin`
//! returns `None` immediately when the ring holds no finished frame.
//!
//! # Thread Safety
//!
//! One producer and one consumer are the intended use, but any number of
//! threads may call into the ring; the control mutex serializes the state
//! machine and the per-slot mutexes serialize payload access.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::frame::Frame;

/// Default slot count; per camera model anything in 4..=16 is reasonable.
pub const DEFAULT_RING_CAPACITY: usize = 16;

/// Lifecycle state of one ring slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Writing,
    Full,
    Reading,
}

#[derive(Clone, Copy, Debug)]
struct SlotCtl {
    state: SlotState,
    /// Commit order; assigned when the slot turns `Full`.
    seq: u64,
    /// Capture timestamp of the committed frame.
    timestamp: DateTime<Utc>,
}

struct RingCtl {
    slots: Vec<SlotCtl>,
    next_seq: u64,
    last_consumed_seq: Option<u64>,
    dropped: u64,
}

/// Fixed-capacity frame ring with put/get handshakes.
pub struct FrameRing {
    ctl: Mutex<RingCtl>,
    frames: Vec<Mutex<Frame>>,
}

impl FrameRing {
    /// Creates a ring with `capacity` pre-allocated slots.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let ctl = RingCtl {
            slots: vec![
                SlotCtl {
                    state: SlotState::Free,
                    seq: 0,
                    timestamp: DateTime::<Utc>::UNIX_EPOCH,
                };
                capacity
            ],
            next_seq: 0,
            last_consumed_seq: None,
            dropped: 0,
        };
        let frames = (0..capacity).map(|_| Mutex::new(Frame::empty())).collect();
        Self {
            ctl: Mutex::new(ctl),
            frames,
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Number of committed frames waiting to be read.
    pub fn len(&self) -> usize {
        let ctl = self.lock_ctl();
        ctl.slots
            .iter()
            .filter(|s| s.state == SlotState::Full)
            .count()
    }

    /// True when no committed frame is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted unread since creation.
    pub fn dropped(&self) -> u64 {
        self.lock_ctl().dropped
    }

    /// Claims a slot for writing.
    ///
    /// Prefers a `Free` slot; otherwise evicts the oldest `Full` slot
    /// (drop-oldest). Returns `None` only when every slot is pinned in
    /// `Writing` or `Reading`.
    pub fn put_begin(&self) -> Option<usize> {
        let mut ctl = self.lock_ctl();
        if let Some(idx) = ctl
            .slots
            .iter()
            .position(|s| s.state == SlotState::Free)
        {
            ctl.slots[idx].state = SlotState::Writing;
            return Some(idx);
        }
        let oldest = ctl
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Full)
            .min_by_key(|(_, s)| s.seq)
            .map(|(idx, _)| idx);
        if let Some(idx) = oldest {
            ctl.slots[idx].state = SlotState::Writing;
            ctl.dropped += 1;
            debug!(slot = idx, dropped = ctl.dropped, "ring full, evicting oldest frame");
            return Some(idx);
        }
        None
    }

    /// Exclusive access to a claimed slot's frame.
    ///
    /// Valid between `put_begin`/`put_commit` for writers and between
    /// `get_begin`/`get_commit` for readers; the state machine guarantees no
    /// other thread holds the same slot.
    pub fn slot(&self, idx: usize) -> MutexGuard<'_, Frame> {
        match self.frames[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Finishes a write. With `ok` the slot turns `Full` and becomes visible
    /// to readers in commit order; otherwise the slot returns to `Free` and
    /// the partial frame is never published.
    pub fn put_commit(&self, idx: usize, ok: bool) {
        let timestamp = self.slot(idx).timestamp;
        let mut ctl = self.lock_ctl();
        debug_assert_eq!(ctl.slots[idx].state, SlotState::Writing);
        if ok {
            let seq = ctl.next_seq;
            ctl.next_seq += 1;
            ctl.slots[idx] = SlotCtl {
                state: SlotState::Full,
                seq,
                timestamp,
            };
        } else {
            ctl.slots[idx].state = SlotState::Free;
        }
    }

    /// Claims the oldest committed frame for reading.
    ///
    /// Returns the slot index and its capture timestamp, or `None` when the
    /// ring holds no finished frame. Never blocks.
    pub fn get_begin(&self) -> Option<(usize, DateTime<Utc>)> {
        let mut ctl = self.lock_ctl();
        let oldest = ctl
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Full)
            .min_by_key(|(_, s)| s.seq)
            .map(|(idx, s)| (idx, s.seq, s.timestamp));
        let (idx, seq, timestamp) = oldest?;
        if let Some(last) = ctl.last_consumed_seq {
            debug_assert!(seq > last, "ring handed out a stale sequence");
        }
        ctl.slots[idx].state = SlotState::Reading;
        ctl.last_consumed_seq = Some(seq);
        Some((idx, timestamp))
    }

    /// Releases a slot claimed with `get_begin` back to `Free`.
    pub fn get_commit(&self, idx: usize) {
        let mut ctl = self.lock_ctl();
        debug_assert_eq!(ctl.slots[idx].state, SlotState::Reading);
        ctl.slots[idx].state = SlotState::Free;
    }

    fn lock_ctl(&self) -> MutexGuard<'_, RingCtl> {
        match self.ctl.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FramePayload;
    use std::sync::Arc;
    use std::thread;

    fn push_frame(ring: &FrameRing, index: u64) -> bool {
        let Some(slot) = ring.put_begin() else {
            return false;
        };
        {
            let mut frame = ring.slot(slot);
            frame.index = index;
            frame.timestamp = Utc::now();
            frame.payload = FramePayload::Empty;
        }
        ring.put_commit(slot, true);
        true
    }

    #[test]
    fn test_put_get_round_trip() {
        let ring = FrameRing::new(4);
        assert!(ring.is_empty());
        assert!(push_frame(&ring, 7));
        assert_eq!(ring.len(), 1);

        let (slot, _ts) = ring.get_begin().unwrap();
        assert_eq!(ring.slot(slot).index, 7);
        ring.get_commit(slot);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_failed_commit_is_never_published() {
        let ring = FrameRing::new(2);
        let slot = ring.put_begin().unwrap();
        ring.slot(slot).index = 99;
        ring.put_commit(slot, false);
        assert!(ring.get_begin().is_none());
    }

    #[test]
    fn test_drop_oldest_eviction() {
        let ring = FrameRing::new(3);
        for i in 0..5 {
            assert!(push_frame(&ring, i));
        }
        assert_eq!(ring.dropped(), 2);

        // Oldest surviving frames are 2, 3, 4.
        let mut seen = Vec::new();
        while let Some((slot, _)) = ring.get_begin() {
            seen.push(ring.slot(slot).index);
            ring.get_commit(slot);
        }
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn test_eviction_never_touches_reading_slot() {
        let ring = FrameRing::new(2);
        assert!(push_frame(&ring, 0));
        assert!(push_frame(&ring, 1));

        let (reading_slot, _) = ring.get_begin().unwrap();
        let reading_index = ring.slot(reading_slot).index;

        // Flood the ring; the slot under read must survive untouched.
        for i in 2..10 {
            assert!(push_frame(&ring, i));
        }
        assert_eq!(ring.slot(reading_slot).index, reading_index);
        ring.get_commit(reading_slot);
    }

    #[test]
    fn test_put_begin_exhausted_when_all_pinned() {
        let ring = FrameRing::new(2);
        let a = ring.put_begin().unwrap();
        let b = ring.put_begin().unwrap();
        assert!(ring.put_begin().is_none());
        ring.put_commit(a, true);
        ring.put_commit(b, true);
    }

    #[test]
    fn test_consumed_sequence_strictly_increases_under_contention() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let ring = Arc::new(FrameRing::new(8));
        let done = Arc::new(AtomicBool::new(false));

        let producer = {
            let ring = Arc::clone(&ring);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for i in 0..1000 {
                    push_frame(&ring, i);
                }
                done.store(true, Ordering::Release);
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last: Option<u64> = None;
                let mut consumed = 0u32;
                loop {
                    if let Some((slot, _)) = ring.get_begin() {
                        let index = ring.slot(slot).index;
                        if let Some(prev) = last {
                            assert!(index > prev, "indices went backwards");
                        }
                        last = Some(index);
                        ring.get_commit(slot);
                        consumed += 1;
                    } else if done.load(Ordering::Acquire) {
                        break;
                    } else {
                        thread::yield_now();
                    }
                }
                assert!(consumed > 0);
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
