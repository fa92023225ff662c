//! Retransmission timing wheel and the endpoint clock.
//!
//! The wheel buckets future retransmission deadlines into fixed-duration
//! slots; one `advance` per event-loop iteration drains everything due.
//! Entries exist for every unacknowledged in-flight request and are
//! removed exactly once, on ack ([`TimingWheel::cancel`]) or on fire.

use std::collections::VecDeque;
use std::time::Instant;

/// Monotonic microsecond clock, anchored at endpoint construction.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Microseconds since the clock was created.
    #[inline]
    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// A scheduled retransmission deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    /// Local session number.
    pub session: u16,
    /// Request slot index within the session.
    pub slot: usize,
    /// Request number, used to reject entries for recycled slots.
    pub req_num: u64,
    /// Absolute fire time in clock microseconds.
    pub fire_at_us: u64,
}

/// Bucketed schedule of retransmission deadlines.
pub struct TimingWheel {
    slots: Vec<VecDeque<TimerEntry>>,
    num_slots: usize,
    slot_us: u64,
    current_slot: usize,
    current_ts: u64,
    span_us: u64,
}

impl TimingWheel {
    /// `num_slots` buckets of `slot_us` microseconds each.
    pub fn new(num_slots: usize, slot_us: u64) -> Self {
        Self {
            slots: (0..num_slots).map(|_| VecDeque::new()).collect(),
            num_slots,
            slot_us,
            current_slot: 0,
            current_ts: 0,
            span_us: num_slots as u64 * slot_us,
        }
    }

    /// 256 slots of 100 us: 25.6 ms of coverage, enough for clamped RTOs.
    pub fn default_for_rpc() -> Self {
        Self::new(256, 100)
    }

    /// Anchor the wheel at a starting timestamp.
    pub fn init(&mut self, ts: u64) {
        self.current_ts = ts;
        self.current_slot = 0;
    }

    /// Schedule an entry. Deadlines already in the past land in the
    /// current bucket and fire on the next advance; deadlines beyond the
    /// wheel span land in the furthest bucket and are re-bucketed as the
    /// wheel turns.
    pub fn insert(&mut self, entry: TimerEntry) {
        let slot = if entry.fire_at_us <= self.current_ts {
            self.current_slot
        } else {
            let delta = entry.fire_at_us - self.current_ts;
            let ahead = (delta / self.slot_us).min(self.num_slots as u64 - 1) as usize;
            (self.current_slot + ahead) % self.num_slots
        };
        self.slots[slot].push_back(entry);
    }

    /// Advance to `ts`, pushing every due entry into `out`. `out` is not
    /// cleared.
    pub fn advance_into(&mut self, ts: u64, out: &mut Vec<TimerEntry>) {
        if ts <= self.current_ts {
            return;
        }
        let elapsed = ts - self.current_ts;
        let steps = ((elapsed / self.slot_us) as usize + 1).min(self.num_slots);

        for step in 0..steps {
            let mut remaining = self.slots[self.current_slot].len();
            while remaining > 0 {
                remaining -= 1;
                // Unwrap is fine: guarded by the remaining count.
                let entry = self.slots[self.current_slot].pop_front().unwrap();
                if entry.fire_at_us <= ts {
                    out.push(entry);
                } else {
                    // Not due yet: re-bucket relative to the new time.
                    let delta = entry.fire_at_us - ts;
                    let ahead =
                        (delta / self.slot_us).min(self.num_slots as u64 - 1).max(1) as usize;
                    let slot = (self.current_slot + ahead) % self.num_slots;
                    self.slots[slot].push_back(entry);
                }
            }
            if step + 1 < steps {
                self.current_slot = (self.current_slot + 1) % self.num_slots;
            }
        }
        self.current_ts = ts;
    }

    /// Remove the entry matching (session, slot, req_num). Returns false
    /// if no such entry exists (already fired or cancelled).
    pub fn cancel(&mut self, session: u16, slot: usize, req_num: u64) -> bool {
        for bucket in &mut self.slots {
            if let Some(pos) = bucket
                .iter()
                .position(|e| e.session == session && e.slot == slot && e.req_num == req_num)
            {
                bucket.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drop every entry belonging to a session (teardown path).
    pub fn cancel_session(&mut self, session: u16) {
        for bucket in &mut self.slots {
            bucket.retain(|e| e.session != session);
        }
    }

    /// Number of scheduled entries.
    pub fn active_count(&self) -> usize {
        self.slots.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_empty())
    }
}
