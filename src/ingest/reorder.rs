//! Lateness buffer that puts signals back into `collected_at` order
//!
//! The watermark is the largest `collected_at` seen. A buffered signal is
//! released once it is at least `lateness` older than the watermark, so any
//! signal that arrives within the lateness window still lands in order.
//! Released batches are sorted by `(collected_at, id)`.

use crate::types::{Signal, SignalId};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub struct ReorderBuffer {
    lateness: Duration,
    watermark: Option<DateTime<Utc>>,
    /// Latest `collected_at` already released
    released_up_to: Option<DateTime<Utc>>,
    pending: BTreeMap<(DateTime<Utc>, SignalId), Signal>,
    late: u64,
}

impl ReorderBuffer {
    pub fn new(lateness: Duration) -> Self {
        Self {
            lateness,
            watermark: None,
            released_up_to: None,
            pending: BTreeMap::new(),
            late: 0,
        }
    }

    /// Buffer a signal; returns false if the same signal is already buffered
    pub fn insert(&mut self, signal: Signal) -> bool {
        let at = signal.collected_at();
        if let Some(released) = self.released_up_to {
            if at < released {
                self.late += 1;
                warn!(
                    "{} arrived beyond the lateness window ({} < {})",
                    signal.id(),
                    at,
                    released
                );
            }
        }

        self.watermark = Some(self.watermark.map_or(at, |w| w.max(at)));
        let key = (at, signal.id());
        if self.pending.contains_key(&key) {
            debug!("Duplicate {} ignored", signal.id());
            return false;
        }
        self.pending.insert(key, signal);
        true
    }

    /// Signals that arrived behind an already released one
    pub fn late_count(&self) -> u64 {
        self.late
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    /// `watermark - lateness`: everything at or before it is settled
    pub fn cutoff(&self) -> Option<DateTime<Utc>> {
        self.watermark
            .and_then(|w| w.checked_sub_signed(self.lateness))
    }

    /// Release every signal at or before the cutoff, in order
    pub fn release(&mut self) -> Vec<Signal> {
        let Some(cutoff) = self.cutoff() else {
            return Vec::new();
        };

        let mut released = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 > cutoff {
                break;
            }
            released.push(entry.remove());
        }
        self.note_released(&released);
        released
    }

    /// Release everything regardless of the watermark
    pub fn flush(&mut self) -> Vec<Signal> {
        let released: Vec<Signal> = std::mem::take(&mut self.pending).into_values().collect();
        self.note_released(&released);
        released
    }

    fn note_released(&mut self, released: &[Signal]) {
        if let Some(last) = released.last() {
            let at = last.collected_at();
            self.released_up_to = Some(self.released_up_to.map_or(at, |r| r.max(at)));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
