//! One virtual-machine log: the ordered, ack-chained message sequence a
//! single federated server contributes to a height.

use std::time::Instant;

use crate::message::{Ack, Message};
use crate::utilities::hash::Hash;

/// An installed `(message, ack)` pair.
#[derive(Debug, Clone)]
pub struct Slot {
    pub message: Message,
    pub ack: Ack,
}

#[derive(Debug, Default)]
pub struct Vm {
    /// Slots indexed by `height_in_vm`; `None` marks a gap awaiting delivery.
    pub list: Vec<Option<Slot>>,
    /// Next index to process. Everything below is installed and processed.
    pub height: usize,
    /// Minute the owning leader is currently acknowledging into.
    pub leader_minute: u8,
    /// 0 while open; `k + 1` once the EOM for minute `k` has been processed.
    pub seal: u8,
    /// Index of the sealing EOM.
    pub seal_height: usize,
    /// Follower progress markers.
    pub minute_complete: u8,
    pub minute_finished: u8,
    pub minute_height: usize,
    /// Retry clocks for missing-slot and missing-seal requests.
    pub missing_time: Option<Instant>,
    pub seal_time: Option<Instant>,
}

impl Vm {
    pub fn new() -> Self {
        Self::default()
    }

    /// The index the owning leader assigns to its next ack. Leaders append;
    /// only followers see gaps.
    pub fn next_ack_height(&self) -> u32 {
        self.list.len() as u32
    }

    /// Message hash of the highest installed ack, the serial-hash
    /// predecessor for the next append.
    pub fn last_message_hash(&self) -> Option<Hash> {
        self.list
            .iter()
            .rev()
            .find_map(|slot| slot.as_ref())
            .map(|slot| slot.ack.message_hash)
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.list.get(index).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn put(&mut self, index: usize, slot: Slot) {
        if self.list.len() <= index {
            self.list.resize_with(index + 1, || None);
        }
        self.list[index] = Some(slot);
    }

    /// True once the cursor has consumed every installed slot and no gaps
    /// remain.
    pub fn fully_processed(&self) -> bool {
        self.height == self.list.len()
    }

    /// The cursor's current slot, if installed.
    pub fn pending_slot(&self) -> Option<&Slot> {
        self.slot(self.height)
    }

    /// True when the cursor sits on a gap.
    pub fn stalled_on_gap(&self) -> bool {
        self.height < self.list.len() && self.list[self.height].is_none()
    }
}
