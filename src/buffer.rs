use std::collections::VecDeque;

use crate::types::OutboundRecord;

/// Records held until the dispatcher is ready.
///
/// Appends and the drain both run under the dispatcher's state lock, so a
/// record ends up either in the drain or in a later direct enqueue, never both.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    items: VecDeque<OutboundRecord>,
    drained: bool,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: OutboundRecord) {
        self.items.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Hand every buffered record, oldest first, to `target`.
    ///
    /// Runs once; later calls move nothing. Records `target` refuses are
    /// returned in order so the caller can report them.
    pub fn drain_into<F>(&mut self, mut target: F) -> Vec<OutboundRecord>
    where
        F: FnMut(OutboundRecord) -> Result<(), OutboundRecord>,
    {
        if self.drained {
            return Vec::new();
        }
        self.drained = true;

        let mut refused = Vec::new();
        while let Some(record) = self.items.pop_front() {
            if let Err(record) = target(record) {
                refused.push(record);
            }
        }
        refused
    }

    /// Remove everything without delivering it.
    pub fn take_all(&mut self) -> Vec<OutboundRecord> {
        self.items.drain(..).collect()
    }
}
