//! Bounded FIFO of events held while no client is attached.

use std::collections::VecDeque;

use tether_core::WorkspaceEvent;

/// Default capacity per workspace.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Drop-oldest event buffer.
#[derive(Debug)]
pub struct EventBuffer {
    events: VecDeque<WorkspaceEvent>,
    capacity: usize,
    dropped: u64,
}

impl EventBuffer {
    /// Buffer holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
            dropped: 0,
        }
    }

    /// Append, evicting the oldest event when full. Returns whether an
    /// event was evicted.
    pub fn push(&mut self, event: WorkspaceEvent) -> bool {
        let mut evicted = false;
        while self.events.len() >= self.capacity {
            let _ = self.events.pop_front();
            self.dropped = self.dropped.saturating_add(1);
            evicted = true;
        }
        self.events.push_back(event);
        evicted
    }

    /// Take everything, oldest first, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<WorkspaceEvent> {
        self.events.drain(..).collect()
    }

    /// Buffered event count.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Maximum number of buffered events.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
