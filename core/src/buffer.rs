// Per-client ring buffer of recent log records.
//
// One map of fixed-capacity rings behind a single RwLock; critical sections
// are O(ring size) so a single lock is enough for UDP-bound throughputs.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::types::LogRecord;

struct Ring {
    slots: VecDeque<LogRecord>,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, record: LogRecord) {
        if self.slots.len() == self.capacity {
            // Overwrite-on-full: the oldest record is dropped silently.
            self.slots.pop_front();
        }
        self.slots.push_back(record);
    }
}

/// Bounded buffer of recent log records, one ring per client.
///
/// Producers never block beyond the lock; when a ring is full the oldest
/// record is overwritten. The durable path is the store batch, not this
/// buffer.
pub struct LogBuffer {
    buffers: RwLock<HashMap<String, Ring>>,
    capacity: usize,
}

impl LogBuffer {
    /// Creates a buffer whose rings hold `capacity` records per client.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Appends a record to the client's ring, allocating the ring lazily.
    pub fn push(&self, client_id: &str, record: LogRecord) {
        let mut buffers = self.buffers.write().expect("log buffer lock poisoned");
        buffers
            .entry(client_id.to_string())
            .or_insert_with(|| Ring::new(self.capacity))
            .push(record);
    }

    /// Returns a snapshot of the client's records in insertion order without
    /// clearing the ring.
    pub fn peek(&self, client_id: &str) -> Vec<LogRecord> {
        let buffers = self.buffers.read().expect("log buffer lock poisoned");
        buffers
            .get(client_id)
            .map(|ring| ring.slots.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns a snapshot of the client's records and resets the ring.
    pub fn drain(&self, client_id: &str) -> Vec<LogRecord> {
        let mut buffers = self.buffers.write().expect("log buffer lock poisoned");
        buffers
            .get_mut(client_id)
            .map(|ring| std::mem::take(&mut ring.slots).into_iter().collect())
            .unwrap_or_default()
    }

    /// True iff at least one record is buffered for the client.
    pub fn has_logs(&self, client_id: &str) -> bool {
        let buffers = self.buffers.read().expect("log buffer lock poisoned");
        buffers
            .get(client_id)
            .map(|ring| !ring.slots.is_empty())
            .unwrap_or(false)
    }
}
