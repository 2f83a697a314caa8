//! Fixed-capacity ring of recent log lines backing `/logs` and
//! `/logs/stream`. Child stdout/stderr and proxy-level messages land here;
//! structured logging itself goes through `tracing`.

use crate::events::{EventBus, LogLine, ProxyEvent, now_ms};
use std::collections::VecDeque;
use std::sync::Mutex;

const LOG_RING_CAPACITY: usize = 1000;

pub struct LogMonitor {
    ring: Mutex<VecDeque<LogLine>>,
    capacity: usize,
    events: EventBus,
}

impl LogMonitor {
    pub fn new(events: EventBus) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
            capacity: LOG_RING_CAPACITY,
            events,
        }
    }

    /// Append a line attributed to `source` (a model ID or `proxy`).
    pub fn append(&self, source: &str, line: &str) {
        let entry = LogLine {
            timestamp_ms: now_ms(),
            source: source.to_string(),
            line: line.to_string(),
        };

        {
            let mut ring = self.ring.lock().unwrap();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }

        self.events.emit(ProxyEvent::Log(entry));
    }

    /// Snapshot of the retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }
}
