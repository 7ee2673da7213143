use crate::delivery_log::DeliveryLog;
use crate::membership::ProcessId;
use std::sync::Mutex;

/// One event as reported to the [DeliveryLog] sink, mirroring the `b <seq>` /
///  `d <creator> <seq>` lines of the file format the real sink writes.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum LogEvent {
    Broadcast(u64),
    Deliver(ProcessId, u64),
}

/// A [DeliveryLog] that records events in memory for assertions.
#[derive(Default)]
pub struct RecordingLog {
    events: Mutex<Vec<LogEvent>>,
}

impl RecordingLog {
    pub fn new() -> RecordingLog {
        RecordingLog::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Delivered sequence numbers for one creator, in the order they were recorded.
    pub fn deliveries_for(&self, creator: ProcessId) -> Vec<u64> {
        self.events.lock().unwrap().iter()
            .filter_map(|e| match e {
                LogEvent::Deliver(c, seq) if *c == creator => Some(*seq),
                _ => None,
            })
            .collect()
    }

    pub fn num_deliveries(&self) -> usize {
        self.events.lock().unwrap().iter()
            .filter(|e| matches!(e, LogEvent::Deliver(_, _)))
            .count()
    }
}

impl DeliveryLog for RecordingLog {
    fn record_broadcast(&self, seq: u64) {
        self.events.lock().unwrap().push(LogEvent::Broadcast(seq));
    }

    fn record_deliver(&self, creator: ProcessId, seq: u64) {
        self.events.lock().unwrap().push(LogEvent::Deliver(creator, seq));
    }
}
