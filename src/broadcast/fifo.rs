use crate::membership::ProcessId;
use crate::message::MessageId;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Per-creator FIFO delivery gate.
///
/// Uniform delivery (quorum reached) and FIFO delivery are separate events: a message
///  whose quorum is reached out of order is buffered here until all of its creator's
///  earlier sequence numbers have been released. Release order per creator is
///  `1, 2, 3, ...` without gaps or duplicates.
#[derive(Default)]
pub struct FifoGate {
    creators: FxHashMap<ProcessId, CreatorState>,
}

struct CreatorState {
    next_seq: u64,
    buffered: BTreeSet<u64>,
}

impl FifoGate {
    pub fn new() -> FifoGate {
        FifoGate::default()
    }

    /// Feeds a uniformly delivered message id into the gate, returning the contiguous
    ///  run of its creator's ids that becomes releasable (possibly empty, possibly
    ///  several if this id filled a gap).
    pub fn on_urb_delivered(&mut self, id: MessageId) -> Vec<MessageId> {
        let state = self.creators.entry(id.creator)
            .or_insert(CreatorState { next_seq: 1, buffered: BTreeSet::new() });

        state.buffered.insert(id.seq);

        let mut released = Vec::new();
        while state.buffered.remove(&state.next_seq) {
            released.push(MessageId::new(id.creator, state.next_seq));
            state.next_seq += 1;
        }
        released
    }

    #[cfg(test)]
    pub fn num_buffered(&self, creator: ProcessId) -> usize {
        self.creators.get(&creator).map(|s| s.buffered.len()).unwrap_or(0)
    }
}
