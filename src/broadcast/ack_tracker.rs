use crate::membership::ProcessId;
use crate::message::MessageId;
use rustc_hash::{FxHashMap, FxHashSet};

/// Per-message acknowledgement bookkeeping for uniform delivery.
///
/// Every message id accumulates the set of processes known to have received it. Once that
///  set reaches the quorum the message counts as uniformly delivered: its ack set is
///  discarded, and all later acks for it are no-ops. Acks can and do arrive before the
///  message itself - the id is the payload, so an ack set can reach quorum for a message
///  this process never received directly.
pub struct AckTracker {
    quorum: usize,
    acks: FxHashMap<MessageId, FxHashSet<ProcessId>>,
    delivered: FxHashSet<MessageId>,
}

impl AckTracker {
    pub fn new(quorum: usize) -> AckTracker {
        AckTracker {
            quorum,
            acks: FxHashMap::default(),
            delivered: FxHashSet::default(),
        }
    }

    /// Adds `acker` to the ack set of `id`. Returns `true` exactly once per message,
    ///  on the call that makes the set reach the quorum.
    pub fn add_ack(&mut self, id: MessageId, acker: ProcessId) -> bool {
        if self.delivered.contains(&id) {
            return false;
        }

        let ackers = self.acks.entry(id).or_default();
        ackers.insert(acker);

        if ackers.len() >= self.quorum {
            self.acks.remove(&id);
            self.delivered.insert(id);
            true
        }
        else {
            false
        }
    }

    /// Whether `id` has reached its quorum (regardless of FIFO release).
    pub fn is_delivered(&self, id: MessageId) -> bool {
        self.delivered.contains(&id)
    }

    #[cfg(test)]
    pub fn num_pending(&self) -> usize {
        self.acks.len()
    }
}
