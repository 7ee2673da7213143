use crate::membership::ProcessId;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use std::fmt::{Display, Formatter};

/// The identity under which a broadcast is deduplicated, acknowledged and delivered.
///
/// This is deliberately separate from the wire-level routing fields: the relaying sender
///  and the destination of a datagram change on every hop and retransmission, while the
///  `(creator, seq)` pair stays the same. Only this pair may ever be used as a key in
///  received / delivered / ack bookkeeping.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageId {
    pub creator: ProcessId,
    /// per-creator sequence number, starting at 1, gapless and monotone at the creator
    pub seq: u64,
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.creator, self.seq)
    }
}

impl MessageId {
    pub fn new(creator: ProcessId, seq: u64) -> MessageId {
        MessageId { creator, seq }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.creator.ser(buf);
        buf.put_u64_varint(self.seq);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MessageId> {
        let creator = ProcessId::try_deser(buf)?;
        let seq = buf.try_get_u64_varint()?;
        Ok(MessageId { creator, seq })
    }
}

/// A message as handed from the perfect link to the broadcast layer: the delivery
///  identity plus the immediate relayer it arrived from.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Message {
    pub id: MessageId,
    pub sender: ProcessId,
}
