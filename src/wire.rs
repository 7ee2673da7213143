use crate::membership::ProcessId;
use crate::message::MessageId;
use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Upper bound on the number of entries accepted in a single incoming datagram. Senders
///  stay far below this (see `BroadcastConfig::max_entries_per_packet`); anything above
///  is treated as malformed rather than trusted as an allocation size.
const MAX_ENTRIES_PER_DATAGRAM: usize = 1024;

/// Discriminator byte at the start of every datagram.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DatagramKind {
    Data = 1,
    LinkAck = 2,
    UrbAck = 3,
}

/// The full wire protocol. One UDP datagram carries exactly one `Datagram`.
///
/// `LinkAck` echoes the entry list of the datagram it acknowledges plus that datagram's
///  kind, so the receiver of the ack can find the matching retransmission-table entry -
///  both DATA batches and URB acks are retransmitted until link-acked.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Datagram {
    Data {
        sender: ProcessId,
        entries: Vec<MessageId>,
    },
    LinkAck {
        sender: ProcessId,
        acked_kind: DatagramKind,
        entries: Vec<MessageId>,
    },
    UrbAck {
        sender: ProcessId,
        id: MessageId,
    },
}

impl Datagram {
    pub fn kind(&self) -> DatagramKind {
        match self {
            Datagram::Data { .. } => DatagramKind::Data,
            Datagram::LinkAck { .. } => DatagramKind::LinkAck,
            Datagram::UrbAck { .. } => DatagramKind::UrbAck,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind().into());

        match self {
            Datagram::Data { sender, entries } => {
                sender.ser(buf);
                Self::ser_entries(entries, buf);
            }
            Datagram::LinkAck { sender, acked_kind, entries } => {
                sender.ser(buf);
                buf.put_u8((*acked_kind).into());
                Self::ser_entries(entries, buf);
            }
            Datagram::UrbAck { sender, id } => {
                sender.ser(buf);
                id.ser(buf);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Datagram> {
        let kind = DatagramKind::try_from(buf.try_get_u8()?)?;

        let result = match kind {
            DatagramKind::Data => {
                let sender = ProcessId::try_deser(buf)?;
                let entries = Self::try_deser_entries(buf)?;
                Datagram::Data { sender, entries }
            }
            DatagramKind::LinkAck => {
                let sender = ProcessId::try_deser(buf)?;
                let acked_kind = DatagramKind::try_from(buf.try_get_u8()?)?;
                let entries = Self::try_deser_entries(buf)?;
                Datagram::LinkAck { sender, acked_kind, entries }
            }
            DatagramKind::UrbAck => {
                let sender = ProcessId::try_deser(buf)?;
                let id = MessageId::try_deser(buf)?;
                Datagram::UrbAck { sender, id }
            }
        };

        if buf.has_remaining() {
            bail!("trailing bytes after datagram");
        }
        Ok(result)
    }

    fn ser_entries(entries: &[MessageId], buf: &mut impl BufMut) {
        buf.put_usize_varint(entries.len());
        for entry in entries {
            entry.ser(buf);
        }
    }

    fn try_deser_entries(buf: &mut impl Buf) -> anyhow::Result<Vec<MessageId>> {
        let num_entries = buf.try_get_usize_varint()?;
        if num_entries == 0 {
            bail!("datagram without entries");
        }
        if num_entries > MAX_ENTRIES_PER_DATAGRAM {
            bail!("datagram claims {} entries, upper bound is {}", num_entries, MAX_ENTRIES_PER_DATAGRAM);
        }

        let mut entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            entries.push(MessageId::try_deser(buf)?);
        }
        Ok(entries)
    }
}
