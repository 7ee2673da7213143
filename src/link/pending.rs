//! The retransmission table: every reliably sent datagram (DATA batches and URB acks)
//!  stays here, serialized and addressed, until the matching LINK_ACK arrives. A shared
//!  ticker periodically collects the entries whose last transmission timed out and
//!  re-sends them - indefinitely, since no permanent failure is modelled.

use crate::membership::ProcessId;
use crate::message::MessageId;
use crate::wire::DatagramKind;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Identity of a sent datagram awaiting acknowledgement. A LINK_ACK echoes exactly these
///  three components (its sender is the destination, plus acked kind and entry list), so
///  an incoming ack maps straight to a table key.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PacketKey {
    pub dest: ProcessId,
    pub kind: DatagramKind,
    pub entries: Vec<MessageId>,
}

struct PendingPacket {
    addr: SocketAddr,
    buf: Vec<u8>,
    last_sent: Instant,
    /// number of DATA payload entries - what the adaptive window counts. Zero for URB acks.
    num_data_entries: usize,
}

#[derive(Default)]
pub struct PendingTable {
    packets: FxHashMap<PacketKey, PendingPacket>,
    in_flight_data: usize,
}

impl PendingTable {
    pub fn new() -> PendingTable {
        PendingTable::default()
    }

    /// Registers a freshly sent datagram. Re-registering the same key (e.g. a URB ack
    ///  sent again for a re-received message) just refreshes the timestamp - it must not
    ///  double-count in-flight entries.
    pub fn register(&mut self, key: PacketKey, addr: SocketAddr, buf: Vec<u8>, now: Instant) {
        let num_data_entries = match key.kind {
            DatagramKind::Data => key.entries.len(),
            _ => 0,
        };

        let prev = self.packets.insert(key, PendingPacket {
            addr,
            buf,
            last_sent: now,
            num_data_entries,
        });

        if let Some(prev) = prev {
            self.in_flight_data -= prev.num_data_entries;
        }
        self.in_flight_data += num_data_entries;
    }

    /// Removes an acknowledged datagram, returning the number of DATA entries it held.
    ///  `None` means the ack was a duplicate (or for a packet never sent) - a no-op.
    pub fn acknowledge(&mut self, key: &PacketKey) -> Option<usize> {
        let removed = self.packets.remove(key)?;
        self.in_flight_data -= removed.num_data_entries;
        Some(removed.num_data_entries)
    }

    /// Number of unacked DATA entries across all destinations - the quantity the
    ///  adaptive window bounds.
    pub fn in_flight_data(&self) -> usize {
        self.in_flight_data
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Collects all entries whose last transmission is at least `timeout` old, bumping
    ///  their timestamp so they are not collected again before another full timeout.
    ///  Returns the (address, serialized datagram) pairs to re-send plus the number of
    ///  timed-out DATA entries for the window statistics.
    pub fn timed_out(&mut self, now: Instant, timeout: Duration) -> (Vec<(SocketAddr, Vec<u8>)>, usize) {
        let mut resends = Vec::new();
        let mut num_data_entries = 0;

        for packet in self.packets.values_mut() {
            if now.duration_since(packet.last_sent) >= timeout {
                packet.last_sent = now;
                num_data_entries += packet.num_data_entries;
                resends.push((packet.addr, packet.buf.clone()));
            }
        }

        (resends, num_data_entries)
    }
}
