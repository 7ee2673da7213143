//! Broadcast primitives for a static group of processes communicating over an unreliable
//!  datagram network: point-to-point *perfect links* and a uniform-reliable, FIFO-ordered
//!  broadcast built on top of them.
//!
//! ## Layers
//!
//! * [link::PerfectLink] turns lossy, reordering UDP into a reliable, duplicate-free
//!   channel per (sender, destination) pair. It batches queued message ids into datagrams,
//!   retransmits unacknowledged datagrams indefinitely, deduplicates on the receiving side,
//!   and bounds the number of in-flight payload entries with an AIMD-style adaptive window.
//! * [broadcast::Broadcaster] implements uniform reliable broadcast (URB) with a
//!   majority-ack quorum: a message may only be delivered once a strict majority of
//!   processes is known to have received it, which gives uniform agreement even if the
//!   creator fails after delivering locally. Delivered messages pass a per-creator FIFO
//!   gate before being handed to the application, so each creator's messages are observed
//!   in sending order `1, 2, 3, ...` without gaps.
//!
//! Messages carry no application payload beyond their identity: a broadcast is fully
//!  described by `(creator, sequence number)`, and that pair is the *only* delivery
//!  identity - the relaying sender and the destination vary across hops and never
//!  participate in deduplication.
//!
//! ## Wire format
//!
//! All datagrams start with a kind discriminator byte; every other integer is
//!  varint-encoded. There is no cross-version compatibility guarantee.
//!
//! ```ascii
//! DATA:     kind=1, sender, entry count, then per entry: creator, seq
//! LINK_ACK: kind=2, ack sender, acked kind, entry count, then per entry: creator, seq
//! URB_ACK:  kind=3, ack sender, creator, seq
//! ```
//!
//! A LINK_ACK echoes the exact entry list of the datagram it acknowledges, plus the kind
//!  of that datagram: URB_ACK datagrams are retransmitted until link-acked just like DATA
//!  (a lost URB ack would otherwise never be repaired and the quorum could stall), and the
//!  acked-kind field keeps the two retransmission table entries apart.
//!
//! ## What this crate is not
//!
//! No encryption or authentication of traffic, no tolerance of network partitions beyond
//!  unbounded retry, no dynamic group membership, and no persistence of in-flight state
//!  across process restarts.

pub mod broadcast;
pub mod config;
pub mod delivery_log;
pub mod link;
pub mod membership;
pub mod message;
pub mod test_util;
pub mod wire;
