use crate::membership::ProcessId;
use crate::message::{Message, MessageId};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

pub mod pending;
pub mod perfect_link;
pub mod send_socket;
pub mod window;

pub use perfect_link::PerfectLink;

/// The sending half of the perfect link as seen by the layer above it. Injected as a
///  capability rather than accessed through a singleton, so the broadcast logic can be
///  tested against a mock link.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkSender: Send + Sync + 'static {
    /// Queues a message id for reliable delivery to `to` and returns. The call blocks
    ///  (backpressure) while the outgoing queue is at capacity - messages are never
    ///  dropped on the sending side, and no per-message failure is ever surfaced.
    async fn send(&self, to: ProcessId, id: MessageId);

    /// Sends a URB acknowledgement to `to`. URB acks travel reliably: the datagram is
    ///  retransmitted until link-acked, but it does not count against the data window.
    async fn send_urb_ack(&self, to: ProcessId, id: MessageId);
}

/// The upper layer the perfect link delivers into.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkDispatcher: Send + Sync + 'static {
    /// Called at most once per `(creator, seq)` pair - the link deduplicates across all
    ///  senders before dispatching.
    async fn on_message(&self, msg: Message);

    /// Called for every received URB ack. Duplicates are possible (acks are retransmitted
    ///  and re-sent); the handler is required to be idempotent.
    async fn on_urb_ack(&self, acker: ProcessId, id: MessageId);
}
