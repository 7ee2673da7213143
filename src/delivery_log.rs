use crate::membership::ProcessId;
#[cfg(test)] use mockall::automock;

/// The externally provided output sink the broadcast layer reports into. The actual
///  implementation (typically an append-only file writer) lives outside this crate; the
///  core only requires the two operations to be thread-safe and cheap.
///
/// `record_broadcast` fires exactly once per locally created sequence number, at the time
///  the broadcast is initiated. `record_deliver` fires exactly once per `(creator, seq)`
///  pair, at the moment the FIFO gate releases it - there is no other success signal for
///  a broadcast.
#[cfg_attr(test, automock)]
pub trait DeliveryLog: Send + Sync + 'static {
    fn record_broadcast(&self, seq: u64);

    fn record_deliver(&self, creator: ProcessId, seq: u64);
}
