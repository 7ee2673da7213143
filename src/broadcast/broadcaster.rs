use crate::broadcast::ack_tracker::AckTracker;
use crate::broadcast::fifo::FifoGate;
use crate::delivery_log::DeliveryLog;
use crate::link::{LinkDispatcher, LinkSender};
use crate::membership::{Membership, ProcessId};
use crate::message::{Message, MessageId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

struct BroadcastState {
    next_seq: u64,
    acks: AckTracker,
    fifo: FifoGate,
}

impl BroadcastState {
    /// Feeds acks in, and if the message's quorum is newly reached, runs it through the
    ///  FIFO gate and logs every released id. Delivery logging happens under the state
    ///  lock so the per-creator `d` event order is the release order.
    fn add_acks(&mut self, log: &Arc<dyn DeliveryLog>, id: MessageId, ackers: &[ProcessId]) {
        let mut quorum_reached = false;
        for &acker in ackers {
            quorum_reached |= self.acks.add_ack(id, acker);
        }
        if !quorum_reached {
            return;
        }

        for released in self.fifo.on_urb_delivered(id) {
            debug!("delivering {}", released);
            log.record_deliver(released.creator, released.seq);
        }
    }
}

/// Uniform reliable broadcast with per-creator FIFO delivery, on top of a perfect link.
///
/// The broadcaster owns no I/O: it talks to the network exclusively through the injected
///  [LinkSender] and receives from it as the link's [LinkDispatcher]. A message is
///  uniformly delivered once a strict majority of the group is known to have received
///  it, and released to the [DeliveryLog] once all of its creator's earlier sequence
///  numbers have been released.
pub struct Broadcaster {
    membership: Arc<Membership>,
    link: Arc<dyn LinkSender>,
    log: Arc<dyn DeliveryLog>,
    state: Mutex<BroadcastState>,
}

impl Broadcaster {
    pub fn new(membership: Arc<Membership>, link: Arc<dyn LinkSender>, log: Arc<dyn DeliveryLog>) -> Broadcaster {
        let quorum = membership.quorum_size();
        Broadcaster {
            membership,
            link,
            log,
            state: Mutex::new(BroadcastState {
                next_seq: 1,
                acks: AckTracker::new(quorum),
                fifo: FifoGate::new(),
            }),
        }
    }

    /// Broadcasts the next message in this process's sequence, returning its sequence
    ///  number. The creator counts as its own first acknowledger without sending itself
    ///  anything; in a single-process group this already reaches the quorum.
    ///
    /// Blocks (backpressure) while the link's outgoing queue is full.
    pub async fn broadcast(&self) -> u64 {
        let self_id = self.membership.self_id();

        let id = {
            let mut state = self.state.lock().await;
            let id = MessageId::new(self_id, state.next_seq);
            state.next_seq += 1;

            debug!("broadcasting {}", id);
            self.log.record_broadcast(id.seq);

            state.add_acks(&self.log, id, &[self_id]);
            id
        };

        // the state lock is never held across link sends: backpressure here must not
        //  stall the receive path
        for peer in self.membership.peers() {
            self.link.send(peer, id).await;
        }

        id.seq
    }
}

#[async_trait]
impl LinkDispatcher for Broadcaster {
    async fn on_message(&self, msg: Message) {
        let Message { id, sender } = msg;
        let self_id = self.membership.self_id();

        {
            let mut state = self.state.lock().await;
            if state.acks.is_delivered(id) {
                // the acks quorumed before the message itself arrived - it is already
                //  (or about to be) delivered everywhere, no relay or ack needed
                trace!("received already-delivered {} from {} - ignoring", id, sender);
                return;
            }

            // the relayer and the creator have the message by construction
            state.add_acks(&self.log, id, &[self_id, sender, id.creator]);
        }

        // Relaying goes through the link's bounded queue and may block on backpressure,
        //  and this method runs on the link's receive path. Detach it so a full queue
        //  cannot stall reception of the very acks that would drain it.
        let link = self.link.clone();
        let peers = self.membership.peers();
        tokio::spawn(async move {
            for &peer in &peers {
                if peer != sender && peer != id.creator {
                    link.send(peer, id).await;
                }
            }
            for &peer in &peers {
                link.send_urb_ack(peer, id).await;
            }
        });
    }

    async fn on_urb_ack(&self, acker: ProcessId, id: MessageId) {
        trace!("URB ack for {} from {}", id, acker);

        let mut state = self.state.lock().await;
        state.add_acks(&self.log, id, &[acker]);
    }
}
