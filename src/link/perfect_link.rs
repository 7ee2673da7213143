use crate::config::BroadcastConfig;
use crate::link::pending::{PacketKey, PendingTable};
use crate::link::send_socket::SendSocket;
use crate::link::window::AimdWindow;
use crate::link::{LinkDispatcher, LinkSender};
use crate::membership::{Membership, ProcessId};
use crate::message::{Message, MessageId};
use crate::wire::{Datagram, DatagramKind};
use anyhow::anyhow;
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// State touched by both the receive path (acks) and the timer paths (retransmission,
///  window sampling), guarded by a single lock. The lock is never held across a socket
///  operation.
struct LinkShared {
    pending: PendingTable,
    window: AimdWindow,
}

/// A reliable, duplicate-free, content-preserving channel per (sender, destination) pair
///  on top of lossy, reordering UDP.
///
/// PerfectLink is where the transport pieces come together: it listens on a UdpSocket and
///  classifies incoming datagrams, drains an outgoing queue into batched DATA datagrams,
///  re-sends unacknowledged datagrams on a shared ticker, and adapts the in-flight bound
///  from the observed ack / timeout ratio. Deduplicated payloads and URB acks are pushed
///  into the injected [LinkDispatcher].
pub struct PerfectLink {
    config: Arc<BroadcastConfig>,
    membership: Arc<Membership>,

    receive_socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,

    outgoing_tx: mpsc::Sender<(ProcessId, MessageId)>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<(ProcessId, MessageId)>>>,

    shared: Mutex<LinkShared>,
    /// signalled whenever window capacity may have been freed up
    window_changed: Notify,

    received: Mutex<FxHashSet<MessageId>>,

    shutdown: watch::Sender<bool>,
}

impl PerfectLink {
    /// Binds the receive socket at this process's membership address and sends through it.
    pub async fn bind(config: Arc<BroadcastConfig>, membership: Arc<Membership>) -> anyhow::Result<PerfectLink> {
        let socket = Arc::new(UdpSocket::bind(membership.self_addr()).await?);
        info!("process {} bound receive socket to {:?}", membership.self_id(), socket.local_addr()?);

        PerfectLink::new(config, membership, socket.clone(), Arc::new(socket))
    }

    /// Wires the link from explicitly provided sockets - the seam tests and loss
    ///  injection go through.
    pub fn new(
        config: Arc<BroadcastConfig>,
        membership: Arc<Membership>,
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
    ) -> anyhow::Result<PerfectLink> {
        config.validate()?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.send_queue_capacity);

        Ok(PerfectLink {
            shared: Mutex::new(LinkShared {
                pending: PendingTable::new(),
                window: AimdWindow::new(&config),
            }),
            config,
            membership,
            receive_socket,
            send_socket,
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            window_changed: Notify::new(),
            received: Mutex::new(FxHashSet::default()),
            shutdown: watch::Sender::new(false),
        })
    }

    /// Drives all background work - the receive loop, the batching drain loop, the
    ///  retransmission ticker and the window sampler - until [PerfectLink::shutdown] is
    ///  called or the receive socket fails fatally.
    pub async fn run(&self, dispatcher: Arc<dyn LinkDispatcher>) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        tokio::select! {
            result = self.recv_loop(dispatcher) => result,
            result = self.drain_loop() => result,
            _ = self.retransmit_loop() => Ok(()),
            _ = self.window_loop() => Ok(()),
            _ = shutdown.wait_for(|&stop| stop) => {
                info!("process {} shutting down perfect link", self.membership.self_id());
                Ok(())
            }
        }
    }

    /// Promptly observed by all loops: retransmissions stop being scheduled, and
    ///  in-flight unacknowledged state is abandoned without persistence.
    pub fn shutdown(&self) {
        self.shutdown.send(true).ok();
    }

    async fn recv_loop(&self, dispatcher: Arc<dyn LinkDispatcher>) -> anyhow::Result<()> {
        info!("starting receive loop");

        let mut buf = [0u8; 1500];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    // fatal local transport failure - not retried, propagated as shutdown
                    error!("receive socket failed: {}", e);
                    return Err(e.into());
                }
            };

            let parse_buf = &mut &buf[..num_read];
            let datagram = match Datagram::try_deser(parse_buf) {
                Ok(datagram) => datagram,
                Err(e) => {
                    warn!("received malformed datagram from {:?}, dropping: {}", from, e);
                    continue;
                }
            };

            self.on_datagram(&dispatcher, datagram).await;
        }
    }

    async fn on_datagram(&self, dispatcher: &Arc<dyn LinkDispatcher>, datagram: Datagram) {
        match datagram {
            Datagram::Data { sender, entries } => self.on_data(dispatcher, sender, entries).await,
            Datagram::LinkAck { sender, acked_kind, entries } => self.on_link_ack(sender, acked_kind, entries).await,
            Datagram::UrbAck { sender, id } => self.on_urb_ack(dispatcher, sender, id).await,
        }
    }

    async fn on_data(&self, dispatcher: &Arc<dyn LinkDispatcher>, sender: ProcessId, entries: Vec<MessageId>) {
        if !self.membership.contains(sender) {
            warn!("received DATA from unknown process {} - dropping", sender);
            return;
        }

        // ack unconditionally, covering all entries of the packet: acks are idempotent,
        //  and the sender keeps retransmitting until one gets through
        self.send_link_ack(sender, DatagramKind::Data, entries.clone()).await;

        for id in entries {
            let first_reception = self.received.lock().await.insert(id);
            if first_reception {
                trace!("delivering {} received from {}", id, sender);
                dispatcher.on_message(Message { id, sender }).await;
            }
            else {
                trace!("duplicate {} from {} - dropping", id, sender);
            }
        }
    }

    async fn on_link_ack(&self, sender: ProcessId, acked_kind: DatagramKind, entries: Vec<MessageId>) {
        let key = PacketKey { dest: sender, kind: acked_kind, entries };

        let acknowledged = {
            let mut shared = self.shared.lock().await;
            match shared.pending.acknowledge(&key) {
                Some(num_data_entries) => {
                    shared.window.on_acked(num_data_entries);
                    true
                }
                None => false,
            }
        };

        if acknowledged {
            self.window_changed.notify_waiters();
        }
        else {
            trace!("ack from {} for a packet no longer pending - dropping", sender);
        }
    }

    async fn on_urb_ack(&self, dispatcher: &Arc<dyn LinkDispatcher>, sender: ProcessId, id: MessageId) {
        if !self.membership.contains(sender) {
            warn!("received URB ack from unknown process {} - dropping", sender);
            return;
        }

        // URB acks are link-acked so the sender stops retransmitting them
        self.send_link_ack(sender, DatagramKind::UrbAck, vec![id]).await;

        dispatcher.on_urb_ack(sender, id).await;
    }

    async fn send_link_ack(&self, to: ProcessId, acked_kind: DatagramKind, entries: Vec<MessageId>) {
        let addr = match self.membership.addr_of(to) {
            Some(addr) => addr,
            None => {
                warn!("no address for process {} - dropping link ack", to);
                return;
            }
        };

        let mut buf = BytesMut::new();
        Datagram::LinkAck {
            sender: self.membership.self_id(),
            acked_kind,
            entries,
        }.ser(&mut buf);

        self.send_socket.do_send_packet(addr, &buf).await;
    }

    async fn drain_loop(&self) -> anyhow::Result<()> {
        let mut outgoing_rx = self.outgoing_rx.lock().await
            .take()
            .ok_or_else(|| anyhow!("perfect link is already running"))?;

        loop {
            let Some((dest, id)) = outgoing_rx.recv().await else {
                return Ok(());
            };

            // opportunistically drain whatever else is queued, so bursts get batched
            let mut by_dest: FxHashMap<ProcessId, Vec<MessageId>> = FxHashMap::default();
            by_dest.entry(dest).or_default().push(id);

            let mut num_drained = 1;
            while num_drained < self.config.send_queue_capacity {
                match outgoing_rx.try_recv() {
                    Ok((dest, id)) => {
                        by_dest.entry(dest).or_default().push(id);
                        num_drained += 1;
                    }
                    Err(_) => break,
                }
            }

            let mut dests: Vec<ProcessId> = by_dest.keys().cloned().collect();
            dests.sort();

            for dest in dests {
                for chunk in by_dest[&dest].chunks(self.config.max_entries_per_packet) {
                    self.send_data_packet(dest, chunk.to_vec()).await;
                }
            }
        }
    }

    async fn send_data_packet(&self, dest: ProcessId, entries: Vec<MessageId>) {
        let addr = match self.membership.addr_of(dest) {
            Some(addr) => addr,
            None => {
                warn!("no address for process {} - dropping send", dest);
                return;
            }
        };

        let mut buf = BytesMut::new();
        Datagram::Data {
            sender: self.membership.self_id(),
            entries: entries.clone(),
        }.ser(&mut buf);
        let buf = buf.to_vec();

        // stall at the window bound; an empty table always admits one batch so an
        //  oversized batch cannot wedge the drain loop
        loop {
            let notified = self.window_changed.notified();
            {
                let mut shared = self.shared.lock().await;
                let window = shared.window.window() as usize;
                let in_flight = shared.pending.in_flight_data();
                if in_flight == 0 || in_flight + entries.len() <= window {
                    shared.pending.register(
                        PacketKey { dest, kind: DatagramKind::Data, entries: entries.clone() },
                        addr,
                        buf.clone(),
                        Instant::now(),
                    );
                    break;
                }
            }
            trace!("send window full - waiting for acks");
            notified.await;
        }

        self.send_socket.do_send_packet(addr, &buf).await;
    }

    async fn retransmit_loop(&self) {
        let mut ticker = interval(self.config.retransmit_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let resends = {
                let mut shared = self.shared.lock().await;
                let (resends, num_data_entries) = shared.pending
                    .timed_out(Instant::now(), self.config.retransmit_timeout);
                if num_data_entries > 0 {
                    shared.window.on_timed_out(num_data_entries);
                }
                resends
            };

            if resends.is_empty() {
                continue;
            }

            debug!("retransmitting {} unacknowledged packet(s)", resends.len());
            for (addr, buf) in resends {
                self.send_socket.do_send_packet(addr, &buf).await;
            }
        }
    }

    async fn window_loop(&self) {
        let mut ticker = interval(self.config.window_sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            self.shared.lock().await.window.sample();
            self.window_changed.notify_waiters();
        }
    }
}

#[async_trait]
impl LinkSender for PerfectLink {
    async fn send(&self, to: ProcessId, id: MessageId) {
        // blocks while the queue is at capacity - backpressure instead of dropping
        if self.outgoing_tx.send((to, id)).await.is_err() {
            error!("outgoing queue is closed - dropping send of {} to {}", id, to);
        }
    }

    async fn send_urb_ack(&self, to: ProcessId, id: MessageId) {
        let addr = match self.membership.addr_of(to) {
            Some(addr) => addr,
            None => {
                warn!("no address for process {} - dropping URB ack", to);
                return;
            }
        };

        let mut buf = BytesMut::new();
        Datagram::UrbAck {
            sender: self.membership.self_id(),
            id,
        }.ser(&mut buf);
        let buf = buf.to_vec();

        self.shared.lock().await.pending.register(
            PacketKey { dest: to, kind: DatagramKind::UrbAck, entries: vec![id] },
            addr,
            buf.clone(),
            Instant::now(),
        );

        self.send_socket.do_send_packet(addr, &buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLinkDispatcher;
    use crate::test_util::membership::test_membership;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time;

    /// Records every sent packet - more convenient than mock expectations for
    ///  assertions about loops that send an unknown number of times.
    #[derive(Default)]
    struct CapturingSocket {
        packets: std::sync::Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    #[async_trait]
    impl SendSocket for CapturingSocket {
        async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
            self.packets.lock().unwrap().push((to, packet_buf.to_vec()));
        }
    }

    impl CapturingSocket {
        fn datagrams(&self) -> Vec<Datagram> {
            self.packets.lock().unwrap().iter()
                .map(|(_, buf)| Datagram::try_deser(&mut buf.as_slice()).unwrap())
                .collect()
        }

        fn data_datagrams(&self) -> Vec<Datagram> {
            self.datagrams().into_iter()
                .filter(|d| d.kind() == DatagramKind::Data)
                .collect()
        }
    }

    fn id(creator: u32, seq: u64) -> MessageId {
        MessageId::new(ProcessId(creator), seq)
    }

    fn test_config() -> BroadcastConfig {
        BroadcastConfig {
            retransmit_timeout: Duration::from_millis(100),
            retransmit_tick: Duration::from_millis(50),
            // keep the sampler from interfering with paused-time tests
            window_sample_interval: Duration::from_secs(3600),
            ..BroadcastConfig::new()
        }
    }

    async fn test_link(config: BroadcastConfig, self_id: u32, n: u32, socket: Arc<CapturingSocket>) -> Arc<PerfectLink> {
        let receive_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Arc::new(PerfectLink::new(
            Arc::new(config),
            Arc::new(test_membership(ProcessId(self_id), n)),
            receive_socket,
            socket,
        ).unwrap())
    }

    fn spawn_run(link: &Arc<PerfectLink>, dispatcher: Arc<dyn LinkDispatcher>) {
        let link = link.clone();
        tokio::spawn(async move {
            link.run(dispatcher).await.ok();
        });
    }

    fn ignore_all() -> Arc<dyn LinkDispatcher> {
        let mut dispatcher = MockLinkDispatcher::new();
        dispatcher.expect_on_message().return_const(());
        dispatcher.expect_on_urb_ack().return_const(());
        Arc::new(dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_batches_per_destination() {
        let socket = Arc::new(CapturingSocket::default());
        let link = test_link(test_config(), 1, 3, socket.clone()).await;
        spawn_run(&link, ignore_all());

        for seq in 1..=10 {
            link.send(ProcessId(2), id(1, seq)).await;
        }
        time::sleep(Duration::from_millis(10)).await;

        let sent = socket.data_datagrams();
        assert!(!sent.is_empty());

        let mut sent_entries = Vec::new();
        for datagram in &sent {
            match datagram {
                Datagram::Data { sender, entries } => {
                    assert_eq!(*sender, ProcessId(1));
                    assert!(entries.len() <= 8);
                    sent_entries.extend_from_slice(entries);
                }
                _ => panic!("expected DATA"),
            }
        }
        sent_entries.sort();
        sent_entries.dedup();
        assert_eq!(sent_entries, (1..=10).map(|seq| id(1, seq)).collect::<Vec<_>>());

        assert_eq!(link.shared.lock().await.pending.in_flight_data(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmits_until_acked() {
        let socket = Arc::new(CapturingSocket::default());
        let link = test_link(test_config(), 1, 3, socket.clone()).await;
        spawn_run(&link, ignore_all());

        link.send(ProcessId(2), id(1, 1)).await;
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(socket.data_datagrams().len(), 1);

        // unacked - keeps being re-sent
        time::sleep(Duration::from_millis(250)).await;
        let num_sent = socket.data_datagrams().len();
        assert!(num_sent >= 2, "expected retransmissions, got {}", num_sent);
        assert!(socket.data_datagrams().iter().all(|d| d == &socket.data_datagrams()[0]));

        // the ack removes the pending entry and stops retransmission
        link.on_datagram(&ignore_all(), Datagram::LinkAck {
            sender: ProcessId(2),
            acked_kind: DatagramKind::Data,
            entries: vec![id(1, 1)],
        }).await;
        assert_eq!(link.shared.lock().await.pending.in_flight_data(), 0);

        let num_sent = socket.data_datagrams().len();
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(socket.data_datagrams().len(), num_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_data_is_deduplicated_but_always_acked() {
        let socket = Arc::new(CapturingSocket::default());
        let link = test_link(test_config(), 2, 3, socket.clone()).await;

        let mut dispatcher = MockLinkDispatcher::new();
        dispatcher.expect_on_message()
            .withf(|msg| msg.id == MessageId::new(ProcessId(1), 1) && msg.sender == ProcessId(1))
            .times(1)
            .return_const(());
        let dispatcher: Arc<dyn LinkDispatcher> = Arc::new(dispatcher);

        let data = Datagram::Data { sender: ProcessId(1), entries: vec![id(1, 1)] };
        link.on_datagram(&dispatcher, data.clone()).await;
        link.on_datagram(&dispatcher, data).await;

        // replaying the datagram yields exactly one delivery but an ack every time
        let acks: Vec<Datagram> = socket.datagrams().into_iter()
            .filter(|d| d.kind() == DatagramKind::LinkAck)
            .collect();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[0], Datagram::LinkAck {
            sender: ProcessId(2),
            acked_kind: DatagramKind::Data,
            entries: vec![id(1, 1)],
        });
        assert_eq!(acks[0], acks[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_from_unknown_process_is_dropped() {
        let socket = Arc::new(CapturingSocket::default());
        let link = test_link(test_config(), 2, 3, socket.clone()).await;

        let mut dispatcher = MockLinkDispatcher::new();
        dispatcher.expect_on_message().times(0).return_const(());
        let dispatcher: Arc<dyn LinkDispatcher> = Arc::new(dispatcher);

        link.on_datagram(&dispatcher, Datagram::Data { sender: ProcessId(77), entries: vec![id(77, 1)] }).await;

        assert!(socket.datagrams().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_urb_ack_is_link_acked_and_dispatched() {
        let socket = Arc::new(CapturingSocket::default());
        let link = test_link(test_config(), 2, 3, socket.clone()).await;

        let mut dispatcher = MockLinkDispatcher::new();
        dispatcher.expect_on_urb_ack()
            .withf(|acker, ack_id| *acker == ProcessId(3) && *ack_id == MessageId::new(ProcessId(1), 4))
            .times(1)
            .return_const(());
        let dispatcher: Arc<dyn LinkDispatcher> = Arc::new(dispatcher);

        link.on_datagram(&dispatcher, Datagram::UrbAck { sender: ProcessId(3), id: id(1, 4) }).await;

        assert_eq!(socket.datagrams(), vec![Datagram::LinkAck {
            sender: ProcessId(2),
            acked_kind: DatagramKind::UrbAck,
            entries: vec![id(1, 4)],
        }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sent_urb_ack_is_retransmitted_until_acked() {
        let socket = Arc::new(CapturingSocket::default());
        let link = test_link(test_config(), 1, 3, socket.clone()).await;
        spawn_run(&link, ignore_all());

        link.send_urb_ack(ProcessId(3), id(2, 7)).await;
        time::sleep(Duration::from_millis(250)).await;

        let urb_acks: Vec<Datagram> = socket.datagrams().into_iter()
            .filter(|d| d.kind() == DatagramKind::UrbAck)
            .collect();
        assert!(urb_acks.len() >= 2, "expected URB ack retransmissions, got {}", urb_acks.len());

        link.on_datagram(&ignore_all(), Datagram::LinkAck {
            sender: ProcessId(3),
            acked_kind: DatagramKind::UrbAck,
            entries: vec![id(2, 7)],
        }).await;
        assert!(link.shared.lock().await.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_stalls_drain_until_ack() {
        let socket = Arc::new(CapturingSocket::default());
        let config = BroadcastConfig {
            max_entries_per_packet: 1,
            min_window: 1,
            initial_window: 2,
            max_window: 2,
            ..test_config()
        };
        let link = test_link(config, 1, 2, socket.clone()).await;
        spawn_run(&link, ignore_all());

        for seq in 1..=3 {
            link.send(ProcessId(2), id(1, seq)).await;
        }
        time::sleep(Duration::from_millis(10)).await;

        // window of 2 admits the first two entries, the third has to wait
        assert_eq!(socket.data_datagrams().len(), 2);

        link.on_datagram(&ignore_all(), Datagram::LinkAck {
            sender: ProcessId(2),
            acked_kind: DatagramKind::Data,
            entries: vec![id(1, 1)],
        }).await;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(socket.data_datagrams().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_applies_backpressure_when_queue_is_full() {
        let socket = Arc::new(CapturingSocket::default());
        let config = BroadcastConfig {
            send_queue_capacity: 1,
            ..test_config()
        };
        // no run() - nothing drains the queue
        let link = test_link(config, 1, 2, socket.clone()).await;

        link.send(ProcessId(2), id(1, 1)).await;

        let blocked = time::timeout(Duration::from_millis(100), link.send(ProcessId(2), id(1, 2))).await;
        assert!(blocked.is_err(), "send should block while the queue is full");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_terminates_run() {
        let socket = Arc::new(CapturingSocket::default());
        let link = test_link(test_config(), 1, 2, socket.clone()).await;

        let run_link = link.clone();
        let handle = tokio::spawn(async move {
            run_link.run(ignore_all()).await
        });

        time::sleep(Duration::from_millis(10)).await;
        link.shutdown();

        let result = time::timeout(Duration::from_millis(100), handle).await
            .expect("run did not observe shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
