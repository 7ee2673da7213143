use crate::membership::{Host, Membership, ProcessId};
use std::net::SocketAddr;

/// A membership table with `n` processes on localhost dummy ports. The addresses are
///  never dialed by unit tests - integration tests build their tables from actually
///  bound sockets instead.
pub fn test_membership(self_id: ProcessId, n: u32) -> Membership {
    let hosts = (1..=n)
        .map(|id| Host {
            id: ProcessId(id),
            addr: format!("127.0.0.1:{}", 9000 + id).parse().unwrap(),
        })
        .collect();

    Membership::new(self_id, hosts).unwrap()
}

/// A membership table from explicitly provided addresses, ids assigned `1..=N` in order.
pub fn membership_from_addrs(self_id: ProcessId, addrs: &[SocketAddr]) -> Membership {
    let hosts = addrs.iter()
        .enumerate()
        .map(|(idx, &addr)| Host { id: ProcessId(idx as u32 + 1), addr })
        .collect();

    Membership::new(self_id, hosts).unwrap()
}
