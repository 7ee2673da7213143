use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use rustc_hash::FxHashMap;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

/// Statically assigned process identifier in `1..=N`. Process ids are the unit of
///  addressing throughout the protocol - socket addresses appear only at the very edge,
///  when a datagram is actually sent.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ProcessId(pub u32);

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ProcessId {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_varint(self.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ProcessId> {
        Ok(ProcessId(buf.try_get_u32_varint()?))
    }
}

/// One row of the static membership table.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct Host {
    pub id: ProcessId,
    pub addr: SocketAddr,
}

/// The static group: process id -> network address, loaded once at startup and immutable
///  afterwards. There is no join / leave protocol - all processes know the full table
///  before any of them sends a datagram.
#[derive(Debug)]
pub struct Membership {
    self_id: ProcessId,
    hosts: FxHashMap<ProcessId, Host>,
}

impl Membership {
    pub fn new(self_id: ProcessId, hosts: Vec<Host>) -> anyhow::Result<Membership> {
        if hosts.is_empty() {
            bail!("membership table is empty");
        }

        let mut by_id = FxHashMap::default();
        for host in hosts {
            if host.id.0 == 0 {
                bail!("process id 0 is reserved");
            }
            if by_id.insert(host.id, host).is_some() {
                bail!("duplicate process id {} in membership table", host.id);
            }
        }
        if !by_id.contains_key(&self_id) {
            bail!("own process id {} is not part of the membership table", self_id);
        }

        Ok(Membership { self_id, hosts: by_id })
    }

    pub fn self_id(&self) -> ProcessId {
        self.self_id
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.hosts[&self.self_id].addr
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The number of distinct acknowledgers required before a broadcast may be delivered.
    ///
    /// This is a *strict* majority: for odd N it coincides with `ceil(N/2)`, for even N it
    ///  is one more. With exactly half, two disjoint halves of the group could each reach
    ///  'quorum' independently, which would break uniform agreement - so the stricter
    ///  threshold is used for even group sizes.
    pub fn quorum_size(&self) -> usize {
        self.hosts.len() / 2 + 1
    }

    pub fn addr_of(&self, id: ProcessId) -> Option<SocketAddr> {
        self.hosts.get(&id).map(|h| h.addr)
    }

    pub fn contains(&self, id: ProcessId) -> bool {
        self.hosts.contains_key(&id)
    }

    /// All process ids except our own, in ascending order. The order does not matter for
    ///  correctness, but a stable iteration order makes logs and tests deterministic.
    pub fn peers(&self) -> Vec<ProcessId> {
        let mut result: Vec<ProcessId> = self.hosts.keys()
            .filter(|&&id| id != self.self_id)
            .cloned()
            .collect();
        result.sort();
        result
    }

    pub fn all(&self) -> Vec<ProcessId> {
        let mut result: Vec<ProcessId> = self.hosts.keys().cloned().collect();
        result.sort();
        result
    }
}
