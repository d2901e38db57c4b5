// Peer database interface.
//
// Remote peers are identified by (network id, container IP) and resolve to the
// MAC, address mask, and VTEP needed to program forwarding entries. How those
// tuples arrive from other hosts is outside this crate; the driver only reads.

use std::fmt;
use std::net::Ipv4Addr;

use dashmap::DashMap;

/// A hardware address for a peer's interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

/// What a peer lookup yields: enough to program the neighbor and FDB entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    pub mac: MacAddr,
    /// Mask length of the peer's address on its subnet.
    pub prefix_len: u8,
    /// Host-reachable tunnel endpoint terminating the peer's traffic.
    pub vtep: Ipv4Addr,
}

/// Read access to the distributed peer database.
pub trait PeerDb: Send + Sync {
    /// Resolve a single peer on a network.
    fn resolve(&self, network_id: &str, peer_ip: Ipv4Addr) -> Option<PeerRecord>;

    /// All currently-known peers of a network, for replay into a fresh sandbox.
    fn network_peers(&self, network_id: &str) -> Vec<(Ipv4Addr, PeerRecord)>;
}

/// In-memory peer database.
#[derive(Debug, Default)]
pub struct MemoryPeerDb {
    entries: DashMap<(String, Ipv4Addr), PeerRecord>,
}

impl MemoryPeerDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, network_id: &str, peer_ip: Ipv4Addr, record: PeerRecord) {
        self.entries.insert((network_id.to_string(), peer_ip), record);
    }

    pub fn remove(&self, network_id: &str, peer_ip: Ipv4Addr) {
        self.entries.remove(&(network_id.to_string(), peer_ip));
    }
}

impl PeerDb for MemoryPeerDb {
    fn resolve(&self, network_id: &str, peer_ip: Ipv4Addr) -> Option<PeerRecord> {
        self.entries
            .get(&(network_id.to_string(), peer_ip))
            .map(|e| *e.value())
    }

    fn network_peers(&self, network_id: &str) -> Vec<(Ipv4Addr, PeerRecord)> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == network_id)
            .map(|e| (e.key().1, *e.value()))
            .collect()
    }
}
