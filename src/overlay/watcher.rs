// Neighbor-miss watcher.
//
// The vxlan devices are created with l2miss/l3miss, so the kernel emits
// RTM_GETNEIGH notifications when it lacks forwarding state for a destination.
// The watcher subscribes to the neighbor group from inside the sandbox,
// resolves unknown IPv4 peers against the peer database, and programs the
// corresponding forwarding entries. The whole subsystem is best effort:
// failures are logged and the loop keeps running until cancellation.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::neighbour::nlas::Nla;
use netlink_packet_route::{NeighbourMessage, RtnlMessage, NUD_INCOMPLETE, NUD_STALE};
use netlink_sys::protocols::NETLINK_ROUTE;
use netlink_sys::{AsyncSocket, SocketAddr, TokioSocket};
use tokio_util::sync::CancellationToken;

use crate::overlay::network::Network;

/// rtnetlink multicast group for neighbor table events.
const RTMGRP_NEIGH: u32 = 4;

/// Open a NETLINK_ROUTE socket subscribed to neighbor events. Must run with
/// the target namespace current (the caller invokes it inside the sandbox).
pub(crate) fn subscribe_neigh() -> std::io::Result<TokioSocket> {
    let mut socket = TokioSocket::new(NETLINK_ROUTE)?;
    socket.socket_mut().bind(&SocketAddr::new(0, RTMGRP_NEIGH))?;
    Ok(socket)
}

/// Receive loop. Runs until the cancellation token fires (sandbox teardown
/// closes the socket by dropping it).
pub(crate) async fn watch_miss(
    network: Arc<Network>,
    mut socket: TokioSocket,
    cancel: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            _ = cancel.cancelled() => break,
            received = recv(&mut socket) => match received {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(network = %network.id(), "failed to receive from netlink: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        for peer_ip in miss_candidates(&datagram) {
            let record = match network.resolve_peer(peer_ip) {
                Some(record) => record,
                None => {
                    tracing::error!(
                        network = %network.id(),
                        "could not resolve peer {}",
                        peer_ip
                    );
                    continue;
                }
            };

            if let Err(e) = network.peer_add(peer_ip, &record, true).await {
                tracing::error!(
                    network = %network.id(),
                    "could not add neighbor entry for missed peer {}: {}",
                    peer_ip,
                    e
                );
            }
        }
    }

    tracing::debug!(network = %network.id(), "neighbor watcher stopped");
}

async fn recv(socket: &mut TokioSocket) -> std::io::Result<Vec<u8>> {
    let (data, _addr) = futures::future::poll_fn(|cx| socket.poll_recv_from_full(cx)).await?;
    Ok(data)
}

/// Extract the IPv4 addresses worth resolving from a raw netlink datagram:
/// neighbor messages whose state includes STALE or INCOMPLETE and whose
/// destination has an IPv4 form.
pub(crate) fn miss_candidates(data: &[u8]) -> Vec<Ipv4Addr> {
    let mut candidates = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let message = match NetlinkMessage::<RtnlMessage>::deserialize(&data[offset..]) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("failed to deserialize netlink message: {}", e);
                break;
            }
        };

        if let NetlinkPayload::InnerMessage(
            RtnlMessage::NewNeighbour(neigh) | RtnlMessage::GetNeighbour(neigh),
        ) = &message.payload
        {
            if let Some(ip) = unresolved_ipv4(neigh) {
                candidates.push(ip);
            }
        }

        let length = message.header.length as usize;
        if length == 0 {
            break;
        }
        offset += length;
    }

    candidates
}

fn unresolved_ipv4(neigh: &NeighbourMessage) -> Option<Ipv4Addr> {
    if neigh.header.state & (NUD_STALE | NUD_INCOMPLETE) == 0 {
        return None;
    }
    neigh.nlas.iter().find_map(|nla| match nla {
        Nla::Destination(bytes) => ipv4_destination(bytes),
        _ => None,
    })
}

/// IPv4 form of a neighbor destination. Plain 4-byte addresses pass through;
/// 16-byte addresses only when IPv4-mapped. IPv6-only destinations are out of
/// scope for miss handling.
fn ipv4_destination(bytes: &[u8]) -> Option<Ipv4Addr> {
    match bytes.len() {
        4 => Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Ipv6Addr::from(octets).to_ipv4_mapped()
        }
        _ => None,
    }
}
