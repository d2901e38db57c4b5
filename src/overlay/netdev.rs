// Kernel device operations for the overlay data plane.
//
// One persistent rtnetlink handle per driver, reused for every vxlan
// create/delete, the host-mode probe move, and the host route dump.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::path::Path;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;

use crate::overlay::error::{OverlayError, OverlayResult};

/// Device-level operations the driver needs from the host kernel.
#[async_trait]
pub trait DeviceOps: Send + Sync {
    /// Create a vxlan device carrying the given VNI on the given UDP port.
    async fn create_vxlan(&self, name: &str, vni: u32, port: u16) -> OverlayResult<()>;

    /// Delete a vxlan device by name.
    async fn delete_vxlan(&self, name: &str) -> OverlayResult<()>;

    /// Move a link into the network namespace behind `ns_fd`.
    async fn move_link_to_ns(&self, name: &str, ns_fd: RawFd) -> OverlayResult<()>;

    /// IPv4 destinations of the host's current routing table.
    async fn host_routes(&self) -> OverlayResult<Vec<Ipv4Net>>;

    /// Nameserver addresses configured on the host.
    fn nameservers(&self) -> Vec<Ipv4Addr>;
}

/// Persistent netlink handle wrapping rtnetlink for all device operations.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> OverlayResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    async fn link_index(&self, name: &str) -> OverlayResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(OverlayError::Netlink(format!("link {} not found", name))),
            Err(e) => Err(OverlayError::Netlink(format!(
                "failed to get link {}: {}",
                name, e
            ))),
        }
    }
}

#[async_trait]
impl DeviceOps for NetlinkHandle {
    async fn create_vxlan(&self, name: &str, vni: u32, port: u16) -> OverlayResult<()> {
        self.handle
            .link()
            .add()
            .vxlan(name.to_string(), vni)
            .port(port)
            .learning(true)
            .proxy(true)
            .l2miss(true)
            .l3miss(true)
            .execute()
            .await
            .map_err(|e| OverlayError::Netlink(format!("error creating vxlan interface: {}", e)))
    }

    async fn delete_vxlan(&self, name: &str) -> OverlayResult<()> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| OverlayError::Netlink(format!("error deleting vxlan {}: {}", name, e)))
    }

    async fn move_link_to_ns(&self, name: &str, ns_fd: RawFd) -> OverlayResult<()> {
        let index = self.link_index(name).await?;
        self.handle
            .link()
            .set(index)
            .setns_by_fd(ns_fd)
            .execute()
            .await
            .map_err(|e| {
                OverlayError::Netlink(format!("failed to move {} to namespace: {}", name, e))
            })
    }

    async fn host_routes(&self) -> OverlayResult<Vec<Ipv4Net>> {
        use netlink_packet_route_rtnl::route::{RouteAddress, RouteAttribute};

        let mut routes = self
            .handle
            .route()
            .get(rtnetlink::IpVersion::V4)
            .execute();

        let mut out = Vec::new();
        while let Some(route) = routes
            .try_next()
            .await
            .map_err(|e| OverlayError::Netlink(format!("route dump failed: {}", e)))?
        {
            let prefix_len = route.header.destination_prefix_length;
            for attr in &route.attributes {
                if let RouteAttribute::Destination(RouteAddress::Inet(dst)) = attr {
                    if let Ok(net) = Ipv4Net::new(*dst, prefix_len) {
                        out.push(net);
                    }
                }
            }
        }
        Ok(out)
    }

    fn nameservers(&self) -> Vec<Ipv4Addr> {
        read_nameservers(Path::new("/etc/resolv.conf"))
    }
}

/// Parse nameserver addresses out of a resolv.conf.
pub(crate) fn read_nameservers(path: &Path) -> Vec<Ipv4Addr> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("nameserver")?;
            rest.trim().parse::<Ipv4Addr>().ok()
        })
        .collect()
}
