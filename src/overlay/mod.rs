//! Overlay driver core.
//!
//! The driver owns the id -> [`Network`] registry, backed through to the
//! datastore on miss, and exposes the network lifecycle consumed by the
//! plugin glue: create/delete, endpoint join/leave, and peer programming.

pub mod config;
pub mod error;
pub(crate) mod filters;
pub(crate) mod guard;
pub mod host_mode;
pub mod netdev;
pub mod network;
pub mod peerdb;
pub mod vni;
pub(crate) mod watcher;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;
use ipnet::Ipv4Net;

use self::error::{OverlayError, OverlayResult};
use self::netdev::{DeviceOps, NetlinkHandle};
use self::network::{DriverCtx, Network};
use self::peerdb::{PeerDb, PeerRecord};
use self::vni::VniAllocator;

use crate::sandbox::SandboxFactory;
use crate::store::Datastore;

/// Default VXLAN UDP port (IANA).
pub const DEFAULT_VXLAN_PORT: u16 = 4789;

/// Driver-level tunables.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// UDP port the vxlan devices are created with.
    pub vxlan_port: u16,
}

impl OverlayConfig {
    /// Read configuration from the environment, falling back to defaults.
    ///
    /// - `WEFT_VXLAN_PORT`: vxlan UDP port (default: 4789)
    pub fn from_env() -> Self {
        let vxlan_port = std::env::var("WEFT_VXLAN_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_VXLAN_PORT);
        OverlayConfig { vxlan_port }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig {
            vxlan_port: DEFAULT_VXLAN_PORT,
        }
    }
}

/// One address pool handed to the driver by IPAM.
#[derive(Debug, Clone, Copy)]
pub struct IpamData {
    pub pool: Ipv4Net,
    pub gateway: Ipv4Net,
}

/// The overlay network driver.
pub struct OverlayDriver {
    networks: DashMap<String, Arc<Network>>,
    ctx: Arc<DriverCtx>,
}

impl OverlayDriver {
    /// Build a driver against the real kernel, with environment defaults.
    pub fn new(
        store: Option<Arc<dyn Datastore>>,
        peerdb: Arc<dyn PeerDb>,
        sandboxes: Arc<dyn SandboxFactory>,
    ) -> OverlayResult<Self> {
        let devices: Arc<dyn DeviceOps> = Arc::new(NetlinkHandle::new()?);
        Ok(Self::with_parts(
            store,
            peerdb,
            sandboxes,
            devices,
            Arc::new(VniAllocator::new()),
            host_mode::process_cell(),
            OverlayConfig::from_env(),
        ))
    }

    /// Build a driver from explicit parts. Lets embedders (and tests) swap the
    /// device layer, share a VNI allocator, or scope the host-mode decision.
    pub fn with_parts(
        store: Option<Arc<dyn Datastore>>,
        peerdb: Arc<dyn PeerDb>,
        sandboxes: Arc<dyn SandboxFactory>,
        devices: Arc<dyn DeviceOps>,
        vni_allocator: Arc<VniAllocator>,
        host_mode: Arc<tokio::sync::OnceCell<bool>>,
        config: OverlayConfig,
    ) -> Self {
        OverlayDriver {
            networks: DashMap::new(),
            ctx: Arc::new(DriverCtx {
                store,
                peerdb,
                sandboxes,
                devices,
                vni_allocator,
                host_mode,
                config,
            }),
        }
    }

    // ── Network lifecycle ─────────────────────────────────────────────

    /// Create a network from IPAM pool data and persist it. Registration only
    /// happens after the store write succeeds.
    pub async fn create_network(
        &self,
        id: &str,
        options: &HashMap<String, String>,
        ipv4_data: &[IpamData],
        _ipv6_data: &[IpamData],
    ) -> OverlayResult<()> {
        if id.is_empty() {
            return Err(OverlayError::InvalidArgument("invalid network id".into()));
        }

        let network = Arc::new(Network::new(id, self.ctx.clone()));
        network.parse_options(options);
        for ipam in ipv4_data {
            network.add_subnet(ipam.pool, ipam.gateway);
        }

        network.write_to_store().await.map_err(|e| {
            OverlayError::Internal(format!(
                "failed to update data store for network {}: {}",
                id, e
            ))
        })?;

        self.networks.insert(id.to_string(), network);
        Ok(())
    }

    /// Delete a network: deregister, release its VNIs, remove the persisted
    /// entry. A concurrent delete on another host is treated as success.
    pub async fn delete_network(&self, id: &str) -> OverlayResult<()> {
        if id.is_empty() {
            return Err(OverlayError::InvalidArgument("invalid network id".into()));
        }

        let network = self
            .network(id)
            .await
            .ok_or_else(|| OverlayError::NotFound(id.to_string()))?;

        self.networks.remove(id);
        network.release_vxlan_id().await
    }

    /// Look a network up, hydrating from the store on registry miss. Two
    /// racing hydrators both succeed; the first insert wins and both callers
    /// get it.
    pub async fn network(&self, id: &str) -> Option<Arc<Network>> {
        if let Some(existing) = self.networks.get(id) {
            return Some(existing.value().clone());
        }

        let hydrated = self.network_from_store(id).await?;
        let entry = self.networks.entry(id.to_string()).or_insert(hydrated);
        Some(entry.value().clone())
    }

    async fn network_from_store(&self, id: &str) -> Option<Arc<Network>> {
        let store = self.ctx.store.clone()?;
        let network = Arc::new(Network::new(id, self.ctx.clone()));
        let key = crate::store::KvObject::key(network.as_ref());
        store.get_object(&key, network.as_ref()).await.ok()?;
        Some(network)
    }

    // ── Endpoint hooks ────────────────────────────────────────────────

    /// Join an endpoint with the given address onto its network. The join
    /// count is taken before sandbox and subnet bring-up; a failed bring-up
    /// unwinds through the leave path, which rearms the init guards and tears
    /// down whatever was installed so a later join can retry.
    pub async fn join_endpoint(&self, id: &str, ep_address: Ipv4Net) -> OverlayResult<()> {
        let network = self
            .network(id)
            .await
            .ok_or_else(|| OverlayError::NotFound(id.to_string()))?;

        let subnet_ip = network.subnet_for_ip(&ep_address).ok_or_else(|| {
            OverlayError::InvalidArgument(format!(
                "could not find subnet for endpoint {} on network {}",
                ep_address, id
            ))
        })?;

        network.inc_endpoint_count();

        let brought_up = async {
            network.join_sandbox().await?;
            network.join_subnet_sandbox(subnet_ip).await
        }
        .await;

        if let Err(e) = brought_up {
            network.leave_sandbox().await;
            return Err(e);
        }
        Ok(())
    }

    /// Leave hook: drop one endpoint, destroying the sandbox on the last one.
    pub async fn leave_endpoint(&self, id: &str) -> OverlayResult<()> {
        let network = self
            .network(id)
            .await
            .ok_or_else(|| OverlayError::NotFound(id.to_string()))?;
        network.leave_sandbox().await;
        Ok(())
    }

    /// Program a peer that arrived from another host.
    pub async fn peer_add(
        &self,
        id: &str,
        peer_ip: Ipv4Addr,
        record: PeerRecord,
    ) -> OverlayResult<()> {
        let network = self
            .network(id)
            .await
            .ok_or_else(|| OverlayError::NotFound(id.to_string()))?;
        network.peer_add(peer_ip, &record, false).await
    }
}
