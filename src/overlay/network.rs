// Network and subnet lifecycle.
//
// A Network aggregates its subnets, a sandbox handle, a join count, and the
// one-shot init guards. The sandbox is brought up lazily on the first join and
// torn down on the last leave; each subnet's bridge/vxlan pair is brought up
// lazily on the first join that touches it. A single mutex guards the mutable
// state; anything that talks to the sandbox, the kernel, or the store runs
// with the lock released.

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::overlay::config::{self, NetworkConfig, SubnetConfig};
use crate::overlay::error::{OverlayError, OverlayResult};
use crate::overlay::guard::InitGuard;
use crate::overlay::netdev::DeviceOps;
use crate::overlay::peerdb::{PeerDb, PeerRecord};
use crate::overlay::{filters, host_mode, watcher, OverlayConfig};
use crate::sandbox::{IfaceOptions, Sandbox, SandboxError, SandboxFactory};
use crate::store::{Datastore, KvObject, StoreError};
use crate::overlay::vni::VniAllocator;

/// Everything a network needs from its driver.
pub(crate) struct DriverCtx {
    pub(crate) store: Option<Arc<dyn Datastore>>,
    pub(crate) peerdb: Arc<dyn PeerDb>,
    pub(crate) sandboxes: Arc<dyn SandboxFactory>,
    pub(crate) devices: Arc<dyn DeviceOps>,
    pub(crate) vni_allocator: Arc<VniAllocator>,
    pub(crate) host_mode: Arc<tokio::sync::OnceCell<bool>>,
    pub(crate) config: OverlayConfig,
}

pub(crate) struct Subnet {
    pub(crate) subnet_ip: Ipv4Net,
    pub(crate) gw_ip: Ipv4Net,
    pub(crate) vni: u32,
    pub(crate) vxlan_name: String,
    pub(crate) br_name: String,
    pub(crate) guard: Arc<InitGuard>,
}

impl Subnet {
    fn new(subnet_ip: Ipv4Net, gw_ip: Ipv4Net, vni: u32) -> Self {
        Subnet {
            subnet_ip,
            gw_ip,
            vni,
            vxlan_name: String::new(),
            br_name: String::new(),
            guard: Arc::new(InitGuard::new()),
        }
    }
}

struct WatcherHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

struct NetworkState {
    subnets: Vec<Subnet>,
    disable_default_gw: bool,
    sandbox: Option<Arc<dyn Sandbox>>,
    join_cnt: u64,
    init_epoch: u64,
    guard: Arc<InitGuard>,
    watcher: Option<WatcherHandle>,
    db_index: u64,
    db_exists: bool,
}

/// One overlay network: an L2 segment per subnet, tunneled between hosts.
pub struct Network {
    id: String,
    ctx: Arc<DriverCtx>,
    state: Mutex<NetworkState>,
}

impl Network {
    pub(crate) fn new(id: &str, ctx: Arc<DriverCtx>) -> Self {
        Network {
            id: id.to_string(),
            ctx,
            state: Mutex::new(NetworkState {
                subnets: Vec::new(),
                disable_default_gw: false,
                sandbox: None,
                join_cnt: 0,
                init_epoch: 0,
                guard: Arc::new(InitGuard::new()),
                watcher: None,
                db_index: 0,
                db_exists: false,
            }),
        }
    }

    pub(crate) fn parse_options(&self, options: &HashMap<String, String>) {
        if options.contains_key("disableDefaultGW") {
            self.state.lock().disable_default_gw = true;
        }
    }

    pub(crate) fn add_subnet(&self, pool: Ipv4Net, gateway: Ipv4Net) {
        self.state
            .lock()
            .subnets
            .push(Subnet::new(pool, gateway, 0));
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn join_count(&self) -> u64 {
        self.state.lock().join_cnt
    }

    pub fn has_sandbox(&self) -> bool {
        self.state.lock().sandbox.is_some()
    }

    pub fn disable_default_gw(&self) -> bool {
        self.state.lock().disable_default_gw
    }

    pub fn subnet_ips(&self) -> Vec<Ipv4Net> {
        self.state.lock().subnets.iter().map(|s| s.subnet_ip).collect()
    }

    /// Subnet containing `ip`: same mask length, and the subnet's range covers
    /// the address.
    pub fn subnet_for_ip(&self, ip: &Ipv4Net) -> Option<Ipv4Net> {
        self.state
            .lock()
            .subnets
            .iter()
            .find(|s| {
                s.subnet_ip.prefix_len() == ip.prefix_len() && s.subnet_ip.contains(&ip.addr())
            })
            .map(|s| s.subnet_ip)
    }

    /// Subnet whose network address and mask length both equal `ip`'s.
    pub fn matching_subnet(&self, ip: &Ipv4Net) -> Option<Ipv4Net> {
        self.state
            .lock()
            .subnets
            .iter()
            .find(|s| {
                s.subnet_ip.prefix_len() == ip.prefix_len() && s.subnet_ip.addr() == ip.addr()
            })
            .map(|s| s.subnet_ip)
    }

    /// Current VNI of a subnet.
    pub fn vxlan_id(&self, subnet_ip: &Ipv4Net) -> OverlayResult<u32> {
        let state = self.state.lock();
        state
            .subnets
            .iter()
            .find(|s| s.subnet_ip == *subnet_ip)
            .map(|s| s.vni)
            .ok_or_else(|| {
                OverlayError::Internal(format!(
                    "network {} has no subnet {}",
                    self.id, subnet_ip
                ))
            })
    }

    fn set_vxlan_id(&self, subnet_ip: &Ipv4Net, vni: u32) {
        let mut state = self.state.lock();
        if let Some(s) = state.subnets.iter_mut().find(|s| s.subnet_ip == *subnet_ip) {
            s.vni = vni;
        }
    }

    /// Kernel device names recorded for a subnet, for teardown and tests.
    pub fn subnet_device_names(&self, subnet_ip: &Ipv4Net) -> Option<(String, String)> {
        self.state
            .lock()
            .subnets
            .iter()
            .find(|s| s.subnet_ip == *subnet_ip)
            .map(|s| (s.br_name.clone(), s.vxlan_name.clone()))
    }

    /// First `len` bytes of the id, backed off to a char boundary. Ids are
    /// opaque strings and may contain multi-byte characters.
    fn id_prefix(&self, len: usize) -> &str {
        let mut end = self.id.len().min(len);
        while !self.id.is_char_boundary(end) {
            end -= 1;
        }
        &self.id[..end]
    }

    async fn host_mode(&self) -> bool {
        host_mode::host_mode(
            &self.ctx.host_mode,
            &self.ctx.devices,
            self.ctx.config.vxlan_port,
        )
        .await
    }

    // ── Join / leave ──────────────────────────────────────────────────

    pub fn inc_endpoint_count(&self) {
        self.state.lock().join_cnt += 1;
    }

    /// Bring the network sandbox up, once per join epoch. Every concurrent
    /// caller observes the outcome of the single initialization attempt.
    pub async fn join_sandbox(self: &Arc<Self>) -> OverlayResult<()> {
        let guard = self.state.lock().guard.clone();
        guard.run_once(|| self.init_sandbox()).await
    }

    /// Bring a subnet's bridge/vxlan pair up, once per join epoch.
    pub async fn join_subnet_sandbox(self: &Arc<Self>, subnet_ip: Ipv4Net) -> OverlayResult<()> {
        let guard = {
            let state = self.state.lock();
            state
                .subnets
                .iter()
                .find(|s| s.subnet_ip == subnet_ip)
                .map(|s| s.guard.clone())
                .ok_or_else(|| {
                    OverlayError::Internal(format!(
                        "network {} has no subnet {}",
                        self.id, subnet_ip
                    ))
                })?
        };
        guard
            .run_once(|| self.init_subnet_sandbox(subnet_ip))
            .await
    }

    /// Drop one endpoint. The last leave rearms every init guard and then
    /// destroys the sandbox; the reset must come first so a later joiner never
    /// sees a satisfied guard pointing at a destroyed sandbox.
    pub async fn leave_sandbox(&self) {
        {
            let mut state = self.state.lock();
            if state.join_cnt == 0 {
                tracing::warn!(network = %self.id, "leave without a matching join");
                return;
            }
            state.join_cnt -= 1;
            if state.join_cnt != 0 {
                return;
            }

            state.guard.reset();
            for subnet in &state.subnets {
                subnet.guard.reset();
            }
        }

        self.destroy_sandbox().await;
    }

    // ── Sandbox bring-up ──────────────────────────────────────────────

    async fn init_sandbox(self: &Arc<Self>) -> OverlayResult<()> {
        let epoch = {
            let mut state = self.state.lock();
            state.init_epoch += 1;
            state.init_epoch
        };

        let host_mode = self.host_mode().await;
        if host_mode {
            filters::add_network_chain(self.id_prefix(12)).await?;
        }

        let key = format!("{}-{}", epoch, self.id);
        let sandbox = self
            .ctx
            .sandboxes
            .new_sandbox(&key, !host_mode)
            .await
            .map_err(|e| {
                OverlayError::Sandbox(SandboxError(format!(
                    "could not create network sandbox: {}",
                    e
                )))
            })?;

        self.state.lock().sandbox = Some(sandbox.clone());

        // Replay peers learned while this host had no sandbox.
        self.peer_db_update_sandbox().await;

        // Subscribe to neighbor events from inside the sandbox so misses on
        // the overlay devices reach us.
        let slot: Arc<Mutex<Option<std::io::Result<netlink_sys::TokioSocket>>>> =
            Arc::new(Mutex::new(None));
        let slot_in = slot.clone();
        sandbox.invoke(Box::new(move || {
            *slot_in.lock() = Some(watcher::subscribe_neigh());
        }))?;

        let socket = slot
            .lock()
            .take()
            .ok_or_else(|| {
                OverlayError::Internal("sandbox invoke did not run the subscription".into())
            })?
            .map_err(|e| {
                OverlayError::Netlink(format!(
                    "failed to subscribe to neighbor group netlink messages: {}",
                    e
                ))
            })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher::watch_miss(
            self.clone(),
            socket,
            cancel.clone(),
        ));
        self.state.lock().watcher = Some(WatcherHandle { cancel, task });

        Ok(())
    }

    async fn init_subnet_sandbox(self: &Arc<Self>, subnet_ip: Ipv4Net) -> OverlayResult<()> {
        self.obtain_vxlan_id(subnet_ip).await?;

        let host_mode = self.host_mode().await;
        if host_mode && self.subnet_conflicts_with_host(&subnet_ip).await {
            return Err(OverlayError::Conflict(format!(
                "overlay subnet {} has conflicts in the host while running in host mode",
                subnet_ip
            )));
        }

        let vni = self.vxlan_id(&subnet_ip)?;
        let br_name = format!("ov-{:06x}-{}", vni, self.id_prefix(5));
        let vxlan_name = format!("vx-{:06x}-{}", vni, self.id_prefix(5));

        let (sandbox, gw_ip) = {
            let state = self.state.lock();
            let sandbox = state.sandbox.clone().ok_or_else(|| {
                OverlayError::Internal(format!("network {} has no sandbox", self.id))
            })?;
            let gw_ip = state
                .subnets
                .iter()
                .find(|s| s.subnet_ip == subnet_ip)
                .map(|s| s.gw_ip)
                .ok_or_else(|| {
                    OverlayError::Internal(format!(
                        "network {} has no subnet {}",
                        self.id, subnet_ip
                    ))
                })?;
            (sandbox, gw_ip)
        };

        sandbox
            .add_interface(
                &br_name,
                "br",
                IfaceOptions::new().address(gw_ip).bridge(true),
            )
            .await
            .map_err(|e| {
                OverlayError::Sandbox(SandboxError(format!(
                    "bridge creation in sandbox failed for subnet {}: {}",
                    subnet_ip, e
                )))
            })?;

        // A stale device of the same name may survive an unclean shutdown.
        let _ = self.ctx.devices.delete_vxlan(&vxlan_name).await;

        self.ctx
            .devices
            .create_vxlan(&vxlan_name, vni, self.ctx.config.vxlan_port)
            .await?;

        sandbox
            .add_interface(&vxlan_name, "vxlan", IfaceOptions::new().master(&br_name))
            .await
            .map_err(|e| {
                OverlayError::Sandbox(SandboxError(format!(
                    "vxlan interface creation failed for subnet {}: {}",
                    subnet_ip, e
                )))
            })?;

        if host_mode {
            filters::add_filters(self.id_prefix(12), &br_name).await?;
        }

        {
            let mut state = self.state.lock();
            if let Some(s) = state.subnets.iter_mut().find(|s| s.subnet_ip == subnet_ip) {
                s.vxlan_name = vxlan_name;
                s.br_name = br_name;
            }
        }

        Ok(())
    }

    async fn subnet_conflicts_with_host(&self, subnet_ip: &Ipv4Net) -> bool {
        let nameservers = self.ctx.devices.nameservers();
        if nameservers.iter().any(|ns| subnet_ip.contains(ns)) {
            return true;
        }

        let routes = match self.ctx.devices.host_routes().await {
            Ok(routes) => routes,
            Err(e) => {
                tracing::warn!(network = %self.id, "could not list host routes: {}", e);
                Vec::new()
            }
        };
        routes.iter().any(|route| {
            route.contains(&subnet_ip.network()) || subnet_ip.contains(&route.network())
        })
    }

    /// Tear down the sandbox and every device the network created in it.
    pub(crate) async fn destroy_sandbox(&self) {
        let (sandbox, watcher, subnet_devices) = {
            let mut state = self.state.lock();
            let subnet_devices: Vec<(String, String)> = state
                .subnets
                .iter()
                .map(|s| (s.br_name.clone(), s.vxlan_name.clone()))
                .collect();
            (state.sandbox.clone(), state.watcher.take(), subnet_devices)
        };

        let Some(sandbox) = sandbox else { return };

        if let Some(watcher) = watcher {
            watcher.cancel.cancel();
            let _ = watcher.task.await;
        }

        for name in sandbox.interface_names().await {
            if let Err(e) = sandbox.remove_interface(&name).await {
                tracing::warn!(network = %self.id, "could not remove interface {}: {}", name, e);
            }
        }

        let host_mode = self.ctx.host_mode.get().copied().unwrap_or(false);
        for (br_name, vxlan_name) in &subnet_devices {
            if host_mode && !br_name.is_empty() {
                if let Err(e) = filters::remove_filters(self.id_prefix(12), br_name).await {
                    tracing::warn!(network = %self.id, "could not remove overlay filters: {}", e);
                }
            }
            if !vxlan_name.is_empty() {
                if let Err(e) = self.ctx.devices.delete_vxlan(vxlan_name).await {
                    tracing::warn!(network = %self.id, "could not cleanup sandbox properly: {}", e);
                }
            }
        }

        if host_mode {
            if let Err(e) = filters::remove_network_chain(self.id_prefix(12)).await {
                tracing::warn!(network = %self.id, "could not remove network chain: {}", e);
            }
        }

        if let Err(e) = sandbox.destroy().await {
            tracing::warn!(network = %self.id, "sandbox destroy failed: {}", e);
        }
        self.state.lock().sandbox = None;
    }

    // ── VNI allocation against the store ──────────────────────────────

    /// Settle the subnet's VNI against the shared store. Loops on CAS
    /// conflicts: a lost race releases our candidate id and adopts the
    /// winner's value on re-read.
    pub async fn obtain_vxlan_id(&self, subnet_ip: Ipv4Net) -> OverlayResult<()> {
        if self.vxlan_id(&subnet_ip)? != 0 {
            return Ok(());
        }

        let store = self.ctx.store.clone().ok_or_else(|| {
            OverlayError::Internal("no datastore configured, cannot obtain vxlan id".into())
        })?;

        loop {
            let key = KvObject::key(self);
            store.get_object(&key, self).await.map_err(|e| {
                OverlayError::Internal(format!(
                    "getting network {} from datastore failed: {}",
                    self.id, e
                ))
            })?;

            if self.vxlan_id(&subnet_ip)? != 0 {
                return Ok(());
            }

            let vni = self.ctx.vni_allocator.get_id()?;
            self.set_vxlan_id(&subnet_ip, vni);

            match self.write_to_store().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.ctx.vni_allocator.release(vni);
                    self.set_vxlan_id(&subnet_ip, 0);
                    if matches!(e, OverlayError::Store(StoreError::KeyModified)) {
                        continue;
                    }
                    return Err(OverlayError::Internal(format!(
                        "network {} failed to update data store: {}",
                        self.id, e
                    )));
                }
            }
        }
    }

    /// Delete the persisted entry and hand every VNI back to the allocator.
    /// A concurrent delete by another host counts as success.
    pub(crate) async fn release_vxlan_id(&self) -> OverlayResult<()> {
        let Some(store) = self.ctx.store.clone() else {
            return Ok(());
        };
        if self.state.lock().subnets.is_empty() {
            return Ok(());
        }

        match store.delete_object_atomic(self).await {
            Ok(()) => {}
            Err(StoreError::KeyModified) | Err(StoreError::KeyNotFound) => {
                // Another instance already removed the key.
            }
            Err(e) => {
                return Err(OverlayError::Internal(format!(
                    "failed to delete network to vxlan id map: {}",
                    e
                )));
            }
        }

        let vnis: Vec<(Ipv4Net, u32)> = {
            let state = self.state.lock();
            state.subnets.iter().map(|s| (s.subnet_ip, s.vni)).collect()
        };
        for (subnet_ip, vni) in vnis {
            self.ctx.vni_allocator.release(vni);
            self.set_vxlan_id(&subnet_ip, 0);
        }
        Ok(())
    }

    pub(crate) async fn write_to_store(&self) -> OverlayResult<()> {
        match &self.ctx.store {
            Some(store) => Ok(store.put_object_atomic(self).await?),
            None => Ok(()),
        }
    }

    // ── Peer programming ──────────────────────────────────────────────

    pub(crate) fn resolve_peer(&self, peer_ip: Ipv4Addr) -> Option<PeerRecord> {
        self.ctx.peerdb.resolve(&self.id, peer_ip)
    }

    /// Program forwarding state for a peer: an L3 neighbor entry on the
    /// subnet's vxlan device and an FDB entry pointing the peer's MAC at its
    /// VTEP. Without a sandbox the entries are deferred to the next replay.
    pub async fn peer_add(
        &self,
        peer_ip: Ipv4Addr,
        record: &PeerRecord,
        _from_miss: bool,
    ) -> OverlayResult<()> {
        let peer_net = Ipv4Net::new(peer_ip, record.prefix_len)
            .map_err(|e| OverlayError::InvalidArgument(format!("bad peer mask: {}", e)))?;

        let (sandbox, vxlan_name) = {
            let state = self.state.lock();
            let Some(sandbox) = state.sandbox.clone() else {
                return Ok(());
            };
            let subnet = state.subnets.iter().find(|s| {
                s.subnet_ip.prefix_len() == peer_net.prefix_len()
                    && s.subnet_ip.contains(&peer_net.addr())
            });
            let Some(subnet) = subnet else {
                return Err(OverlayError::InvalidArgument(format!(
                    "couldn't find the subnet for peer {}",
                    peer_ip
                )));
            };
            (sandbox, subnet.vxlan_name.clone())
        };

        let link = (!vxlan_name.is_empty()).then_some(vxlan_name.as_str());

        sandbox
            .add_neighbor(IpAddr::V4(peer_ip), record.mac, link, false)
            .await?;
        sandbox
            .add_neighbor(IpAddr::V4(record.vtep), record.mac, link, true)
            .await?;
        Ok(())
    }

    async fn peer_db_update_sandbox(&self) {
        for (peer_ip, record) in self.ctx.peerdb.network_peers(&self.id) {
            if let Err(e) = self.peer_add(peer_ip, &record, false).await {
                tracing::warn!(
                    network = %self.id,
                    "could not replay peer {} into sandbox: {}",
                    peer_ip,
                    e
                );
            }
        }
    }
}

// ── Persistence ───────────────────────────────────────────────────────

impl KvObject for Network {
    fn key(&self) -> Vec<String> {
        vec!["overlay".to_string(), "network".to_string(), self.id.clone()]
    }

    fn value(&self) -> Result<Vec<u8>, StoreError> {
        let state = self.state.lock();
        let config = NetworkConfig {
            disable_default_gw: state.disable_default_gw,
            subnets: state
                .subnets
                .iter()
                .map(|s| SubnetConfig {
                    vni: s.vni,
                    gw_ip: s.gw_ip,
                    subnet_ip: s.subnet_ip,
                })
                .collect(),
        };
        config::encode(&config)
    }

    /// Apply a value read back from the store. A freshly-hydrated network
    /// takes the decoded subnets wholesale; an existing one only adopts the
    /// VNIs, which is how a CAS loser learns the winner's id.
    fn set_value(&self, value: &[u8]) -> Result<(), StoreError> {
        let decoded = config::decode(value)?;
        let mut state = self.state.lock();

        state.disable_default_gw = decoded.disable_default_gw;
        if state.subnets.is_empty() {
            state.subnets = decoded
                .subnets
                .into_iter()
                .map(|sc| Subnet::new(sc.subnet_ip, sc.gw_ip, sc.vni))
                .collect();
        } else {
            for sc in &decoded.subnets {
                let matching = state.subnets.iter_mut().find(|s| {
                    s.subnet_ip.prefix_len() == sc.subnet_ip.prefix_len()
                        && s.subnet_ip.addr() == sc.subnet_ip.addr()
                });
                if let Some(subnet) = matching {
                    subnet.vni = sc.vni;
                }
            }
        }
        Ok(())
    }

    fn index(&self) -> u64 {
        self.state.lock().db_index
    }

    fn set_index(&self, index: u64) {
        let mut state = self.state.lock();
        state.db_index = index;
        state.db_exists = true;
    }

    fn exists(&self) -> bool {
        self.state.lock().db_exists
    }
}
