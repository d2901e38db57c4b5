// Driver-level scenarios exercised against fake sandbox, device, and store
// layers. The fakes record every call so the tests can assert on the exact
// wiring the kernel would have seen.

pub(crate) mod support {
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use ipnet::Ipv4Net;
    use parking_lot::Mutex;

    use crate::overlay::error::{OverlayError, OverlayResult};
    use crate::overlay::netdev::DeviceOps;
    use crate::overlay::network::DriverCtx;
    use crate::overlay::peerdb::{MacAddr, MemoryPeerDb};
    use crate::overlay::vni::VniAllocator;
    use crate::overlay::{OverlayConfig, OverlayDriver};
    use crate::sandbox::{IfaceOptions, Sandbox, SandboxError, SandboxFactory, SandboxResult};
    use crate::store::Datastore;

    #[derive(Debug, Clone)]
    pub(crate) struct RecordedIface {
        pub name: String,
        pub kind: String,
        pub options: IfaceOptions,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct RecordedNeighbor {
        pub dst: IpAddr,
        pub mac: MacAddr,
        pub link_name: Option<String>,
        pub bridge_family: bool,
    }

    pub(crate) struct FakeSandbox {
        key: String,
        pub interfaces: Mutex<Vec<RecordedIface>>,
        pub neighbors: Mutex<Vec<RecordedNeighbor>>,
        pub destroyed: AtomicBool,
    }

    #[async_trait]
    impl Sandbox for FakeSandbox {
        fn key(&self) -> String {
            self.key.clone()
        }

        async fn add_interface(
            &self,
            name: &str,
            kind: &str,
            options: IfaceOptions,
        ) -> SandboxResult<()> {
            self.interfaces.lock().push(RecordedIface {
                name: name.to_string(),
                kind: kind.to_string(),
                options,
            });
            Ok(())
        }

        async fn add_neighbor(
            &self,
            dst: IpAddr,
            mac: MacAddr,
            link_name: Option<&str>,
            bridge_family: bool,
        ) -> SandboxResult<()> {
            self.neighbors.lock().push(RecordedNeighbor {
                dst,
                mac,
                link_name: link_name.map(str::to_string),
                bridge_family,
            });
            Ok(())
        }

        fn invoke(&self, f: Box<dyn FnOnce() + Send>) -> SandboxResult<()> {
            f();
            Ok(())
        }

        async fn interface_names(&self) -> Vec<String> {
            self.interfaces.lock().iter().map(|i| i.name.clone()).collect()
        }

        async fn remove_interface(&self, name: &str) -> SandboxResult<()> {
            self.interfaces.lock().retain(|i| i.name != name);
            Ok(())
        }

        async fn destroy(&self) -> SandboxResult<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeSandboxFactory {
        pub created: AtomicUsize,
        pub sandboxes: Mutex<Vec<Arc<FakeSandbox>>>,
        pub fail: AtomicBool,
    }

    impl FakeSandboxFactory {
        pub fn latest(&self) -> Arc<FakeSandbox> {
            self.sandboxes.lock().last().expect("no sandbox created").clone()
        }
    }

    #[async_trait]
    impl SandboxFactory for FakeSandboxFactory {
        async fn new_sandbox(&self, key: &str, _os_create: bool) -> SandboxResult<Arc<dyn Sandbox>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SandboxError("namespace setup refused".into()));
            }
            let sandbox = Arc::new(FakeSandbox {
                key: key.to_string(),
                interfaces: Mutex::new(Vec::new()),
                neighbors: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            });
            self.sandboxes.lock().push(sandbox.clone());
            Ok(sandbox)
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeDevices {
        pub vxlans: Mutex<HashSet<String>>,
        pub nameservers: Mutex<Vec<Ipv4Addr>>,
        pub routes: Mutex<Vec<Ipv4Net>>,
        pub fail_create: AtomicBool,
    }

    #[async_trait]
    impl DeviceOps for FakeDevices {
        async fn create_vxlan(&self, name: &str, _vni: u32, _port: u16) -> OverlayResult<()> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(OverlayError::Netlink(
                    "error creating vxlan interface".into(),
                ));
            }
            self.vxlans.lock().insert(name.to_string());
            Ok(())
        }

        async fn delete_vxlan(&self, name: &str) -> OverlayResult<()> {
            if self.vxlans.lock().remove(name) {
                Ok(())
            } else {
                Err(OverlayError::Netlink(format!("link {} not found", name)))
            }
        }

        async fn move_link_to_ns(&self, _name: &str, _ns_fd: RawFd) -> OverlayResult<()> {
            Ok(())
        }

        async fn host_routes(&self) -> OverlayResult<Vec<Ipv4Net>> {
            Ok(self.routes.lock().clone())
        }

        fn nameservers(&self) -> Vec<Ipv4Addr> {
            self.nameservers.lock().clone()
        }
    }

    pub(crate) struct Harness {
        pub driver: Arc<OverlayDriver>,
        pub factory: Arc<FakeSandboxFactory>,
        pub devices: Arc<FakeDevices>,
        pub peerdb: Arc<MemoryPeerDb>,
        pub allocator: Arc<VniAllocator>,
    }

    pub(crate) fn harness(store: Option<Arc<dyn Datastore>>, host_mode: bool) -> Harness {
        harness_with(store, host_mode, Arc::new(VniAllocator::new()))
    }

    pub(crate) fn harness_with(
        store: Option<Arc<dyn Datastore>>,
        host_mode: bool,
        allocator: Arc<VniAllocator>,
    ) -> Harness {
        let factory = Arc::new(FakeSandboxFactory::default());
        let devices = Arc::new(FakeDevices::default());
        let peerdb = Arc::new(MemoryPeerDb::new());
        let driver = Arc::new(OverlayDriver::with_parts(
            store,
            peerdb.clone(),
            factory.clone(),
            devices.clone(),
            allocator.clone(),
            Arc::new(tokio::sync::OnceCell::new_with(Some(host_mode))),
            OverlayConfig::default(),
        ));
        Harness {
            driver,
            factory,
            devices,
            peerdb,
            allocator,
        }
    }

    /// A bare context for unit tests that only poke Network state.
    pub(crate) fn bare_ctx() -> Arc<DriverCtx> {
        Arc::new(DriverCtx {
            store: None,
            peerdb: Arc::new(MemoryPeerDb::new()),
            sandboxes: Arc::new(FakeSandboxFactory::default()),
            devices: Arc::new(FakeDevices::default()),
            vni_allocator: Arc::new(VniAllocator::new()),
            host_mode: Arc::new(tokio::sync::OnceCell::new_with(Some(false))),
            config: OverlayConfig::default(),
        })
    }
}

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;

use self::support::harness;

use crate::overlay::error::OverlayError;
use crate::overlay::network::Network;
use crate::overlay::peerdb::{MacAddr, PeerRecord};
use crate::sandbox::Sandbox;
use crate::store::{Datastore, KvObject, MemoryStore, StoreError};

const NET_ID: &str = "fedcba9876543210";

fn ipam(pool: &str, gateway: &str) -> crate::overlay::IpamData {
    crate::overlay::IpamData {
        pool: pool.parse().unwrap(),
        gateway: gateway.parse().unwrap(),
    }
}

fn subnet(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

async fn create_default_network(h: &support::Harness) {
    h.driver
        .create_network(
            NET_ID,
            &HashMap::new(),
            &[ipam("10.0.1.0/24", "10.0.1.1/24")],
            &[],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_network_validates_id() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    let err = h
        .driver
        .create_network("", &HashMap::new(), &[], &[])
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_create_then_delete_leaves_nothing_behind() {
    let store = Arc::new(MemoryStore::new());
    let h = harness(Some(store.clone()), false);

    create_default_network(&h).await;
    let key = vec![
        "overlay".to_string(),
        "network".to_string(),
        NET_ID.to_string(),
    ];
    assert!(store.contains(&key));

    h.driver.delete_network(NET_ID).await.unwrap();
    assert!(!store.contains(&key));
    assert!(h.driver.network(NET_ID).await.is_none());
    assert_eq!(h.allocator.live(), 0);

    let err = h.driver.delete_network(NET_ID).await.unwrap_err();
    assert!(matches!(err, OverlayError::NotFound(_)));
}

#[tokio::test]
async fn test_join_brings_devices_up_and_leave_tears_down() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    create_default_network(&h).await;

    h.driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap();

    let network = h.driver.network(NET_ID).await.unwrap();
    assert_eq!(network.join_count(), 1);
    assert!(network.has_sandbox());

    let vni = network.vxlan_id(&subnet("10.0.1.0/24")).unwrap();
    assert_ne!(vni, 0);
    let br_name = format!("ov-{:06x}-fedcb", vni);
    let vxlan_name = format!("vx-{:06x}-fedcb", vni);

    let sandbox = h.factory.latest();
    assert_eq!(sandbox.key(), format!("1-{}", NET_ID));
    {
        let ifaces = sandbox.interfaces.lock();
        assert_eq!(ifaces.len(), 2);

        assert_eq!(ifaces[0].name, br_name);
        assert_eq!(ifaces[0].kind, "br");
        assert!(ifaces[0].options.bridge);
        assert_eq!(ifaces[0].options.address, Some(subnet("10.0.1.1/24")));

        assert_eq!(ifaces[1].name, vxlan_name);
        assert_eq!(ifaces[1].kind, "vxlan");
        assert_eq!(ifaces[1].options.master.as_deref(), Some(br_name.as_str()));
    }
    assert!(h.devices.vxlans.lock().contains(&vxlan_name));
    assert_eq!(
        network.subnet_device_names(&subnet("10.0.1.0/24")),
        Some((br_name, vxlan_name.clone()))
    );

    h.driver.leave_endpoint(NET_ID).await.unwrap();
    assert_eq!(network.join_count(), 0);
    assert!(!network.has_sandbox());
    assert!(sandbox.destroyed.load(std::sync::atomic::Ordering::SeqCst));
    assert!(sandbox.interfaces.lock().is_empty());
    assert!(h.devices.vxlans.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_joins_initialize_once() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    create_default_network(&h).await;

    let mut tasks = Vec::new();
    for i in 0..16u32 {
        let driver = h.driver.clone();
        let ep = subnet(&format!("10.0.1.{}/24", 10 + i));
        tasks.push(tokio::spawn(async move {
            driver.join_endpoint(NET_ID, ep).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.factory.created.load(std::sync::atomic::Ordering::SeqCst), 1);
    let network = h.driver.network(NET_ID).await.unwrap();
    assert_eq!(network.join_count(), 16);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let driver = h.driver.clone();
        tasks.push(tokio::spawn(async move {
            driver.leave_endpoint(NET_ID).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(network.join_count(), 0);
    assert!(!network.has_sandbox());
    assert!(h.devices.vxlans.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_sandbox_failure_shares_one_outcome() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    create_default_network(&h).await;
    h.factory.fail.store(true, std::sync::atomic::Ordering::SeqCst);

    let network = h.driver.network(NET_ID).await.unwrap();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let network = network.clone();
        tasks.push(tokio::spawn(async move { network.join_sandbox().await }));
    }
    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, OverlayError::Sandbox(_)));
    }

    // One attempt, stored and replayed for every caller.
    assert_eq!(h.factory.created.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!network.has_sandbox());
}

#[tokio::test]
async fn test_failed_join_unwinds_and_allows_retry() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    create_default_network(&h).await;

    h.factory.fail.store(true, std::sync::atomic::Ordering::SeqCst);
    let err = h
        .driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::Sandbox(_)));

    let network = h.driver.network(NET_ID).await.unwrap();
    assert_eq!(network.join_count(), 0);
    assert!(!network.has_sandbox());

    // The unwind rearmed the guards; the next join starts fresh.
    h.factory.fail.store(false, std::sync::atomic::Ordering::SeqCst);
    h.driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap();
    assert_eq!(network.join_count(), 1);
    assert!(network.has_sandbox());
}

#[tokio::test]
async fn test_subnet_failure_tears_down_installed_sandbox() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    create_default_network(&h).await;

    h.devices
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = h
        .driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::Netlink(_)));

    // The network sandbox came up before the vxlan creation failed; the
    // unwind must destroy it and leave no half-initialized state behind.
    let sandbox = h.factory.latest();
    assert!(sandbox.destroyed.load(std::sync::atomic::Ordering::SeqCst));
    let network = h.driver.network(NET_ID).await.unwrap();
    assert_eq!(network.join_count(), 0);
    assert!(!network.has_sandbox());

    h.devices
        .fail_create
        .store(false, std::sync::atomic::Ordering::SeqCst);
    h.driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap();
    assert!(network.has_sandbox());
    assert_eq!(h.factory.created.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejoin_after_last_leave_reinitializes() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    create_default_network(&h).await;

    h.driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap();
    h.driver.leave_endpoint(NET_ID).await.unwrap();

    h.driver
        .join_endpoint(NET_ID, subnet("10.0.1.6/24"))
        .await
        .unwrap();

    assert_eq!(h.factory.created.load(std::sync::atomic::Ordering::SeqCst), 2);
    // The sandbox key carries the new epoch.
    assert_eq!(h.factory.latest().key(), format!("2-{}", NET_ID));

    let network = h.driver.network(NET_ID).await.unwrap();
    assert_eq!(network.join_count(), 1);
    assert!(network.has_sandbox());
}

/// Store wrapper that lets a competing writer slip in right before the
/// wrapped store sees our first atomic put, like a second host racing the
/// same CAS round.
struct RacingStore {
    inner: Arc<MemoryStore>,
    winner: Mutex<Option<(Arc<Network>, Ipv4Net)>>,
}

#[async_trait]
impl Datastore for RacingStore {
    async fn get_object(&self, key: &[String], out: &dyn KvObject) -> Result<(), StoreError> {
        self.inner.get_object(key, out).await
    }

    async fn put_object_atomic(&self, obj: &dyn KvObject) -> Result<(), StoreError> {
        let winner = self.winner.lock().take();
        if let Some((network, subnet_ip)) = winner {
            network.obtain_vxlan_id(subnet_ip).await.unwrap();
        }
        self.inner.put_object_atomic(obj).await
    }

    async fn delete_object_atomic(&self, obj: &dyn KvObject) -> Result<(), StoreError> {
        self.inner.delete_object_atomic(obj).await
    }
}

#[tokio::test]
async fn test_vni_cas_race_converges_on_winner() {
    let inner = Arc::new(MemoryStore::new());
    let allocator = Arc::new(crate::overlay::vni::VniAllocator::new());
    let pool = subnet("10.0.1.0/24");

    // The winner host talks straight to the shared store.
    let winner_host = support::harness_with(Some(inner.clone()), false, allocator.clone());
    create_default_network(&winner_host).await;
    let winner_net = winner_host.driver.network(NET_ID).await.unwrap();

    let racing = Arc::new(RacingStore {
        inner: inner.clone(),
        winner: Mutex::new(Some((winner_net.clone(), pool))),
    });
    let loser_host = support::harness_with(Some(racing), false, allocator.clone());
    let loser_net = loser_host.driver.network(NET_ID).await.unwrap();

    loser_net.obtain_vxlan_id(pool).await.unwrap();

    let winner_vni = winner_net.vxlan_id(&pool).unwrap();
    let loser_vni = loser_net.vxlan_id(&pool).unwrap();
    assert_ne!(winner_vni, 0);
    assert_eq!(loser_vni, winner_vni);
    // Exactly one id consumed; the loser's candidate went back to the pool.
    assert_eq!(allocator.live(), 1);
}

/// Seeds raw bytes into a store under a network key.
struct RawSeed {
    key: Vec<String>,
    bytes: Vec<u8>,
    index: std::sync::atomic::AtomicU64,
    exists: std::sync::atomic::AtomicBool,
}

impl RawSeed {
    fn new(id: &str, bytes: &[u8]) -> Self {
        RawSeed {
            key: vec!["overlay".into(), "network".into(), id.into()],
            bytes: bytes.to_vec(),
            index: std::sync::atomic::AtomicU64::new(0),
            exists: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl KvObject for RawSeed {
    fn key(&self) -> Vec<String> {
        self.key.clone()
    }
    fn value(&self) -> Result<Vec<u8>, StoreError> {
        Ok(self.bytes.clone())
    }
    fn set_value(&self, _: &[u8]) -> Result<(), StoreError> {
        Ok(())
    }
    fn index(&self) -> u64 {
        self.index.load(std::sync::atomic::Ordering::SeqCst)
    }
    fn set_index(&self, index: u64) {
        self.index.store(index, std::sync::atomic::Ordering::SeqCst);
        self.exists.store(true, std::sync::atomic::Ordering::SeqCst);
    }
    fn exists(&self) -> bool {
        self.exists.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_registry_hydrates_legacy_value_from_store() {
    let store = Arc::new(MemoryStore::new());
    let seed = RawSeed::new(
        NET_ID,
        br#"[{"SubnetIP":"10.0.0.0/24","GwIP":"10.0.0.1/24","Vni":42}]"#,
    );
    store.put_object_atomic(&seed).await.unwrap();

    let h = harness(Some(store), false);
    let network = h.driver.network(NET_ID).await.unwrap();

    assert_eq!(network.join_count(), 0);
    assert!(!network.has_sandbox());
    assert!(!network.disable_default_gw());
    assert_eq!(network.vxlan_id(&subnet("10.0.0.0/24")).unwrap(), 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_racing_registry_lookups_share_one_network() {
    let store = Arc::new(MemoryStore::new());
    let seed = RawSeed::new(
        NET_ID,
        br#"{"disableDefaultGW":false,"subnets":[{"vni":3,"gwIP":"10.9.0.1/24","subnetIP":"10.9.0.0/24"}]}"#,
    );
    store.put_object_atomic(&seed).await.unwrap();

    let h = harness(Some(store), false);
    let a = h.driver.clone();
    let b = h.driver.clone();
    let (first, second) = tokio::join!(a.network(NET_ID), b.network(NET_ID));
    let first = first.unwrap();
    let second = second.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_host_mode_nameserver_overlap_conflicts() {
    let h = harness(Some(Arc::new(MemoryStore::new())), true);
    h.devices
        .nameservers
        .lock()
        .push(Ipv4Addr::new(10, 0, 0, 53));

    h.driver
        .create_network(
            NET_ID,
            &HashMap::new(),
            &[ipam("10.0.0.0/24", "10.0.0.1/24")],
            &[],
        )
        .await
        .unwrap();

    let network = h.driver.network(NET_ID).await.unwrap();
    let err = network
        .join_subnet_sandbox(subnet("10.0.0.0/24"))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::Conflict(_)));
}

#[tokio::test]
async fn test_host_mode_route_overlap_conflicts() {
    let h = harness(Some(Arc::new(MemoryStore::new())), true);
    h.devices.routes.lock().push(subnet("10.0.0.0/16"));

    h.driver
        .create_network(
            NET_ID,
            &HashMap::new(),
            &[ipam("10.0.0.0/24", "10.0.0.1/24")],
            &[],
        )
        .await
        .unwrap();

    let network = h.driver.network(NET_ID).await.unwrap();
    let err = network
        .join_subnet_sandbox(subnet("10.0.0.0/24"))
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::Conflict(_)));
}

#[tokio::test]
async fn test_disable_default_gw_option_round_trips() {
    let store = Arc::new(MemoryStore::new());
    {
        let h = harness(Some(store.clone()), false);
        let mut options = HashMap::new();
        options.insert("disableDefaultGW".to_string(), String::new());
        options.insert("someOtherKey".to_string(), "ignored".to_string());
        h.driver
            .create_network(NET_ID, &options, &[ipam("10.0.1.0/24", "10.0.1.1/24")], &[])
            .await
            .unwrap();
        assert!(h.driver.network(NET_ID).await.unwrap().disable_default_gw());
    }

    // A different host hydrating the same network sees the flag.
    let other = harness(Some(store), false);
    let network = other.driver.network(NET_ID).await.unwrap();
    assert!(network.disable_default_gw());
}

#[tokio::test]
async fn test_sqlite_store_backs_the_driver() {
    let store = Arc::new(
        crate::store::SqliteStore::connect("sqlite::memory:")
            .await
            .unwrap(),
    );
    let h = harness(Some(store), false);
    create_default_network(&h).await;

    h.driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap();
    let network = h.driver.network(NET_ID).await.unwrap();
    assert_ne!(network.vxlan_id(&subnet("10.0.1.0/24")).unwrap(), 0);

    h.driver.leave_endpoint(NET_ID).await.unwrap();
    h.driver.delete_network(NET_ID).await.unwrap();
    assert_eq!(h.allocator.live(), 0);
    assert!(h.driver.network(NET_ID).await.is_none());
}

#[tokio::test]
async fn test_known_peers_replay_into_fresh_sandbox() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    create_default_network(&h).await;

    let record = PeerRecord {
        mac: MacAddr([0x02, 0x42, 0x0a, 0x00, 0x01, 0x09]),
        prefix_len: 24,
        vtep: Ipv4Addr::new(192, 168, 50, 2),
    };
    h.peerdb
        .insert(NET_ID, Ipv4Addr::new(10, 0, 1, 9), record);

    h.driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap();

    let sandbox = h.factory.latest();
    let neighbors = sandbox.neighbors.lock().clone();
    assert_eq!(neighbors.len(), 2);
    assert_eq!(neighbors[0].dst, IpAddr::V4(Ipv4Addr::new(10, 0, 1, 9)));
    assert_eq!(neighbors[0].mac, record.mac);
    assert!(!neighbors[0].bridge_family);
    assert_eq!(neighbors[1].dst, IpAddr::V4(Ipv4Addr::new(192, 168, 50, 2)));
    assert!(neighbors[1].bridge_family);
}

#[tokio::test]
async fn test_peer_add_targets_the_subnet_vxlan() {
    let h = harness(Some(Arc::new(MemoryStore::new())), false);
    create_default_network(&h).await;
    h.driver
        .join_endpoint(NET_ID, subnet("10.0.1.5/24"))
        .await
        .unwrap();

    let network = h.driver.network(NET_ID).await.unwrap();
    let vni = network.vxlan_id(&subnet("10.0.1.0/24")).unwrap();
    let record = PeerRecord {
        mac: MacAddr([0x02, 0, 0, 0, 0, 0x07]),
        prefix_len: 24,
        vtep: Ipv4Addr::new(192, 168, 50, 3),
    };
    h.driver
        .peer_add(NET_ID, Ipv4Addr::new(10, 0, 1, 7), record)
        .await
        .unwrap();

    let sandbox = h.factory.latest();
    let neighbors = sandbox.neighbors.lock().clone();
    let expected_link = Some(format!("vx-{:06x}-fedcb", vni));
    assert_eq!(neighbors.len(), 2);
    assert_eq!(neighbors[0].link_name, expected_link);
    assert_eq!(neighbors[1].link_name, expected_link);

    // A peer outside every subnet is rejected.
    let err = h
        .driver
        .peer_add(NET_ID, Ipv4Addr::new(172, 16, 0, 1), record)
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::InvalidArgument(_)));
}
