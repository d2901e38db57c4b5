//! Multi-host L2 overlay network driver.
//!
//! Builds Ethernet segments that span hosts by tunneling frames over VXLAN.
//! Each network owns a set of subnets; every subnet gets a bridge and a vxlan
//! device living inside a per-host network namespace (the "sandbox"), with the
//! bridge acting as the subnet gateway. Hosts cooperate through a shared
//! key-value store that serializes VXLAN Network Identifier (VNI) allocation
//! and records network membership. Unknown peer IPs are resolved on kernel
//! L3-miss events and programmed as forwarding entries.
//!
//! # Modules
//!
//! - [`overlay`] - the driver core: network/subnet lifecycle, VNI allocation,
//!   persisted configuration, host-mode detection, the neighbor-miss watcher
//! - [`sandbox`] - the namespace sandbox facade consumed by the driver
//! - [`store`] - the CAS datastore interface and local backends

pub mod overlay;
pub mod sandbox;
pub mod store;

pub use overlay::error::{OverlayError, OverlayResult};
pub use overlay::network::Network;
pub use overlay::peerdb::{MacAddr, MemoryPeerDb, PeerDb, PeerRecord};
pub use overlay::vni::VniAllocator;
pub use overlay::{IpamData, OverlayConfig, OverlayDriver};
pub use sandbox::{IfaceOptions, Sandbox, SandboxError, SandboxFactory};
pub use store::{Datastore, KvObject, StoreError};
