//! Namespace sandbox facade.
//!
//! A sandbox is the isolated network context holding a network's bridge and
//! vxlan devices. The driver only talks to these traits; wiring interfaces
//! into an actual namespace is the embedder's concern. In host mode the
//! "sandbox" is the host's own network context (`os_create == false`).

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::overlay::peerdb::MacAddr;

/// Error from any sandbox facade operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct SandboxError(pub String);

pub type SandboxResult<T> = Result<T, SandboxError>;

/// Options for an interface added to a sandbox.
#[derive(Debug, Clone, Default)]
pub struct IfaceOptions {
    pub address: Option<Ipv4Net>,
    pub bridge: bool,
    pub master: Option<String>,
}

impl IfaceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address (CIDR) assigned to the interface.
    pub fn address(mut self, address: Ipv4Net) -> Self {
        self.address = Some(address);
        self
    }

    /// Whether the interface is a bridge device.
    pub fn bridge(mut self, bridge: bool) -> Self {
        self.bridge = bridge;
        self
    }

    /// Name of the bridge the interface is enslaved to.
    pub fn master(mut self, master: &str) -> Self {
        self.master = Some(master.to_string());
        self
    }
}

/// An isolated network context owned by a single overlay network.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// The key the sandbox was created with.
    fn key(&self) -> String;

    /// Add an interface of the given kind ("br", "vxlan") to the sandbox.
    async fn add_interface(&self, name: &str, kind: &str, options: IfaceOptions)
        -> SandboxResult<()>;

    /// Program a neighbor entry. With `bridge_family` the entry is an
    /// AF_BRIDGE FDB record (mac reachable via `dst`), otherwise an L3
    /// neighbor (dst resolves to mac) on `link_name`.
    async fn add_neighbor(
        &self,
        dst: IpAddr,
        mac: MacAddr,
        link_name: Option<&str>,
        bridge_family: bool,
    ) -> SandboxResult<()>;

    /// Run `f` with the sandbox's namespace as the current one.
    fn invoke(&self, f: Box<dyn FnOnce() + Send>) -> SandboxResult<()>;

    /// Names of every interface currently inside the sandbox.
    async fn interface_names(&self) -> Vec<String>;

    /// Remove a single interface from the sandbox.
    async fn remove_interface(&self, name: &str) -> SandboxResult<()>;

    /// Tear the sandbox down. Interfaces still inside it are released to the
    /// kernel's discretion; callers remove them first.
    async fn destroy(&self) -> SandboxResult<()>;
}

/// Creates sandboxes on demand. `os_create` requests a fresh namespace; host
/// mode passes false and gets a handle onto the host context.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn new_sandbox(&self, key: &str, os_create: bool) -> SandboxResult<Arc<dyn Sandbox>>;
}
