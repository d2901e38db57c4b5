// Host-mode detection.
//
// Some kernels (or container-restricted environments) refuse to move a vxlan
// device into another network namespace. Probe once per process: create a
// throwaway vxlan, try to move it into our own netns, and fall back to host
// mode on any failure. In host mode the overlay devices stay in the host's
// default network context and iptables filter chains provide the isolation.

use std::os::fd::AsRawFd;
use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;

use crate::overlay::netdev::DeviceOps;

/// Non-empty value forces host mode without probing.
pub const HOST_MODE_ENV: &str = "_OVERLAY_HOST_MODE";

const PROBE_VXLAN_NAME: &str = "testvxlan";
const PROBE_VNI: u32 = 1;

/// The process-wide host-mode decision cell shared by default-constructed
/// drivers. Tests inject their own cell instead.
pub(crate) fn process_cell() -> Arc<OnceCell<bool>> {
    static CELL: OnceLock<Arc<OnceCell<bool>>> = OnceLock::new();
    CELL.get_or_init(|| Arc::new(OnceCell::new())).clone()
}

/// Resolve the host-mode decision, probing on first use.
pub(crate) async fn host_mode(
    cell: &OnceCell<bool>,
    devices: &Arc<dyn DeviceOps>,
    vxlan_port: u16,
) -> bool {
    *cell
        .get_or_init(|| detect(devices.clone(), vxlan_port))
        .await
}

async fn detect(devices: Arc<dyn DeviceOps>, vxlan_port: u16) -> bool {
    if std::env::var(HOST_MODE_ENV).map_or(false, |v| !v.is_empty()) {
        tracing::info!("host mode forced via {}", HOST_MODE_ENV);
        return true;
    }

    if let Err(e) = devices
        .create_vxlan(PROBE_VXLAN_NAME, PROBE_VNI, vxlan_port)
        .await
    {
        tracing::error!("failed to create {} interface: {}", PROBE_VXLAN_NAME, e);
        return true;
    }

    let moved = async {
        let ns = std::fs::File::open("/proc/self/ns/net")?;
        devices
            .move_link_to_ns(PROBE_VXLAN_NAME, ns.as_raw_fd())
            .await
            .map_err(std::io::Error::other)
    }
    .await;

    if let Err(e) = devices.delete_vxlan(PROBE_VXLAN_NAME).await {
        tracing::warn!("failed to delete probe vxlan: {}", e);
    }

    match moved {
        Ok(()) => false,
        Err(e) => {
            tracing::info!(
                "vxlan devices cannot enter a namespace, falling back to host mode: {}",
                e
            );
            true
        }
    }
}
