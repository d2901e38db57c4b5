// Host-mode iptables filtering.
//
// When overlay devices cannot live in their own namespace, every network gets
// a dedicated filter chain (default drop) keyed by the first 12 characters of
// its id, and each subnet bridge gets accept/jump rules into that chain.

use crate::overlay::error::{OverlayError, OverlayResult};

fn network_chain(id12: &str) -> String {
    format!("OV-{}", id12)
}

async fn run_shell(cmd: &str) -> OverlayResult<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .map_err(|e| OverlayError::Internal(format!("failed to run '{}': {}", cmd, e)))?;

    if !output.status.success() {
        return Err(OverlayError::Internal(format!(
            "command '{}' failed: {}",
            cmd,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Install the per-network chain with a default drop policy.
pub(crate) async fn add_network_chain(id12: &str) -> OverlayResult<()> {
    let chain = network_chain(id12);
    run_shell(&format!(
        "iptables -N {chain} 2>/dev/null || true",
        chain = chain
    ))
    .await?;
    run_shell(&format!(
        "iptables -C {chain} -j DROP 2>/dev/null || iptables -A {chain} -j DROP",
        chain = chain
    ))
    .await
}

/// Remove the per-network chain. Best effort, teardown path.
pub(crate) async fn remove_network_chain(id12: &str) -> OverlayResult<()> {
    let chain = network_chain(id12);
    run_shell(&format!("iptables -F {chain}", chain = chain)).await?;
    run_shell(&format!("iptables -X {chain}", chain = chain)).await
}

/// Wire a subnet bridge into the network chain.
pub(crate) async fn add_filters(id12: &str, br_name: &str) -> OverlayResult<()> {
    let chain = network_chain(id12);
    run_shell(&format!(
        "iptables -C {chain} -i {br} -j ACCEPT 2>/dev/null || iptables -I {chain} -i {br} -j ACCEPT",
        chain = chain,
        br = br_name
    ))
    .await?;
    run_shell(&format!(
        "iptables -C FORWARD -o {br} -j {chain} 2>/dev/null || iptables -I FORWARD -o {br} -j {chain}",
        chain = chain,
        br = br_name
    ))
    .await
}

/// Undo `add_filters` for a subnet bridge.
pub(crate) async fn remove_filters(id12: &str, br_name: &str) -> OverlayResult<()> {
    let chain = network_chain(id12);
    run_shell(&format!(
        "iptables -D FORWARD -o {br} -j {chain}",
        chain = chain,
        br = br_name
    ))
    .await?;
    run_shell(&format!(
        "iptables -D {chain} -i {br} -j ACCEPT",
        chain = chain,
        br = br_name
    ))
    .await
}
