// Persisted network configuration codec.
//
// The canonical on-store value is a JSON mapping with stringified CIDRs:
//   {"disableDefaultGW": bool, "subnets": [{"vni": u32, "gwIP": "a.b.c.d/n", "subnetIP": "a.b.c.d/n"}]}
// Older writers persisted a bare array of subnet records with capitalized
// keys; those bytes are still decoded, synthesizing disableDefaultGW=false.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NetworkConfig {
    #[serde(rename = "disableDefaultGW", default)]
    pub disable_default_gw: bool,
    pub subnets: Vec<SubnetConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SubnetConfig {
    pub vni: u32,
    #[serde(rename = "gwIP")]
    pub gw_ip: Ipv4Net,
    #[serde(rename = "subnetIP")]
    pub subnet_ip: Ipv4Net,
}

/// Legacy array-of-subnets record, decode-only.
#[derive(Debug, Deserialize)]
struct LegacySubnet {
    #[serde(rename = "SubnetIP")]
    subnet_ip: Ipv4Net,
    #[serde(rename = "GwIP")]
    gw_ip: Ipv4Net,
    #[serde(rename = "Vni")]
    vni: u32,
}

pub(crate) fn encode(config: &NetworkConfig) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(config).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode a persisted value, trying the canonical mapping first and falling
/// back to the legacy array encoding.
pub(crate) fn decode(value: &[u8]) -> Result<NetworkConfig, StoreError> {
    if let Ok(config) = serde_json::from_slice::<NetworkConfig>(value) {
        return Ok(config);
    }

    let legacy: Vec<LegacySubnet> = serde_json::from_slice(value)
        .map_err(|e| StoreError::Serialization(format!("unrecognized network config: {}", e)))?;

    Ok(NetworkConfig {
        disable_default_gw: false,
        subnets: legacy
            .into_iter()
            .map(|s| SubnetConfig {
                vni: s.vni,
                gw_ip: s.gw_ip,
                subnet_ip: s.subnet_ip,
            })
            .collect(),
    })
}
