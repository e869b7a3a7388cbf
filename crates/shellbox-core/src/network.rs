//! Network & proxy planner for container runs
//!
//! Shared resources carry fixed names so concurrent runs converge on the same
//! network and proxy, and leftovers from a crashed run can be found again.

use crate::profile::{PROXY_PORT, SandboxMode};

pub const SANDBOX_NETWORK_NAME: &str = "shellbox-sandbox";
pub const SANDBOX_PROXY_NAME: &str = "shellbox-sandbox-proxy";

/// One host port published into the sandbox, kept as the raw trimmed token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: String,
}

impl PortMapping {
    /// `--publish` value mapping the port to itself
    pub fn publish_arg(&self) -> String {
        format!("{}:{}", self.host_port, self.host_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkPlan {
    pub create_isolated_network: bool,
    pub network_name: String,
    pub proxy_name: String,
    pub proxy_enabled: bool,
    pub port_mappings: Vec<PortMapping>,
    /// Unique per-run container name derived from the image display name
    pub container_name: String,
}

impl NetworkPlan {
    /// Plan used for non-container modes
    pub fn empty() -> Self {
        Self::default()
    }

    /// Proxy URL exported to the sandboxed process when the proxy is on
    pub fn proxy_url(&self) -> Option<String> {
        self.proxy_enabled
            .then(|| format!("http://{}:{}", self.proxy_name, PROXY_PORT))
    }
}

/// Split a comma-separated port list into trimmed, non-empty tokens.
/// Order is preserved and duplicates are kept; ranges are not validated here.
pub fn parse_ports(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Plan networking for one run.
pub fn plan(
    mode: SandboxMode,
    ports_raw: &str,
    proxy_enabled: bool,
    image_display_name: &str,
) -> NetworkPlan {
    if mode != SandboxMode::Container {
        return NetworkPlan::empty();
    }

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    NetworkPlan {
        create_isolated_network: proxy_enabled,
        network_name: SANDBOX_NETWORK_NAME.to_string(),
        proxy_name: if proxy_enabled {
            SANDBOX_PROXY_NAME.to_string()
        } else {
            String::new()
        },
        proxy_enabled,
        port_mappings: parse_ports(ports_raw)
            .into_iter()
            .map(|host_port| PortMapping { host_port })
            .collect(),
        container_name: format!("{}-{}", image_display_name, &suffix[..8]),
    }
}
