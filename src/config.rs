use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-node WireGuard dataplane configuration.
///
/// Immutable after construction; changing any of these requires rebuilding
/// the reconciler. The embedding agent typically carries this struct inside
/// its own configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Name of the local node, as it appears in cluster events.
    pub hostname: String,

    /// Whether node-to-node encryption is enabled. When disabled, `apply`
    /// tears down any device, rule, and routes this agent owns.
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    /// Name of the WireGuard interface to manage.
    #[serde(default = "Config::default_iface_name")]
    pub iface_name: String,

    /// UDP port the local device listens on. Remote peers are assumed to
    /// listen on the same port.
    #[serde(default = "Config::default_listening_port")]
    pub listening_port: u16,

    /// Firewall mark stamped on the device's own encrypted traffic, so that
    /// the outer UDP packets bypass the tunnel routing rule.
    pub firewall_mark: u32,

    /// Index of the routing table holding tunnel routes.
    pub routing_table: u32,

    /// Priority of the policy-routing rule that diverts unmarked traffic
    /// into [`Config::routing_table`].
    pub rule_priority: u32,

    /// MTU programmed on the WireGuard interface.
    #[serde(default = "Config::default_mtu")]
    pub mtu: u32,

    /// Kernel routing protocol tag identifying routes owned by this agent.
    #[serde(default = "Config::default_route_protocol")]
    pub route_protocol: u8,

    /// Grace period before a route that dropped out of the desired set is
    /// physically deleted.
    #[serde(default = "Config::default_route_cleanup_delay")]
    pub route_cleanup_delay: Duration,
}

impl Config {
    pub fn default_enabled() -> bool {
        true
    }

    pub fn default_iface_name() -> String {
        "wgmesh0".to_string()
    }

    pub fn default_listening_port() -> u16 {
        51820
    }

    pub fn default_mtu() -> u32 {
        1420
    }

    pub fn default_route_protocol() -> u8 {
        80
    }

    pub fn default_route_cleanup_delay() -> Duration {
        Duration::from_secs(10)
    }
}
