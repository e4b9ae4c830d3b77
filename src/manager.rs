//! Translates typed cluster events into reconciler update calls.
//!
//! The embedding agent decodes its cluster-membership and routing messages
//! into [`ClusterEvent`] values and feeds them here in arrival order; the
//! manager only records state, and a periodic [`MeshManager::apply`] does
//! the actual dataplane work.

use crate::error::Error;
use crate::key::Key;
use crate::reconciler::{IfaceState, Wireguard};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::trace;

/// Which kind of workload a route event describes. Only remote workloads
/// are tunneled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Remote,
    Local,
}

/// A cluster state change relevant to tunnel programming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A node's tunnel endpoint address was announced or changed.
    HostAddressUpdated { hostname: String, addr: Ipv4Addr },
    /// A node's tunnel endpoint address was withdrawn.
    HostAddressRemoved { hostname: String },
    /// A node announced its WireGuard key (and, for the local node, the
    /// interface address). A zero key means the node has none.
    HostKeyUpdated {
        hostname: String,
        public_key: Key,
        iface_addr: Option<Ipv4Addr>,
    },
    /// A node's WireGuard key was withdrawn.
    HostKeyRemoved { hostname: String },
    /// A workload CIDR became reachable via a node.
    WorkloadRouteUpdated {
        hostname: String,
        dst: Ipv4Net,
        kind: WorkloadKind,
    },
    /// A workload CIDR was withdrawn.
    WorkloadRouteRemoved { dst: Ipv4Net },
}

/// Feeds cluster events into the [`Wireguard`] reconciler.
pub struct MeshManager {
    reconciler: Wireguard,
}

impl MeshManager {
    pub fn new(reconciler: Wireguard) -> Self {
        Self { reconciler }
    }

    /// Records one cluster event. Never touches the dataplane.
    pub fn on_event(&mut self, event: ClusterEvent) {
        match event {
            ClusterEvent::HostAddressUpdated { hostname, addr } => {
                self.reconciler.endpoint_update(&hostname, addr);
            }
            ClusterEvent::HostAddressRemoved { hostname } => {
                self.reconciler.endpoint_remove(&hostname);
            }
            ClusterEvent::HostKeyUpdated {
                hostname,
                public_key,
                iface_addr,
            } => {
                self.reconciler
                    .endpoint_wireguard_update(&hostname, public_key, iface_addr);
            }
            ClusterEvent::HostKeyRemoved { hostname } => {
                self.reconciler.endpoint_wireguard_remove(&hostname);
            }
            ClusterEvent::WorkloadRouteUpdated {
                hostname,
                dst,
                kind,
            } => {
                if kind != WorkloadKind::Remote {
                    trace!(%dst, "route update is not for a remote workload; ignoring");
                    return;
                }
                self.reconciler.endpoint_allowed_cidr_add(&hostname, dst);
            }
            ClusterEvent::WorkloadRouteRemoved { dst } => {
                self.reconciler.endpoint_allowed_cidr_remove(dst);
            }
        }
    }

    /// Interface monitor passthrough.
    pub fn on_iface_state_changed(&mut self, name: &str, state: IfaceState) {
        self.reconciler.on_iface_state_changed(name, state);
    }

    /// Schedules a full probe of live kernel state on the next apply.
    pub fn queue_resync(&mut self) {
        self.reconciler.queue_resync();
    }

    /// Converges the kernel toward the recorded state.
    pub async fn apply(&mut self) -> Result<(), Error> {
        self.reconciler.apply().await
    }

    pub fn reconciler(&self) -> &Wireguard {
        &self.reconciler
    }

    pub fn reconciler_mut(&mut self) -> &mut Wireguard {
        &mut self.reconciler
    }
}
