use crate::key::Key;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::debug;

/// Everything the cluster has told us about one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct NodeRecord {
    /// Tunnel endpoint address of the node.
    pub endpoint_ip: Option<Ipv4Addr>,
    /// Declared WireGuard public key; `None` means the node does not
    /// participate.
    pub public_key: Option<Key>,
    /// Address to assign to the WireGuard interface. Only meaningful for
    /// the local node.
    pub iface_addr: Option<Ipv4Addr>,
    /// Workload destinations reachable via this node.
    pub cidrs: BTreeSet<Ipv4Net>,
}

impl NodeRecord {
    pub(crate) fn is_empty(&self) -> bool {
        self.endpoint_ip.is_none()
            && self.public_key.is_none()
            && self.iface_addr.is_none()
            && self.cidrs.is_empty()
    }
}

/// Desired wire state of one device peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerState {
    pub endpoint: Option<SocketAddrV4>,
    pub allowed_ips: BTreeSet<Ipv4Net>,
}

/// The remote nodes that currently qualify for WireGuard encapsulation.
#[derive(Debug, Default)]
pub(crate) struct EffectivePeers {
    /// Desired device peers by public key.
    pub by_key: BTreeMap<Key, PeerState>,
    /// Hostnames backing those peers; CIDRs owned by anyone else fall back
    /// to throw routing.
    pub hosts: HashSet<String>,
}

/// Derives the effective peer set from the store.
///
/// A remote node qualifies iff it declares a non-zero public key no other
/// remote node declares, that key is not our own, and its endpoint address
/// is known. Nodes sharing a key are all excluded; they come back the moment
/// the conflict clears upstream.
pub(crate) fn effective_peers(
    nodes: &HashMap<String, NodeRecord>,
    local_hostname: &str,
    local_public_key: Option<Key>,
    listening_port: u16,
) -> EffectivePeers {
    let mut by_declared_key: BTreeMap<Key, Vec<&str>> = BTreeMap::new();
    for (hostname, record) in nodes {
        if hostname.as_str() == local_hostname {
            continue;
        }
        if let Some(key) = record.public_key {
            by_declared_key.entry(key).or_default().push(hostname.as_str());
        }
    }

    let mut peers = EffectivePeers::default();
    for (key, hostnames) in by_declared_key {
        if hostnames.len() > 1 {
            debug!(
                key = %key,
                nodes = ?hostnames,
                "public key conflict; excluding all declaring nodes"
            );
            continue;
        }
        if local_public_key == Some(key) {
            debug!(node = hostnames[0], "remote node claims our own public key; excluding");
            continue;
        }
        let hostname = hostnames[0];
        let record = &nodes[hostname];
        let Some(endpoint_ip) = record.endpoint_ip else {
            continue;
        };
        peers.by_key.insert(
            key,
            PeerState {
                endpoint: Some(SocketAddrV4::new(endpoint_ip, listening_port)),
                allowed_ips: record.cidrs.clone(),
            },
        );
        peers.hosts.insert(hostname.to_string());
    }
    peers
}
