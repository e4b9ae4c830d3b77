//! Dataplane client abstractions.
//!
//! The reconciler never talks to the kernel directly; it drives the two
//! traits below through lazily opened, fault-rebuilt clients. The production
//! implementation lives in [`cmd`]; tests run against an in-memory mock.

pub mod cmd;
#[cfg(test)]
pub(crate) mod mock;

use crate::key::Key;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Error class for dataplane operations.
///
/// [`DataplaneError::NotSupported`] is a terminal verdict: the running
/// kernel cannot do this at all, and retrying is pointless until an explicit
/// resync. Everything else is transient; the owning client is dropped and
/// rebuilt on the next apply.
#[derive(Debug, Error)]
pub enum DataplaneError {
    #[error("operation not supported by the running kernel")]
    NotSupported,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Failed(String),
}

impl DataplaneError {
    pub fn is_not_supported(&self) -> bool {
        matches!(self, DataplaneError::NotSupported)
    }
}

/// Kernel view of a network link, reduced to the attributes this agent
/// programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    /// Link kind as reported by the kernel, e.g. `"wireguard"`.
    pub kind: Option<String>,
    pub mtu: u32,
    /// Administratively up (`IFF_UP`).
    pub admin_up: bool,
    /// Operationally up; the device only carries traffic in this state.
    pub oper_up: bool,
}

/// An IP policy-routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub priority: u32,
    pub table: u32,
    pub fwmark: u32,
    /// Inverts the match: the rule applies to packets *not* carrying
    /// `fwmark`.
    pub invert: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Unicast,
    /// Stop matching in this table and fall through to the next rule.
    Throw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteScope {
    Link,
    Universe,
}

/// A route in a specific kernel routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub dst: Ipv4Net,
    pub table: u32,
    pub protocol: u8,
    pub kind: RouteKind,
    pub scope: RouteScope,
    pub link_index: Option<u32>,
}

impl Route {
    /// Identity of this route for diffing: `"<table>-<ifindex>-<cidr>"`,
    /// with ifindex 0 for routes not bound to a device.
    pub fn key(&self) -> String {
        format!("{}-{}-{}", self.table, self.link_index.unwrap_or(0), self.dst)
    }
}

/// WireGuard device state as reported by the kernel.
#[derive(Debug, Clone, Default)]
pub struct Device {
    pub private_key: Key,
    pub public_key: Key,
    pub listen_port: u16,
    pub fwmark: u32,
    pub peers: Vec<Peer>,
}

/// A peer entry on a WireGuard device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: Key,
    pub endpoint: Option<SocketAddrV4>,
    pub allowed_ips: Vec<Ipv4Net>,
}

/// A batched device configuration change. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub private_key: Option<Key>,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub peers: Vec<PeerUpdate>,
}

/// A single peer change within a [`DeviceUpdate`].
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub public_key: Key,
    /// Remove the peer; all other fields are ignored.
    pub remove: bool,
    pub endpoint: Option<SocketAddrV4>,
    /// Replace the peer's allowed-IPs set with `allowed_ips` instead of
    /// appending to it.
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<Ipv4Net>,
}

impl PeerUpdate {
    pub fn remove(public_key: Key) -> Self {
        Self {
            public_key,
            remove: true,
            endpoint: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }
}

/// Link, address, rule, and route operations, netlink-shaped.
#[async_trait]
pub trait NetlinkClient: Send + Sync {
    async fn link_by_name(&self, name: &str) -> Result<Option<Link>, DataplaneError>;

    /// Creates a WireGuard-type link. [`DataplaneError::NotSupported`] means
    /// the kernel has no WireGuard support.
    async fn link_add_wireguard(&self, name: &str, mtu: u32) -> Result<Link, DataplaneError>;

    async fn link_del(&self, name: &str) -> Result<(), DataplaneError>;

    async fn link_set_up(&self, name: &str) -> Result<(), DataplaneError>;

    async fn link_set_mtu(&self, name: &str, mtu: u32) -> Result<(), DataplaneError>;

    async fn addr_list(&self, link: &str) -> Result<Vec<Ipv4Addr>, DataplaneError>;

    async fn addr_add(&self, link: &str, addr: Ipv4Addr) -> Result<(), DataplaneError>;

    async fn addr_del(&self, link: &str, addr: Ipv4Addr) -> Result<(), DataplaneError>;

    async fn rule_list(&self) -> Result<Vec<Rule>, DataplaneError>;

    async fn rule_add(&self, rule: &Rule) -> Result<(), DataplaneError>;

    async fn rule_del(&self, rule: &Rule) -> Result<(), DataplaneError>;

    async fn route_list(&self, table: u32) -> Result<Vec<Route>, DataplaneError>;

    async fn route_add(&self, route: &Route) -> Result<(), DataplaneError>;

    async fn route_del(&self, route: &Route) -> Result<(), DataplaneError>;
}

/// WireGuard device configuration operations.
#[async_trait]
pub trait WireguardClient: Send + Sync {
    async fn device(&self, name: &str) -> Result<Device, DataplaneError>;

    /// Applies a batched configuration change to the device.
    async fn configure_device(
        &self,
        name: &str,
        update: DeviceUpdate,
    ) -> Result<(), DataplaneError>;
}

/// Opens a fresh netlink client. Called lazily and again after any client
/// fault.
pub type NetlinkFactory =
    Box<dyn Fn() -> Result<Arc<dyn NetlinkClient>, DataplaneError> + Send + Sync>;

/// Opens a fresh WireGuard configuration client.
/// [`DataplaneError::NotSupported`] is the terminal no-kernel-support
/// verdict.
pub type WireguardFactory =
    Box<dyn Fn() -> Result<Arc<dyn WireguardClient>, DataplaneError> + Send + Sync>;

enum ClientState<C> {
    Unopened,
    Open(C),
    /// The factory said the kernel cannot do this; stays until an explicit
    /// resync resets it.
    Unsupported,
}

/// Lazily opened dataplane client with fault-driven rebuild.
pub(crate) struct ClientManager<C> {
    state: ClientState<C>,
    factory: Box<dyn Fn() -> Result<C, DataplaneError> + Send + Sync>,
}

impl<C: Clone> ClientManager<C> {
    pub(crate) fn new(factory: Box<dyn Fn() -> Result<C, DataplaneError> + Send + Sync>) -> Self {
        Self {
            state: ClientState::Unopened,
            factory,
        }
    }

    /// Returns the open client, opening it first if needed. A `NotSupported`
    /// verdict from the factory is sticky.
    pub(crate) fn get(&mut self) -> Result<C, DataplaneError> {
        match &self.state {
            ClientState::Open(client) => Ok(client.clone()),
            ClientState::Unsupported => Err(DataplaneError::NotSupported),
            ClientState::Unopened => {
                trace!("opening dataplane client");
                match (self.factory)() {
                    Ok(client) => {
                        self.state = ClientState::Open(client.clone());
                        Ok(client)
                    }
                    Err(e) if e.is_not_supported() => {
                        self.state = ClientState::Unsupported;
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Drops the client after a failing call; the next `get` reopens.
    pub(crate) fn invalidate(&mut self) {
        if matches!(self.state, ClientState::Open(_)) {
            trace!("dropping failed dataplane client");
            self.state = ClientState::Unopened;
        }
    }

    pub(crate) fn mark_unsupported(&mut self) {
        self.state = ClientState::Unsupported;
    }

    pub(crate) fn is_unsupported(&self) -> bool {
        matches!(self.state, ClientState::Unsupported)
    }

    /// Clears the sticky `Unsupported` verdict so the next `get` probes the
    /// kernel again.
    pub(crate) fn reset(&mut self) {
        self.state = ClientState::Unopened;
    }
}
