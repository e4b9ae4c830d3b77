//! The WireGuard reconciler.
//!
//! Holds the desired state of the node mesh (fed by idempotent update calls)
//! and converges the local kernel toward it: the WireGuard device itself,
//! its peer list, the interface address, the policy-routing rule, and the
//! per-CIDR routes in the dedicated table. Update calls never touch the
//! kernel; all dataplane work happens inside [`Wireguard::apply`].

mod node;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dataplane::cmd::{CommandNetlinkClient, CommandWireguardClient};
use crate::dataplane::{
    ClientManager, DataplaneError, DeviceUpdate, NetlinkClient, NetlinkFactory, PeerUpdate, Route,
    RouteKind, RouteScope, Rule, WireguardClient, WireguardFactory,
};
use crate::error::Error;
use crate::key::Key;
use crate::routetable::RouteTable;
use ipnet::Ipv4Net;
use node::{EffectivePeers, NodeRecord, PeerState, effective_peers};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Operational interface state, as reported by the interface monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceState {
    Up,
    Down,
}

/// Receives the locally advertised public key whenever it changes.
///
/// Called synchronously under [`Wireguard::apply`]; an error fails the apply
/// and the publication is retried on the next one.
pub type StatusCallback = Box<dyn FnMut(Key) -> Result<(), Error> + Send>;

pub struct Wireguard {
    config: Config,

    netlink: ClientManager<Arc<dyn NetlinkClient>>,
    wireguard: ClientManager<Arc<dyn WireguardClient>>,
    route_table: RouteTable,
    status: StatusCallback,

    /// Desired state, keyed by hostname.
    nodes: HashMap<String, NodeRecord>,
    /// Exclusive CIDR ownership index.
    cidr_owner: HashMap<Ipv4Net, String>,

    iface_index: Option<u32>,
    link_oper_up: bool,
    in_sync_link: bool,
    in_sync_addr: bool,
    in_sync_rule: bool,
    in_sync_device: bool,

    /// Peers we believe the device currently holds.
    applied_peers: BTreeMap<Key, PeerState>,
    /// Public key of the local device, once known.
    device_public_key: Option<Key>,
    /// Last key successfully handed to the status callback.
    advertised_key: Option<Key>,
}

impl Wireguard {
    /// Builds a reconciler wired to the real dataplane.
    pub fn new(config: Config, status: StatusCallback) -> Self {
        Self::with_shims(
            config,
            CommandNetlinkClient::factory(),
            CommandNetlinkClient::factory(),
            CommandWireguardClient::factory(),
            Arc::new(SystemClock),
            status,
        )
    }

    /// Builds a reconciler with every external dependency injected.
    pub fn with_shims(
        config: Config,
        route_netlink_factory: NetlinkFactory,
        netlink_factory: NetlinkFactory,
        wireguard_factory: WireguardFactory,
        clock: Arc<dyn Clock>,
        status: StatusCallback,
    ) -> Self {
        let route_table = RouteTable::new(
            config.routing_table,
            config.route_protocol,
            config.route_cleanup_delay,
            clock,
            route_netlink_factory,
        );
        Self {
            config,
            netlink: ClientManager::new(netlink_factory),
            wireguard: ClientManager::new(wireguard_factory),
            route_table,
            status,
            nodes: HashMap::new(),
            cidr_owner: HashMap::new(),
            iface_index: None,
            link_oper_up: false,
            in_sync_link: false,
            in_sync_addr: false,
            in_sync_rule: false,
            in_sync_device: false,
            applied_peers: BTreeMap::new(),
            device_public_key: None,
            advertised_key: None,
        }
    }

    /// Sets or replaces a node's tunnel endpoint address.
    pub fn endpoint_update(&mut self, hostname: &str, endpoint_ip: Ipv4Addr) {
        debug!(hostname, %endpoint_ip, "endpoint update");
        self.nodes
            .entry(hostname.to_string())
            .or_default()
            .endpoint_ip = Some(endpoint_ip);
    }

    /// Drops a node's tunnel endpoint address.
    pub fn endpoint_remove(&mut self, hostname: &str) {
        debug!(hostname, "endpoint remove");
        if let Some(record) = self.nodes.get_mut(hostname) {
            record.endpoint_ip = None;
            self.drop_if_empty(hostname);
        }
    }

    /// Sets or replaces a node's WireGuard key, and for the local node the
    /// interface address. A zero key means "known to have no key" and
    /// disables peer participation for that node.
    pub fn endpoint_wireguard_update(
        &mut self,
        hostname: &str,
        public_key: Key,
        iface_addr: Option<Ipv4Addr>,
    ) {
        debug!(hostname, key = %public_key, "wireguard endpoint update");
        let is_local = hostname == self.config.hostname;
        if is_local
            && let Some(advertised) = self.advertised_key
            && advertised != public_key
        {
            // Upstream disagrees about our key. The locally generated key
            // wins; forget the advertisement so it is published again.
            self.advertised_key = None;
        }

        let record = self.nodes.entry(hostname.to_string()).or_default();
        record.public_key = (!public_key.is_zero()).then_some(public_key);
        let addr_changed = record.iface_addr != iface_addr;
        record.iface_addr = iface_addr;
        if is_local && addr_changed {
            self.in_sync_addr = false;
        }
        self.drop_if_empty(hostname);
    }

    /// Drops a node's WireGuard key (and interface address).
    pub fn endpoint_wireguard_remove(&mut self, hostname: &str) {
        debug!(hostname, "wireguard endpoint remove");
        let is_local = hostname == self.config.hostname;
        if is_local {
            // Our key is no longer reflected upstream; publish it again.
            self.advertised_key = None;
        }
        if let Some(record) = self.nodes.get_mut(hostname) {
            let had_addr = record.iface_addr.is_some();
            record.public_key = None;
            record.iface_addr = None;
            if is_local && had_addr {
                self.in_sync_addr = false;
            }
            self.drop_if_empty(hostname);
        }
    }

    /// Assigns a CIDR to a node, removing it from any prior owner.
    pub fn endpoint_allowed_cidr_add(&mut self, hostname: &str, cidr: Ipv4Net) {
        debug!(hostname, %cidr, "allowed cidr add");
        if let Some(previous) = self.cidr_owner.insert(cidr, hostname.to_string())
            && previous != hostname
        {
            if let Some(record) = self.nodes.get_mut(&previous) {
                record.cidrs.remove(&cidr);
            }
            self.drop_if_empty(&previous);
        }
        self.nodes
            .entry(hostname.to_string())
            .or_default()
            .cidrs
            .insert(cidr);
    }

    /// Unassigns a CIDR. Unknown CIDRs are ignored.
    pub fn endpoint_allowed_cidr_remove(&mut self, cidr: Ipv4Net) {
        match self.cidr_owner.remove(&cidr) {
            Some(owner) => {
                debug!(%cidr, %owner, "allowed cidr remove");
                if let Some(record) = self.nodes.get_mut(&owner) {
                    record.cidrs.remove(&cidr);
                }
                self.drop_if_empty(&owner);
            }
            None => trace!(%cidr, "remove for unknown cidr ignored"),
        }
    }

    /// Interface monitor callback. Events for other interfaces are ignored.
    pub fn on_iface_state_changed(&mut self, name: &str, state: IfaceState) {
        if name != self.config.iface_name {
            trace!(name, "event for foreign interface ignored");
            return;
        }
        match state {
            IfaceState::Up => {
                info!(name, "interface is up; scheduling resync");
                self.link_oper_up = true;
                self.force_resync();
            }
            IfaceState::Down => {
                info!(name, "interface went down");
                self.link_oper_up = false;
                self.in_sync_link = false;
            }
        }
    }

    /// Makes the next apply re-read live kernel state instead of trusting
    /// tracked deltas. Also clears a standing "not supported" verdict so the
    /// kernel is probed again.
    pub fn queue_resync(&mut self) {
        trace!("resync queued");
        if self.wireguard.is_unsupported() {
            self.wireguard.reset();
        }
        self.force_resync();
    }

    fn force_resync(&mut self) {
        self.in_sync_link = false;
        self.in_sync_addr = false;
        self.in_sync_rule = false;
        self.in_sync_device = false;
        self.route_table.queue_resync();
    }

    fn drop_if_empty(&mut self, hostname: &str) {
        if self.nodes.get(hostname).is_some_and(NodeRecord::is_empty) {
            self.nodes.remove(hostname);
        }
    }

    fn netlink_failed(&mut self, e: DataplaneError) -> Error {
        warn!(error = %e, "netlink operation failed; dropping client");
        self.netlink.invalidate();
        self.force_resync();
        Error::Dataplane(e)
    }

    fn wireguard_failed(&mut self, e: DataplaneError) -> Error {
        warn!(error = %e, "wireguard operation failed; dropping client");
        self.wireguard.invalidate();
        self.force_resync();
        Error::Dataplane(e)
    }

    /// Records the terminal no-kernel-support verdict and advertises the
    /// zero key. Applies stay dormant until the next queued resync.
    fn enter_unsupported(&mut self) -> Result<(), Error> {
        info!("wireguard not supported by the running kernel; standing down until next resync");
        self.wireguard.mark_unsupported();
        self.publish_key(Key::ZERO)
    }

    fn publish_key(&mut self, key: Key) -> Result<(), Error> {
        if self.advertised_key == Some(key) {
            return Ok(());
        }
        debug!(%key, "publishing local public key");
        (self.status)(key)?;
        self.advertised_key = Some(key);
        Ok(())
    }

    fn canonical_rule(&self) -> Rule {
        // Packets *not* carrying our mark route via our table; the mark
        // exempts the device's own encrypted traffic.
        Rule {
            priority: self.config.rule_priority,
            table: self.config.routing_table,
            fwmark: self.config.firewall_mark,
            invert: true,
        }
    }

    /// Converges the kernel toward the desired state. Returns the first
    /// error encountered; intermediate progress and all pending deltas
    /// survive for the next attempt.
    pub async fn apply(&mut self) -> Result<(), Error> {
        if !self.config.enabled {
            return self.apply_disabled().await;
        }
        if self.wireguard.is_unsupported() {
            trace!("wireguard unsupported; dormant until resync");
            return Ok(());
        }

        if !self.in_sync_link && !self.ensure_link().await? {
            return Ok(());
        }
        if !self.link_oper_up {
            return Ok(());
        }

        if !self.ensure_device().await? {
            return Ok(());
        }
        if let Some(public_key) = self.device_public_key {
            self.publish_key(public_key)?;
        }

        self.ensure_iface_addr().await?;
        self.ensure_rule().await?;

        let peers = effective_peers(
            &self.nodes,
            &self.config.hostname,
            self.device_public_key,
            self.config.listening_port,
        );
        self.ensure_peers(&peers).await?;
        self.ensure_routes(&peers).await?;
        Ok(())
    }

    /// Teardown path: remove the device, our rule, and our routes.
    async fn apply_disabled(&mut self) -> Result<(), Error> {
        trace!("wireguard disabled; ensuring teardown");
        let name = self.config.iface_name.clone();
        let netlink = self.netlink.get().map_err(Error::Dataplane)?;

        if !self.in_sync_link {
            match netlink.link_by_name(&name).await {
                Ok(Some(_)) => {
                    info!(iface = %name, "wireguard disabled; deleting link");
                    if let Err(e) = netlink.link_del(&name).await {
                        return Err(self.netlink_failed(e));
                    }
                }
                Ok(None) => {}
                Err(e) => return Err(self.netlink_failed(e)),
            }
            self.in_sync_link = true;
        }

        if !self.in_sync_rule {
            let rules = match netlink.rule_list().await {
                Ok(rules) => rules,
                Err(e) => return Err(self.netlink_failed(e)),
            };
            for rule in rules.iter().filter(|r| r.table == self.config.routing_table) {
                info!(?rule, "wireguard disabled; deleting routing rule");
                if let Err(e) = netlink.rule_del(rule).await {
                    return Err(self.netlink_failed(e));
                }
            }
            self.in_sync_rule = true;
        }

        self.route_table.set_routes(Vec::new());
        self.route_table.apply().await?;
        Ok(())
    }

    /// Ensures the link exists, has the right type and MTU, and is up.
    /// Returns false when the apply should stop here (link still coming up,
    /// or the kernel has no WireGuard support).
    async fn ensure_link(&mut self) -> Result<bool, Error> {
        let name = self.config.iface_name.clone();
        let netlink = self.netlink.get().map_err(Error::Dataplane)?;

        let mut link = match netlink.link_by_name(&name).await {
            Ok(link) => link,
            Err(e) => return Err(self.netlink_failed(e)),
        };

        if let Some(existing) = &link
            && existing.kind.as_deref().is_some_and(|kind| kind != "wireguard")
        {
            warn!(iface = %name, kind = ?existing.kind, "link exists with the wrong type; recreating");
            if let Err(e) = netlink.link_del(&name).await {
                return Err(self.netlink_failed(e));
            }
            link = None;
        }

        let mut link = match link {
            Some(link) => link,
            None => match netlink.link_add_wireguard(&name, self.config.mtu).await {
                Ok(link) => {
                    info!(iface = %name, mtu = self.config.mtu, "created wireguard link");
                    link
                }
                Err(e) if e.is_not_supported() => {
                    self.enter_unsupported()?;
                    return Ok(false);
                }
                Err(e) => return Err(self.netlink_failed(e)),
            },
        };
        self.iface_index = Some(link.index);

        if link.mtu != self.config.mtu {
            debug!(iface = %name, from = link.mtu, to = self.config.mtu, "correcting link mtu");
            if let Err(e) = netlink.link_set_mtu(&name, self.config.mtu).await {
                return Err(self.netlink_failed(e));
            }
        }

        if !link.admin_up {
            if let Err(e) = netlink.link_set_up(&name).await {
                return Err(self.netlink_failed(e));
            }
            link = match netlink.link_by_name(&name).await {
                Ok(Some(link)) => link,
                Ok(None) => {
                    return Err(Error::Dataplane(DataplaneError::Failed(format!(
                        "link {name} disappeared during bring-up"
                    ))));
                }
                Err(e) => return Err(self.netlink_failed(e)),
            };
            self.iface_index = Some(link.index);
        }

        self.link_oper_up = link.oper_up;
        if !link.oper_up {
            debug!(iface = %name, "link not operationally up; deferring configuration");
            return Ok(false);
        }
        self.in_sync_link = true;
        Ok(true)
    }

    /// Ensures the device is keyed and carries our port and firewall mark.
    /// Returns false when the kernel has no WireGuard support.
    async fn ensure_device(&mut self) -> Result<bool, Error> {
        if self.in_sync_device {
            return Ok(true);
        }
        let name = self.config.iface_name.clone();
        let wireguard = match self.wireguard.get() {
            Ok(client) => client,
            Err(e) if e.is_not_supported() => {
                self.enter_unsupported()?;
                return Ok(false);
            }
            Err(e) => {
                // Client open failure: start the next apply from scratch.
                self.netlink.invalidate();
                self.force_resync();
                return Err(Error::Dataplane(e));
            }
        };

        let device = match wireguard.device(&name).await {
            Ok(device) => device,
            Err(e) => return Err(self.wireguard_failed(e)),
        };
        self.applied_peers = device
            .peers
            .iter()
            .map(|p| {
                (
                    p.public_key,
                    PeerState {
                        endpoint: p.endpoint,
                        allowed_ips: p.allowed_ips.iter().copied().collect(),
                    },
                )
            })
            .collect();

        let mut update = DeviceUpdate::default();
        if device.private_key.is_zero() {
            let (private_key, public_key) = Key::generate_keypair();
            info!("generated new wireguard keypair");
            update.private_key = Some(private_key);
            self.device_public_key = Some(public_key);
        } else {
            let public_key = if device.public_key.is_zero() {
                device.private_key.public()
            } else {
                device.public_key
            };
            self.device_public_key = Some(public_key);
        }
        if device.listen_port != self.config.listening_port {
            update.listen_port = Some(self.config.listening_port);
        }
        if device.fwmark != self.config.firewall_mark {
            update.fwmark = Some(self.config.firewall_mark);
        }

        if update.private_key.is_some() || update.listen_port.is_some() || update.fwmark.is_some() {
            debug!(iface = %name, "configuring device identity");
            if let Err(e) = wireguard.configure_device(&name, update).await {
                return Err(self.wireguard_failed(e));
            }
        }
        self.in_sync_device = true;
        Ok(true)
    }

    /// Converges the link's IPv4 addresses on the configured interface
    /// address (or none).
    async fn ensure_iface_addr(&mut self) -> Result<(), Error> {
        if self.in_sync_addr {
            return Ok(());
        }
        let name = self.config.iface_name.clone();
        let netlink = self.netlink.get().map_err(Error::Dataplane)?;
        let want = self
            .nodes
            .get(&self.config.hostname)
            .and_then(|record| record.iface_addr);

        let have = match netlink.addr_list(&name).await {
            Ok(addrs) => addrs,
            Err(e) => return Err(self.netlink_failed(e)),
        };
        for addr in &have {
            if Some(*addr) != want {
                debug!(%addr, "removing extraneous interface address");
                if let Err(e) = netlink.addr_del(&name, *addr).await {
                    return Err(self.netlink_failed(e));
                }
            }
        }
        if let Some(want) = want
            && !have.contains(&want)
        {
            debug!(addr = %want, "assigning interface address");
            if let Err(e) = netlink.addr_add(&name, want).await {
                return Err(self.netlink_failed(e));
            }
        }
        self.in_sync_addr = true;
        Ok(())
    }

    /// Ensures exactly the canonical routing rule targets our table: strays
    /// referencing the table are removed, the canonical rule is added when
    /// absent. Only runs on a resync; the rule flag is never cleared alone.
    async fn ensure_rule(&mut self) -> Result<(), Error> {
        if self.in_sync_rule {
            return Ok(());
        }
        let netlink = self.netlink.get().map_err(Error::Dataplane)?;
        let canonical = self.canonical_rule();

        let rules = match netlink.rule_list().await {
            Ok(rules) => rules,
            Err(e) => return Err(self.netlink_failed(e)),
        };
        let mut present = false;
        for rule in rules.iter().filter(|r| r.table == self.config.routing_table) {
            if *rule == canonical {
                present = true;
            } else {
                debug!(?rule, "removing stray rule for our table");
                if let Err(e) = netlink.rule_del(rule).await {
                    return Err(self.netlink_failed(e));
                }
            }
        }
        if !present {
            debug!(rule = ?canonical, "adding routing rule");
            if let Err(e) = netlink.rule_add(&canonical).await {
                return Err(self.netlink_failed(e));
            }
        }
        self.in_sync_rule = true;
        Ok(())
    }

    /// Diffs the desired peer set against the device and submits one batched
    /// configuration change.
    async fn ensure_peers(&mut self, peers: &EffectivePeers) -> Result<(), Error> {
        let mut updates: Vec<PeerUpdate> = Vec::new();
        for key in self.applied_peers.keys() {
            if !peers.by_key.contains_key(key) {
                debug!(%key, "removing peer");
                updates.push(PeerUpdate::remove(*key));
            }
        }
        for (key, want) in &peers.by_key {
            match self.applied_peers.get(key) {
                Some(have) if have == want => {}
                _ => {
                    debug!(%key, "configuring peer");
                    updates.push(PeerUpdate {
                        public_key: *key,
                        remove: false,
                        endpoint: want.endpoint,
                        replace_allowed_ips: true,
                        allowed_ips: want.allowed_ips.iter().copied().collect(),
                    });
                }
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        let name = self.config.iface_name.clone();
        let wireguard = self.wireguard.get().map_err(Error::Dataplane)?;
        let update = DeviceUpdate {
            peers: updates,
            ..Default::default()
        };
        if let Err(e) = wireguard.configure_device(&name, update).await {
            return Err(self.wireguard_failed(e));
        }
        self.applied_peers = peers.by_key.clone();
        Ok(())
    }

    /// Hands the full desired route set to the route table and flushes it.
    /// CIDRs of effective peers route via the device; CIDRs of other known
    /// nodes get a throw route so the main table takes over; local CIDRs get
    /// nothing.
    async fn ensure_routes(&mut self, peers: &EffectivePeers) -> Result<(), Error> {
        let Some(link_index) = self.iface_index else {
            return Ok(());
        };
        let mut targets = Vec::new();
        for (cidr, owner) in &self.cidr_owner {
            if *owner == self.config.hostname {
                continue;
            }
            let route = if peers.hosts.contains(owner) {
                Route {
                    dst: *cidr,
                    table: self.config.routing_table,
                    protocol: self.config.route_protocol,
                    kind: RouteKind::Unicast,
                    scope: RouteScope::Link,
                    link_index: Some(link_index),
                }
            } else {
                Route {
                    dst: *cidr,
                    table: self.config.routing_table,
                    protocol: self.config.route_protocol,
                    kind: RouteKind::Throw,
                    scope: RouteScope::Universe,
                    link_index: None,
                }
            };
            targets.push(route);
        }
        self.route_table.set_routes(targets);
        self.route_table.apply().await
    }
}
