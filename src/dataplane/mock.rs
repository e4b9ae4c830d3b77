//! In-memory dataplane for tests: links, rules, routes, and a WireGuard
//! device, with per-operation failure injection and change tracking.

use super::{
    DataplaneError, Device, DeviceUpdate, Link, NetlinkClient, NetlinkFactory, Peer, Route, Rule,
    WireguardClient, WireguardFactory,
};
use crate::key::Key;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Operations that can be made to fail. Failures are one-shot unless
/// `persist_failures` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Failure {
    NewNetlink,
    NewWireguard,
    NewWireguardNotSupported,
    LinkAdd,
    LinkAddNotSupported,
    LinkByName,
    LinkDel,
    LinkSetUp,
    LinkSetMtu,
    AddrList,
    AddrAdd,
    AddrDel,
    RuleList,
    RuleAdd,
    RuleDel,
    RouteList,
    RouteAdd,
    RouteDel,
    DeviceByName,
    ConfigureDevice,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MockLink {
    pub index: u32,
    pub kind: Option<String>,
    pub mtu: u32,
    pub admin_up: bool,
    pub oper_up: bool,
    pub addrs: Vec<Ipv4Addr>,
    pub private_key: Key,
    pub public_key: Key,
    pub listen_port: u16,
    pub fwmark: u32,
    pub peers: BTreeMap<Key, Peer>,
}

#[derive(Default)]
pub(crate) struct MockState {
    pub links: BTreeMap<String, MockLink>,
    pub rules: Vec<Rule>,
    pub routes: BTreeMap<String, Route>,

    pub added_rules: Vec<Rule>,
    pub deleted_rules: Vec<Rule>,
    pub added_route_keys: HashSet<String>,
    pub deleted_route_keys: HashSet<String>,
    pub deleted_links: HashSet<String>,

    pub num_new_netlink_calls: usize,
    pub num_new_wireguard_calls: usize,
    pub num_link_add_calls: usize,
    pub num_link_del_calls: usize,
    pub num_rule_add_calls: usize,
    pub num_rule_del_calls: usize,

    pub wireguard_open: bool,
    pub wireguard_config_updated: bool,

    /// Newly created links come up as soon as they are set admin-up.
    pub immediate_link_up: bool,

    pub persist_failures: bool,
    failures: HashSet<Failure>,

    next_index: u32,
}

impl MockState {
    fn take_failure(&mut self, failure: Failure) -> bool {
        if self.persist_failures {
            self.failures.contains(&failure)
        } else {
            self.failures.remove(&failure)
        }
    }

    fn fail(failure: Failure) -> DataplaneError {
        DataplaneError::Failed(format!("simulated {failure:?} failure"))
    }

    fn link_view(&self, name: &str) -> Option<Link> {
        self.links.get(name).map(|l| Link {
            index: l.index,
            name: name.to_string(),
            kind: l.kind.clone(),
            mtu: l.mtu,
            admin_up: l.admin_up,
            oper_up: l.oper_up,
        })
    }
}

/// Handle shared between a test, its factories, and the clients they open.
#[derive(Clone)]
pub(crate) struct MockDataplane {
    state: Arc<Mutex<MockState>>,
}

impl MockDataplane {
    pub(crate) fn new() -> Self {
        let state = MockState {
            next_index: 1,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock dataplane poisoned")
    }

    pub(crate) fn netlink_factory(&self) -> NetlinkFactory {
        let state = self.state.clone();
        Box::new(move || {
            let mut s = state.lock().expect("mock dataplane poisoned");
            s.num_new_netlink_calls += 1;
            if s.take_failure(Failure::NewNetlink) {
                return Err(MockState::fail(Failure::NewNetlink));
            }
            Ok(Arc::new(MockNetlinkClient {
                state: state.clone(),
            }) as Arc<dyn NetlinkClient>)
        })
    }

    pub(crate) fn wireguard_factory(&self) -> WireguardFactory {
        let state = self.state.clone();
        Box::new(move || {
            let mut s = state.lock().expect("mock dataplane poisoned");
            s.num_new_wireguard_calls += 1;
            if s.take_failure(Failure::NewWireguardNotSupported) {
                return Err(DataplaneError::NotSupported);
            }
            if s.take_failure(Failure::NewWireguard) {
                return Err(MockState::fail(Failure::NewWireguard));
            }
            s.wireguard_open = true;
            Ok(Arc::new(MockWireguardClient {
                state: state.clone(),
            }) as Arc<dyn WireguardClient>)
        })
    }

    /// Seeds a link, as if some other tool had created it.
    pub(crate) fn add_iface(&self, index: u32, name: &str, admin_up: bool, oper_up: bool) {
        let mut s = self.state();
        s.next_index = s.next_index.max(index + 1);
        s.links.insert(
            name.to_string(),
            MockLink {
                index,
                kind: Some("wireguard".to_string()),
                mtu: 0,
                admin_up,
                oper_up,
                ..Default::default()
            },
        );
    }

    pub(crate) fn set_iface(&self, name: &str, admin_up: bool, oper_up: bool) {
        let mut s = self.state();
        if let Some(link) = s.links.get_mut(name) {
            link.admin_up = admin_up;
            link.oper_up = oper_up;
        }
    }

    pub(crate) fn set_failures(&self, failures: &[Failure]) {
        self.state().failures = failures.iter().copied().collect();
    }

    pub(crate) fn set_persist_failures(&self, persist: bool) {
        self.state().persist_failures = persist;
    }

    pub(crate) fn set_immediate_link_up(&self, immediate: bool) {
        self.state().immediate_link_up = immediate;
    }

    /// Clears counters and recorded changes, leaving dataplane state alone.
    pub(crate) fn reset_deltas(&self) {
        let mut s = self.state();
        s.added_rules.clear();
        s.deleted_rules.clear();
        s.added_route_keys.clear();
        s.deleted_route_keys.clear();
        s.deleted_links.clear();
        s.num_new_netlink_calls = 0;
        s.num_new_wireguard_calls = 0;
        s.num_link_add_calls = 0;
        s.num_link_del_calls = 0;
        s.num_rule_add_calls = 0;
        s.num_rule_del_calls = 0;
        s.wireguard_config_updated = false;
    }
}

struct MockNetlinkClient {
    state: Arc<Mutex<MockState>>,
}

impl MockNetlinkClient {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock dataplane poisoned")
    }
}

#[async_trait]
impl NetlinkClient for MockNetlinkClient {
    async fn link_by_name(&self, name: &str) -> Result<Option<Link>, DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::LinkByName) {
            return Err(MockState::fail(Failure::LinkByName));
        }
        Ok(s.link_view(name))
    }

    async fn link_add_wireguard(&self, name: &str, mtu: u32) -> Result<Link, DataplaneError> {
        let mut s = self.lock();
        s.num_link_add_calls += 1;
        if s.take_failure(Failure::LinkAddNotSupported) {
            return Err(DataplaneError::NotSupported);
        }
        if s.take_failure(Failure::LinkAdd) {
            return Err(MockState::fail(Failure::LinkAdd));
        }
        let index = s.next_index;
        s.next_index += 1;
        s.links.insert(
            name.to_string(),
            MockLink {
                index,
                kind: Some("wireguard".to_string()),
                mtu,
                admin_up: false,
                oper_up: false,
                ..Default::default()
            },
        );
        Ok(s.link_view(name).expect("link just inserted"))
    }

    async fn link_del(&self, name: &str) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        s.num_link_del_calls += 1;
        if s.take_failure(Failure::LinkDel) {
            return Err(MockState::fail(Failure::LinkDel));
        }
        if s.links.remove(name).is_none() {
            return Err(DataplaneError::Failed(format!("no such link {name}")));
        }
        s.deleted_links.insert(name.to_string());
        Ok(())
    }

    async fn link_set_up(&self, name: &str) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::LinkSetUp) {
            return Err(MockState::fail(Failure::LinkSetUp));
        }
        let immediate = s.immediate_link_up;
        match s.links.get_mut(name) {
            Some(link) => {
                link.admin_up = true;
                if immediate {
                    link.oper_up = true;
                }
                Ok(())
            }
            None => Err(DataplaneError::Failed(format!("no such link {name}"))),
        }
    }

    async fn link_set_mtu(&self, name: &str, mtu: u32) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::LinkSetMtu) {
            return Err(MockState::fail(Failure::LinkSetMtu));
        }
        match s.links.get_mut(name) {
            Some(link) => {
                link.mtu = mtu;
                Ok(())
            }
            None => Err(DataplaneError::Failed(format!("no such link {name}"))),
        }
    }

    async fn addr_list(&self, link: &str) -> Result<Vec<Ipv4Addr>, DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::AddrList) {
            return Err(MockState::fail(Failure::AddrList));
        }
        Ok(s.links.get(link).map(|l| l.addrs.clone()).unwrap_or_default())
    }

    async fn addr_add(&self, link: &str, addr: Ipv4Addr) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::AddrAdd) {
            return Err(MockState::fail(Failure::AddrAdd));
        }
        match s.links.get_mut(link) {
            Some(l) => {
                if !l.addrs.contains(&addr) {
                    l.addrs.push(addr);
                }
                Ok(())
            }
            None => Err(DataplaneError::Failed(format!("no such link {link}"))),
        }
    }

    async fn addr_del(&self, link: &str, addr: Ipv4Addr) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::AddrDel) {
            return Err(MockState::fail(Failure::AddrDel));
        }
        match s.links.get_mut(link) {
            Some(l) => {
                l.addrs.retain(|a| *a != addr);
                Ok(())
            }
            None => Err(DataplaneError::Failed(format!("no such link {link}"))),
        }
    }

    async fn rule_list(&self) -> Result<Vec<Rule>, DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::RuleList) {
            return Err(MockState::fail(Failure::RuleList));
        }
        Ok(s.rules.clone())
    }

    async fn rule_add(&self, rule: &Rule) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        s.num_rule_add_calls += 1;
        if s.take_failure(Failure::RuleAdd) {
            return Err(MockState::fail(Failure::RuleAdd));
        }
        s.rules.push(*rule);
        s.added_rules.push(*rule);
        Ok(())
    }

    async fn rule_del(&self, rule: &Rule) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        s.num_rule_del_calls += 1;
        if s.take_failure(Failure::RuleDel) {
            return Err(MockState::fail(Failure::RuleDel));
        }
        match s.rules.iter().position(|r| r == rule) {
            Some(pos) => {
                s.rules.remove(pos);
                s.deleted_rules.push(*rule);
                Ok(())
            }
            None => Err(DataplaneError::Failed(format!("no such rule {rule:?}"))),
        }
    }

    async fn route_list(&self, table: u32) -> Result<Vec<Route>, DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::RouteList) {
            return Err(MockState::fail(Failure::RouteList));
        }
        Ok(s.routes
            .values()
            .filter(|r| r.table == table)
            .cloned()
            .collect())
    }

    async fn route_add(&self, route: &Route) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::RouteAdd) {
            return Err(MockState::fail(Failure::RouteAdd));
        }
        let key = route.key();
        s.routes.insert(key.clone(), route.clone());
        s.added_route_keys.insert(key);
        Ok(())
    }

    async fn route_del(&self, route: &Route) -> Result<(), DataplaneError> {
        let mut s = self.lock();
        if s.take_failure(Failure::RouteDel) {
            return Err(MockState::fail(Failure::RouteDel));
        }
        let key = route.key();
        if s.routes.remove(&key).is_none() {
            return Err(DataplaneError::Failed(format!("no such route {key}")));
        }
        s.deleted_route_keys.insert(key);
        Ok(())
    }
}

struct MockWireguardClient {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl WireguardClient for MockWireguardClient {
    async fn device(&self, name: &str) -> Result<Device, DataplaneError> {
        let mut s = self.state.lock().expect("mock dataplane poisoned");
        if s.take_failure(Failure::DeviceByName) {
            return Err(MockState::fail(Failure::DeviceByName));
        }
        match s.links.get(name) {
            Some(link) => Ok(Device {
                private_key: link.private_key,
                public_key: link.public_key,
                listen_port: link.listen_port,
                fwmark: link.fwmark,
                peers: link.peers.values().cloned().collect(),
            }),
            None => Err(DataplaneError::Failed(format!("no such device {name}"))),
        }
    }

    async fn configure_device(
        &self,
        name: &str,
        update: DeviceUpdate,
    ) -> Result<(), DataplaneError> {
        let mut s = self.state.lock().expect("mock dataplane poisoned");
        if s.take_failure(Failure::ConfigureDevice) {
            return Err(MockState::fail(Failure::ConfigureDevice));
        }
        s.wireguard_config_updated = true;
        let link = s
            .links
            .get_mut(name)
            .ok_or_else(|| DataplaneError::Failed(format!("no such device {name}")))?;

        if let Some(private_key) = update.private_key {
            link.private_key = private_key;
            link.public_key = private_key.public();
        }
        if let Some(port) = update.listen_port {
            link.listen_port = port;
        }
        if let Some(fwmark) = update.fwmark {
            link.fwmark = fwmark;
        }

        for peer in update.peers {
            if peer.remove {
                link.peers.remove(&peer.public_key);
                continue;
            }
            let entry = link.peers.entry(peer.public_key).or_insert_with(|| Peer {
                public_key: peer.public_key,
                endpoint: None,
                allowed_ips: Vec::new(),
            });
            if peer.endpoint.is_some() {
                entry.endpoint = peer.endpoint;
            }
            if peer.replace_allowed_ips {
                entry.allowed_ips = peer.allowed_ips;
            } else {
                entry.allowed_ips.extend(peer.allowed_ips);
            }
        }
        Ok(())
    }
}
