//! Reconciler for one kernel routing table.
//!
//! Holds the desired route set for a single table and converges the kernel
//! toward it. Deletions are grace-windowed: a route that drops out of the
//! desired set is only physically removed once it has stayed undesired for
//! the configured cleanup delay, so a momentary absence during a peer
//! re-shuffle does not flap the kernel state.

use crate::clock::Clock;
use crate::dataplane::{ClientManager, DataplaneError, NetlinkClient, NetlinkFactory, Route};
use crate::error::Error;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub struct RouteTable {
    table: u32,
    protocol: u8,
    cleanup_delay: Duration,
    clock: Arc<dyn Clock>,
    netlink: ClientManager<Arc<dyn NetlinkClient>>,

    /// Desired routes by route key.
    desired: BTreeMap<String, Route>,
    /// Routes we believe the kernel holds, by route key.
    applied: BTreeMap<String, Route>,
    /// Departed routes awaiting deletion, with their deadline.
    pending_delete: BTreeMap<String, Instant>,
    resync_pending: bool,
}

impl RouteTable {
    pub fn new(
        table: u32,
        protocol: u8,
        cleanup_delay: Duration,
        clock: Arc<dyn Clock>,
        netlink_factory: NetlinkFactory,
    ) -> Self {
        Self {
            table,
            protocol,
            cleanup_delay,
            clock,
            netlink: ClientManager::new(netlink_factory),
            desired: BTreeMap::new(),
            applied: BTreeMap::new(),
            pending_delete: BTreeMap::new(),
            // First apply always reads the kernel.
            resync_pending: true,
        }
    }

    /// Replaces the desired route set for this table.
    pub fn set_routes(&mut self, routes: Vec<Route>) {
        trace!(table = self.table, count = routes.len(), "desired routes set");
        self.desired = routes.into_iter().map(|r| (r.key(), r)).collect();
    }

    /// Forces the next apply to list live routes instead of trusting the
    /// applied view.
    pub fn queue_resync(&mut self) {
        self.resync_pending = true;
    }

    fn failed(&mut self, e: DataplaneError) -> Error {
        warn!(table = self.table, error = %e, "route programming failed; dropping netlink client");
        self.netlink.invalidate();
        self.resync_pending = true;
        Error::Dataplane(e)
    }

    /// Physically deletes pending routes whose deadline has passed.
    async fn flush_expired(
        &mut self,
        client: &Arc<dyn NetlinkClient>,
        now: Instant,
    ) -> Result<(), Error> {
        let expired: Vec<String> = self
            .pending_delete
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            if let Some(route) = self.applied.get(&key) {
                debug!(table = self.table, %key, "deleting departed route");
                if let Err(e) = client.route_del(route).await {
                    return Err(self.failed(e));
                }
            }
            self.applied.remove(&key);
            self.pending_delete.remove(&key);
        }
        Ok(())
    }

    /// Converges the kernel table toward the desired set. Returns the first
    /// error; the desired set and pending deletions survive for a retry.
    pub async fn apply(&mut self) -> Result<(), Error> {
        let client = match self.netlink.get() {
            Ok(client) => client,
            Err(e) => {
                self.resync_pending = true;
                return Err(Error::Dataplane(e));
            }
        };

        if self.resync_pending {
            trace!(table = self.table, "resyncing against live routes");
            let live = match client.route_list(self.table).await {
                Ok(live) => live,
                Err(e) => return Err(self.failed(e)),
            };
            self.applied = live
                .into_iter()
                .filter(|r| r.protocol == self.protocol)
                .map(|r| (r.key(), r))
                .collect();
            let applied = &self.applied;
            self.pending_delete.retain(|key, _| applied.contains_key(key));
        }

        let now = self.clock.now();

        // Record departures and cancel deletions for routes desired again.
        for key in self.applied.keys() {
            if !self.desired.contains_key(key) {
                self.pending_delete
                    .entry(key.clone())
                    .or_insert_with(|| now + self.cleanup_delay);
            }
        }
        let desired = &self.desired;
        self.pending_delete.retain(|key, _| !desired.contains_key(key));

        // A destination desired again under a different key is a
        // contradiction, not an absence; replace it immediately so the
        // kernel never holds two routes for one destination.
        for (key, deadline) in self.pending_delete.iter_mut() {
            if let Some(route) = self.applied.get(key)
                && self.desired.values().any(|d| d.dst == route.dst)
            {
                *deadline = now;
            }
        }

        self.flush_expired(&client, now).await?;

        // Additions and modifications.
        let changes: Vec<(String, Route, Option<Route>)> = self
            .desired
            .iter()
            .filter_map(|(key, want)| match self.applied.get(key) {
                Some(have) if have == want => None,
                Some(have) => Some((key.clone(), want.clone(), Some(have.clone()))),
                None => Some((key.clone(), want.clone(), None)),
            })
            .collect();

        for (key, want, old) in changes {
            if let Some(old) = old
                && let Err(e) = client.route_del(&old).await
            {
                return Err(self.failed(e));
            }
            debug!(table = self.table, %key, "programming route");
            if let Err(e) = client.route_add(&want).await {
                return Err(self.failed(e));
            }
            self.applied.insert(key, want);
        }

        // Second clock read: with the real clock this is a no-op, but it
        // lets tests with an auto-incrementing clock drain the grace window
        // within a single apply.
        let now = self.clock.now();
        self.flush_expired(&client, now).await?;

        self.resync_pending = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::mock::MockClock;
    use crate::dataplane::mock::{Failure, MockDataplane};
    use crate::dataplane::{RouteKind, RouteScope};

    const TABLE: u32 = 99;
    const PROTOCOL: u8 = 80;
    const DELAY: Duration = Duration::from_secs(10);

    fn unicast(dst: &str, link_index: u32) -> Route {
        Route {
            dst: dst.parse().unwrap(),
            table: TABLE,
            protocol: PROTOCOL,
            kind: RouteKind::Unicast,
            scope: RouteScope::Link,
            link_index: Some(link_index),
        }
    }

    fn throw(dst: &str) -> Route {
        Route {
            dst: dst.parse().unwrap(),
            table: TABLE,
            protocol: PROTOCOL,
            kind: RouteKind::Throw,
            scope: RouteScope::Universe,
            link_index: None,
        }
    }

    fn rig() -> (MockDataplane, Arc<MockClock>, RouteTable) {
        let dataplane = MockDataplane::new();
        let clock = Arc::new(MockClock::new());
        let table = RouteTable::new(
            TABLE,
            PROTOCOL,
            DELAY,
            clock.clone(),
            dataplane.netlink_factory(),
        );
        (dataplane, clock, table)
    }

    #[tokio::test]
    async fn test_adds_routes_and_second_apply_is_noop() {
        let (dataplane, _clock, mut table) = rig();

        table.set_routes(vec![unicast("192.168.1.0/24", 7), throw("192.168.4.0/26")]);
        table.apply().await.unwrap();

        {
            let s = dataplane.state();
            assert_eq!(s.added_route_keys.len(), 2);
            assert!(s.added_route_keys.contains("99-7-192.168.1.0/24"));
            assert!(s.added_route_keys.contains("99-0-192.168.4.0/26"));
            assert!(s.deleted_route_keys.is_empty());
        }

        dataplane.reset_deltas();
        table.apply().await.unwrap();
        let s = dataplane.state();
        assert!(s.added_route_keys.is_empty());
        assert!(s.deleted_route_keys.is_empty());
    }

    #[tokio::test]
    async fn test_departed_route_survives_grace_window() {
        let (dataplane, clock, mut table) = rig();

        table.set_routes(vec![unicast("192.168.1.0/24", 7)]);
        table.apply().await.unwrap();

        table.set_routes(vec![]);
        table.apply().await.unwrap();
        assert!(dataplane.state().deleted_route_keys.is_empty());
        assert_eq!(dataplane.state().routes.len(), 1);

        clock.advance(DELAY + Duration::from_secs(1));
        table.apply().await.unwrap();
        let s = dataplane.state();
        assert!(s.deleted_route_keys.contains("99-7-192.168.1.0/24"));
        assert!(s.routes.is_empty());
    }

    #[tokio::test]
    async fn test_redesired_route_cancels_pending_delete() {
        let (dataplane, clock, mut table) = rig();

        let route = unicast("192.168.1.0/24", 7);
        table.set_routes(vec![route.clone()]);
        table.apply().await.unwrap();

        table.set_routes(vec![]);
        table.apply().await.unwrap();

        table.set_routes(vec![route]);
        clock.advance(DELAY + Duration::from_secs(1));
        dataplane.reset_deltas();
        table.apply().await.unwrap();

        let s = dataplane.state();
        assert!(s.deleted_route_keys.is_empty());
        assert!(s.added_route_keys.is_empty());
        assert_eq!(s.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_auto_incrementing_clock_drains_grace_in_one_apply() {
        let (dataplane, clock, mut table) = rig();
        clock.set_auto_increment(DELAY + Duration::from_secs(1));

        table.set_routes(vec![unicast("192.168.1.0/24", 7)]);
        table.apply().await.unwrap();

        table.set_routes(vec![]);
        table.apply().await.unwrap();
        let s = dataplane.state();
        assert!(s.deleted_route_keys.contains("99-7-192.168.1.0/24"));
        assert!(s.routes.is_empty());
    }

    #[tokio::test]
    async fn test_kind_flip_replaces_route_without_grace() {
        let (dataplane, _clock, mut table) = rig();

        table.set_routes(vec![unicast("192.168.3.0/24", 7)]);
        table.apply().await.unwrap();

        // Same destination flips to a throw route under a different key.
        table.set_routes(vec![throw("192.168.3.0/24")]);
        dataplane.reset_deltas();
        table.apply().await.unwrap();

        let s = dataplane.state();
        assert!(s.deleted_route_keys.contains("99-7-192.168.3.0/24"));
        assert!(s.added_route_keys.contains("99-0-192.168.3.0/24"));
        assert_eq!(s.routes.len(), 1);
    }

    #[tokio::test]
    async fn test_resync_cleans_stray_routes_but_spares_foreign_protocols() {
        let (dataplane, clock, mut table) = rig();
        clock.set_auto_increment(DELAY + Duration::from_secs(1));

        let stray = unicast("192.168.9.0/24", 7);
        let foreign = Route {
            protocol: 4,
            ..throw("10.0.0.0/8")
        };
        {
            let mut s = dataplane.state();
            s.routes.insert(stray.key(), stray.clone());
            s.routes.insert(foreign.key(), foreign.clone());
        }

        table.apply().await.unwrap();

        let s = dataplane.state();
        assert!(s.deleted_route_keys.contains(&stray.key()));
        assert!(s.routes.contains_key(&foreign.key()));
    }

    #[tokio::test]
    async fn test_delete_failure_surfaces_and_is_retried() {
        let (dataplane, clock, mut table) = rig();
        clock.set_auto_increment(DELAY + Duration::from_secs(1));

        table.set_routes(vec![unicast("192.168.1.0/24", 7)]);
        table.apply().await.unwrap();

        dataplane.set_failures(&[Failure::RouteDel]);
        table.set_routes(vec![]);
        assert!(table.apply().await.is_err());

        table.apply().await.unwrap();
        let s = dataplane.state();
        assert!(s.routes.is_empty());
        assert_eq!(s.num_new_netlink_calls, 2);
    }

    #[tokio::test]
    async fn test_failure_drops_client_and_next_apply_recovers() {
        let (dataplane, _clock, mut table) = rig();
        dataplane.set_failures(&[Failure::RouteAdd]);

        table.set_routes(vec![unicast("192.168.1.0/24", 7)]);
        assert!(table.apply().await.is_err());
        assert_eq!(dataplane.state().num_new_netlink_calls, 1);

        table.apply().await.unwrap();
        let s = dataplane.state();
        assert_eq!(s.num_new_netlink_calls, 2);
        assert!(s.routes.contains_key("99-7-192.168.1.0/24"));
    }
}
