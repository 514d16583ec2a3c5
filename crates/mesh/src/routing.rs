//! OGM-driven neighbor and route tables.
//!
//! Periodic beacons establish who is one hop away and the best next hop
//! toward every known origin. The metric byte is a cumulative path cost,
//! lower is better; each forwarder adds its receiving link's cost, so a
//! metric can never improve downstream and route selection converges.

use std::collections::HashMap;

use qmesh_codec::NodeId;
use serde::Serialize;

/// A directly heard peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborEntry {
    /// Link the neighbor was last heard on
    pub link: String,
    /// Unix seconds of the last beacon from this neighbor
    pub last_seen_ts: u64,
    /// Local link metric observed for this neighbor
    pub metric: u8,
}

/// Best known path toward an origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    /// Neighbor to hand frames to
    pub next_hop: NodeId,
    /// Cumulative path cost via that neighbor
    pub metric: u8,
    /// Unix seconds of the observation that set this route
    pub updated_ts: u64,
}

/// Neighbor set and per-origin best next hop.
///
/// Mutated only by the mesh receive worker; readers take a snapshot or a
/// short-held read lock.
#[derive(Debug)]
pub struct RoutingTable {
    node_id: NodeId,
    neighbors: HashMap<NodeId, NeighborEntry>,
    routes: HashMap<NodeId, RouteEntry>,
    neighbor_timeout_s: u64,
}

impl RoutingTable {
    /// Build an empty table for the given local node.
    pub fn new(node_id: NodeId, neighbor_timeout_s: u64) -> Self {
        RoutingTable {
            node_id,
            neighbors: HashMap::new(),
            routes: HashMap::new(),
            neighbor_timeout_s,
        }
    }

    /// Record an accepted OGM.
    ///
    /// `path_metric` is the beacon's cumulative cost including the link it
    /// arrived on; `link_metric` is the local cost of that link alone. The
    /// route toward `origin` switches only to a strictly better path; on an
    /// equal metric the incumbent stays, trading churn for stability. A
    /// fresh observation from the current next hop always supersedes the
    /// stored metric.
    pub fn observe_ogm(
        &mut self,
        origin: NodeId,
        prev_hop: NodeId,
        path_metric: u8,
        link_metric: u8,
        link: &str,
        now_ts: u64,
    ) {
        if prev_hop == self.node_id {
            return;
        }

        self.neighbors.insert(
            prev_hop,
            NeighborEntry {
                link: link.to_string(),
                last_seen_ts: now_ts,
                metric: link_metric,
            },
        );

        if origin == self.node_id {
            return;
        }

        match self.routes.get(&origin) {
            Some(existing) if existing.next_hop == prev_hop => {
                self.routes.insert(
                    origin,
                    RouteEntry {
                        next_hop: prev_hop,
                        metric: path_metric,
                        updated_ts: now_ts,
                    },
                );
            }
            Some(existing) if existing.metric <= path_metric => {}
            _ => {
                self.routes.insert(
                    origin,
                    RouteEntry {
                        next_hop: prev_hop,
                        metric: path_metric,
                        updated_ts: now_ts,
                    },
                );
            }
        }
    }

    /// Best next hop toward an origin, with the link it was heard on.
    pub fn next_hop(&self, origin: &NodeId) -> Option<(NodeId, String)> {
        let route = self.routes.get(origin)?;
        let neighbor = self.neighbors.get(&route.next_hop)?;
        Some((route.next_hop, neighbor.link.clone()))
    }

    /// Whether a node is currently a direct neighbor.
    pub fn is_neighbor(&self, node: &NodeId) -> bool {
        self.neighbors.contains_key(node)
    }

    /// Drop neighbors not refreshed within the timeout and invalidate
    /// routes whose next hop disappeared. Returns (neighbors, routes)
    /// removed.
    pub fn expire(&mut self, now_ts: u64) -> (usize, usize) {
        let timeout = self.neighbor_timeout_s;
        let before_neighbors = self.neighbors.len();
        self.neighbors
            .retain(|_, n| now_ts.saturating_sub(n.last_seen_ts) <= timeout);

        let before_routes = self.routes.len();
        let live: Vec<NodeId> = self.neighbors.keys().copied().collect();
        self.routes.retain(|_, r| live.contains(&r.next_hop));

        (
            before_neighbors - self.neighbors.len(),
            before_routes - self.routes.len(),
        )
    }

    /// Snapshot of the neighbor set.
    pub fn neighbors(&self) -> Vec<(NodeId, NeighborEntry)> {
        self.neighbors.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Snapshot of the route map.
    pub fn routes(&self) -> Vec<(NodeId, RouteEntry)> {
        self.routes.iter().map(|(k, v)| (*k, v.clone())).collect()
    }
}
