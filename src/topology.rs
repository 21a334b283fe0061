//! Topology registry: every discovered node keyed by IP
//!
//! Peers come from the connection scanner, intermediate nodes from hop
//! traces. A node is created once, when its IP is first located; later
//! sightings only refresh its metadata, so positions never jitter.

use crate::error::Result;
use crate::geo::{great_circle_path, GeoCoordinate, GreatCircle, SpaceVector};
use crate::lock;
use crate::net_geo::resolver::{Lookup, Resolver};
use crate::net_geo::scanner::{ConnectionRecord, Scanner};
use crate::net_geo::tracer::HopTracer;
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info, warn};

/// Sphere radius nodes are placed on, relative to a unit globe
pub const DEFAULT_NODE_RADIUS: f64 = 1.4;

// ============================================================================
// Node
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    #[serde(rename = "self")]
    SelfHost,
    Peer,
    TracerouteHop,
    TracerouteTarget,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::SelfHost => "self",
            NodeRole::Peer => "peer",
            NodeRole::TracerouteHop => "traceroute-hop",
            NodeRole::TracerouteTarget => "traceroute-target",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What the node was last seen as
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeMetadata {
    /// The local host
    Host,
    Connection(ConnectionRecord),
    /// Found while tracing the path to `target`
    Trace { target: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TopologyNode {
    pub ip: String,
    pub location: GeoCoordinate,
    pub role: NodeRole,
    pub metadata: NodeMetadata,
    /// Where this node's link starts: self for peers, previous hop for hops
    pub origin: Option<GeoCoordinate>,
    pub position: SpaceVector,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl TopologyNode {
    pub fn new(
        ip: impl Into<String>,
        location: GeoCoordinate,
        role: NodeRole,
        metadata: NodeMetadata,
        origin: Option<GeoCoordinate>,
        radius: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            ip: ip.into(),
            location,
            role,
            metadata,
            origin,
            position: location.to_space(radius),
            created_at: now,
            last_seen: now,
        }
    }

    /// Connection state for peers, role name otherwise
    pub fn state(&self) -> &str {
        match &self.metadata {
            NodeMetadata::Connection(record) => &record.state,
            _ => self.role.as_str(),
        }
    }

    /// Path from `origin` to this node at the node's radius
    pub fn link(&self, resolution: f64) -> Option<GreatCircle> {
        let origin = self.origin?;
        Some(great_circle_path(
            origin.to_plane(),
            self.location.to_plane(),
            self.position.length(),
            resolution,
        ))
    }
}

/// Role and metadata for a node about to be upserted
#[derive(Clone, Debug)]
pub struct NodeContext {
    pub role: NodeRole,
    pub metadata: NodeMetadata,
    pub origin: Option<GeoCoordinate>,
}

impl NodeContext {
    pub fn peer(record: ConnectionRecord, origin: Option<GeoCoordinate>) -> Self {
        Self {
            role: NodeRole::Peer,
            metadata: NodeMetadata::Connection(record),
            origin,
        }
    }

    pub fn host() -> Self {
        Self {
            role: NodeRole::SelfHost,
            metadata: NodeMetadata::Host,
            origin: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Upsert {
    Created(TopologyNode),
    Updated(TopologyNode),
    /// Service has no location; nothing stored
    Unresolved,
    /// Already attempted this cycle
    Skipped,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TopologyEvent {
    Added(TopologyNode),
    Updated(TopologyNode),
}

/// Counts from one refresh cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub scanned: usize,
    pub peers_created: usize,
    pub hops_created: usize,
    pub updated: usize,
    pub unresolved: usize,
    pub failures: usize,
}

impl RefreshReport {
    pub fn new_nodes(&self) -> usize {
        self.peers_created + self.hops_created
    }

    fn absorb(&mut self, other: RefreshReport) {
        self.scanned += other.scanned;
        self.peers_created += other.peers_created;
        self.hops_created += other.hops_created;
        self.updated += other.updated;
        self.unresolved += other.unresolved;
        self.failures += other.failures;
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct RegistryOptions {
    pub node_radius: f64,
    /// Trace new peers on separate threads
    pub parallel_traces: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            node_radius: DEFAULT_NODE_RADIUS,
            parallel_traces: false,
        }
    }
}

pub struct TopologyRegistry {
    scanner: Scanner,
    resolver: Resolver,
    tracer: HopTracer,
    options: RegistryOptions,
    nodes: Mutex<HashMap<String, TopologyNode>>,
    /// IPs whose resolution was attempted in the current cycle
    attempted: Mutex<HashSet<String>>,
    self_ip: Mutex<Option<String>>,
    version: AtomicU64,
    subscribers: Mutex<Vec<Sender<TopologyEvent>>>,
}

impl TopologyRegistry {
    pub fn new(scanner: Scanner, resolver: Resolver, tracer: HopTracer, options: RegistryOptions) -> Self {
        Self {
            scanner,
            resolver,
            tracer: tracer.with_radius(options.node_radius),
            options,
            nodes: Mutex::new(HashMap::new()),
            attempted: Mutex::new(HashSet::new()),
            self_ip: Mutex::new(None),
            version: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(
            Scanner::from_settings(&settings.scanner),
            Resolver::from_settings(&settings.resolver)?,
            HopTracer::from_settings(&settings.tracer),
            RegistryOptions {
                node_radius: settings.session.node_radius,
                parallel_traces: settings.tracer.parallel,
            },
        ))
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> Vec<TopologyNode> {
        lock(&self.nodes).values().cloned().collect()
    }

    pub fn get(&self, ip: &str) -> Option<TopologyNode> {
        lock(&self.nodes).get(ip).cloned()
    }

    pub fn self_node(&self) -> Option<TopologyNode> {
        let ip = lock(&self.self_ip).clone()?;
        self.get(&ip)
    }

    pub fn self_location(&self) -> Option<GeoCoordinate> {
        self.self_node().map(|node| node.location)
    }

    pub fn len(&self) -> usize {
        lock(&self.nodes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every add or update
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Receive an event for every node added or updated from now on
    pub fn subscribe(&self) -> Receiver<TopologyEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    // ------------------------------------------------------------------------
    // Write side
    // ------------------------------------------------------------------------

    /// Locate this host and store it as the self node
    pub fn discover_self(&self) -> Result<Option<TopologyNode>> {
        let (ip, lookup) = self.resolver.resolve_self()?;
        let Lookup::Found(location) = lookup else {
            warn!("no location for own address {}", ip);
            return Ok(None);
        };

        *lock(&self.self_ip) = Some(ip.clone());
        let context = NodeContext::host();
        let node = TopologyNode::new(
            ip,
            location,
            context.role,
            context.metadata,
            context.origin,
            self.options.node_radius,
        );
        match self.merge(node) {
            Upsert::Created(node) | Upsert::Updated(node) => Ok(Some(node)),
            _ => Ok(None),
        }
    }

    /// Create the node for `ip` if it can be located, or replace the
    /// metadata of the existing one. Position and role of an existing node
    /// are never recomputed.
    pub fn upsert(&self, ip: &str, context: NodeContext) -> Result<Upsert> {
        if let Some(node) = self.update_existing(ip, &context) {
            return Ok(Upsert::Updated(node));
        }

        if !lock(&self.attempted).insert(ip.to_string()) {
            debug!("{} already attempted this cycle", ip);
            return Ok(Upsert::Skipped);
        }

        match self.resolver.resolve(ip)? {
            Lookup::Found(location) => Ok(self.merge(TopologyNode::new(
                ip,
                location,
                context.role,
                context.metadata,
                context.origin,
                self.options.node_radius,
            ))),
            Lookup::NotFound => Ok(Upsert::Unresolved),
        }
    }

    /// Store an already located node (trace output), or refresh the
    /// existing entry for its IP.
    pub fn merge(&self, node: TopologyNode) -> Upsert {
        let result = {
            let mut nodes = lock(&self.nodes);
            match nodes.get_mut(&node.ip) {
                Some(existing) => {
                    refresh(existing, node.role, node.metadata);
                    Upsert::Updated(existing.clone())
                }
                None => {
                    nodes.insert(node.ip.clone(), node.clone());
                    Upsert::Created(node)
                }
            }
        };

        match &result {
            Upsert::Created(node) => {
                info!("new {} node {}", node.role, node.ip);
                self.publish(TopologyEvent::Added(node.clone()));
            }
            Upsert::Updated(node) => self.publish(TopologyEvent::Updated(node.clone())),
            _ => {}
        }
        result
    }

    fn update_existing(&self, ip: &str, context: &NodeContext) -> Option<TopologyNode> {
        let updated = {
            let mut nodes = lock(&self.nodes);
            let existing = nodes.get_mut(ip)?;
            existing.last_seen = Utc::now();
            existing.metadata = context.metadata.clone();
            existing.clone()
        };
        self.publish(TopologyEvent::Updated(updated.clone()));
        Some(updated)
    }

    fn publish(&self, event: TopologyEvent) {
        self.version.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ------------------------------------------------------------------------
    // Refresh cycle
    // ------------------------------------------------------------------------

    /// Scan, upsert every peer, then trace every peer created this cycle.
    ///
    /// Only a failed scan fails the cycle; per-IP and per-trace failures
    /// are logged and counted.
    pub fn refresh_peers(&self) -> Result<RefreshReport> {
        lock(&self.attempted).clear();

        let peers = self.scanner.list_foreign_peers()?;
        let origin = self.self_location();
        let mut report = RefreshReport {
            scanned: peers.len(),
            ..RefreshReport::default()
        };
        let mut new_peers = Vec::new();

        for (ip, record) in peers {
            match self.upsert(&ip, NodeContext::peer(record, origin)) {
                Ok(Upsert::Created(node)) => {
                    report.peers_created += 1;
                    if node.role == NodeRole::Peer {
                        new_peers.push(node.ip);
                    }
                }
                Ok(Upsert::Updated(_)) => report.updated += 1,
                Ok(Upsert::Unresolved) => report.unresolved += 1,
                Ok(Upsert::Skipped) => {}
                Err(e) => {
                    warn!("locating peer {} failed: {}", ip, e);
                    report.failures += 1;
                }
            }
        }

        if self.options.parallel_traces && new_peers.len() > 1 {
            let outcomes: Vec<RefreshReport> = thread::scope(|s| {
                let handles: Vec<_> = new_peers
                    .iter()
                    .map(|ip| s.spawn(move || self.trace_peer(ip, origin)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or_else(|_| RefreshReport {
                        failures: 1,
                        ..RefreshReport::default()
                    }))
                    .collect()
            });
            outcomes.into_iter().for_each(|outcome| report.absorb(outcome));
        } else {
            for ip in &new_peers {
                report.absorb(self.trace_peer(ip, origin));
            }
        }

        info!(
            "refresh: {} peers scanned, {} new peers, {} new hops, {} updated, {} unresolved, {} failures",
            report.scanned,
            report.peers_created,
            report.hops_created,
            report.updated,
            report.unresolved,
            report.failures
        );
        Ok(report)
    }

    /// Trace one destination and fold its hops into the registry
    pub fn trace_peer(&self, ip: &str, origin: Option<GeoCoordinate>) -> RefreshReport {
        let mut report = RefreshReport::default();
        let first_attempt = |hop: &str| lock(&self.attempted).insert(hop.to_string());
        let trace = match self.tracer.trace(ip, &self.resolver, origin) {
            Ok(trace) => trace.with_attempt_guard(&first_attempt),
            Err(e) => {
                warn!("{}", e);
                report.failures += 1;
                return report;
            }
        };

        for node in trace {
            match self.merge(node) {
                Upsert::Created(_) => report.hops_created += 1,
                Upsert::Updated(_) => report.updated += 1,
                _ => {}
            }
        }
        report
    }
}

/// Refresh an existing node from a trace sighting. Metadata is replaced
/// only when the sighting has the same role, and never over a connection
/// record.
fn refresh(existing: &mut TopologyNode, role: NodeRole, metadata: NodeMetadata) {
    existing.last_seen = Utc::now();
    if existing.role == role && !matches!(existing.metadata, NodeMetadata::Connection(_)) {
        existing.metadata = metadata;
    }
}
