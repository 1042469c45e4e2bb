//! Cluster identity and the shared decommissioned set.
//!
//! [`ClusterConfig`] is fixed at test start: the ordered node list (which also
//! defines the startup stagger), the address of every node, and the
//! replication factor. [`DecommissionedSet`] is the only piece of mutable state
//! shared between components.
//!
//! # Invariants
//!
//! 1. **Subset**: the decommissioned set only ever holds configured nodes.
//! 2. **Replica floor**: `nodes - decommissioned >= rf` at all times.
//! 3. **Indivisible mutation**: every change to the set is a single locked
//!    step; no lock is held across remote calls.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::seq::IteratorRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::admin::{Admin, Commands};
use super::error::{ChaosError, Result};
use super::membership::StatusProbe;
use super::timing::{Scale, Timeouts};

/// Opaque identifier for a cluster member. Holds the configured hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

/// The fixed cluster layout for one test run.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Configured order; index in this list is the node's startup turn.
    nodes: Vec<NodeId>,
    addresses: HashMap<NodeId, IpAddr>,
    by_address: HashMap<IpAddr, NodeId>,
    rf: usize,
}

impl ClusterConfig {
    /// Build a config from explicit `(node, address)` pairs.
    ///
    /// Rejects duplicate nodes or addresses (the mapping must be 1:1), an
    /// `rf` of zero, and an `rf` larger than the cluster.
    pub fn new(members: Vec<(NodeId, IpAddr)>, rf: usize) -> Result<Self> {
        if rf == 0 {
            return Err(ChaosError::Config("replication factor must be at least 1".into()));
        }
        if members.len() < rf {
            return Err(ChaosError::Config(format!(
                "{} nodes cannot hold replication factor {}",
                members.len(),
                rf
            )));
        }

        let mut nodes = Vec::with_capacity(members.len());
        let mut addresses = HashMap::new();
        let mut by_address = HashMap::new();
        for (node, addr) in members {
            if addresses.insert(node.clone(), addr).is_some() {
                return Err(ChaosError::Config(format!("node {} listed twice", node)));
            }
            if let Some(other) = by_address.insert(addr, node.clone()) {
                return Err(ChaosError::Config(format!(
                    "nodes {} and {} share address {}",
                    other, node, addr
                )));
            }
            nodes.push(node);
        }

        Ok(ClusterConfig {
            nodes,
            addresses,
            by_address,
            rf,
        })
    }

    /// Build a config from `host` or `host=address` specs, resolving bare
    /// hostnames through the system resolver.
    pub fn resolve(specs: &[String], rf: usize) -> Result<Self> {
        let mut members = Vec::with_capacity(specs.len());
        for spec in specs {
            let (host, addr) = match spec.split_once('=') {
                Some((host, addr)) => {
                    let addr = addr.trim().parse::<IpAddr>().map_err(|_| ChaosError::Resolve {
                        host: spec.clone(),
                    })?;
                    (host.trim(), addr)
                }
                None => {
                    let host = spec.trim();
                    let addr = (host, 0)
                        .to_socket_addrs()
                        .ok()
                        .and_then(|mut addrs| addrs.next())
                        .map(|sa| sa.ip())
                        .ok_or_else(|| ChaosError::Resolve { host: host.to_string() })?;
                    (host, addr)
                }
            };
            members.push((NodeId::new(host), addr));
        }
        ClusterConfig::new(members, rf)
    }

    /// All configured nodes, in startup order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn rf(&self) -> usize {
        self.rf
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.addresses.contains_key(node)
    }

    /// Position of `node` in the configured order.
    pub fn index_of(&self, node: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }

    pub fn address(&self, node: &NodeId) -> Option<IpAddr> {
        self.addresses.get(node).copied()
    }

    /// Translate a raw address reported by the cluster back to a configured node.
    pub fn node_for_address(&self, addr: &IpAddr) -> Option<&NodeId> {
        self.by_address.get(addr)
    }
}

/// Nodes the harness has removed from the cluster.
///
/// Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct DecommissionedSet {
    inner: Arc<Mutex<BTreeSet<NodeId>>>,
}

impl DecommissionedSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<NodeId>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.lock().contains(node)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// A copy of the current contents.
    pub fn snapshot(&self) -> BTreeSet<NodeId> {
        self.lock().clone()
    }

    /// Remove and return an arbitrary member, or `None` if the set is empty.
    pub fn pop_any<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<NodeId> {
        let mut set = self.lock();
        let node = set.iter().choose(rng)?.clone();
        set.remove(&node);
        Some(node)
    }

    /// Add `node` if it is not already present and adding it keeps at least
    /// `config.rf()` members outside the set. Returns whether it was added.
    pub fn try_add(&self, node: &NodeId, config: &ClusterConfig) -> bool {
        if !config.contains(node) {
            return false;
        }
        let mut set = self.lock();
        if set.contains(node) || config.len() < set.len() + 1 + config.rf() {
            return false;
        }
        set.insert(node.clone());
        true
    }
}

/// Everything the core needs to act on the cluster. Cheap to clone.
#[derive(Clone)]
pub struct ClusterContext {
    pub config: Arc<ClusterConfig>,
    pub decommissioned: DecommissionedSet,
    pub admin: Arc<dyn Admin>,
    pub probe: Arc<dyn StatusProbe>,
    pub commands: Commands,
    pub scale: Scale,
    pub timeouts: Timeouts,
}

impl fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterContext")
            .field("nodes", &self.config.nodes())
            .field("rf", &self.config.rf())
            .field("decommissioned", &self.decommissioned.snapshot())
            .field("scale", &self.scale)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_nodes(rf: usize) -> ClusterConfig {
        let members = (1..=5)
            .map(|i| (NodeId::new(format!("n{}", i)), format!("10.0.0.{}", i).parse().unwrap()))
            .collect();
        ClusterConfig::new(members, rf).unwrap()
    }

    #[test]
    fn test_config_rejects_bad_replication_factor() {
        let members = vec![(NodeId::from("n1"), "10.0.0.1".parse().unwrap())];
        assert!(matches!(ClusterConfig::new(members.clone(), 0), Err(ChaosError::Config(_))));
        assert!(matches!(ClusterConfig::new(members, 2), Err(ChaosError::Config(_))));
    }

    #[test]
    fn test_config_rejects_shared_address() {
        let members = vec![
            (NodeId::from("n1"), "10.0.0.1".parse().unwrap()),
            (NodeId::from("n2"), "10.0.0.1".parse().unwrap()),
        ];
        assert!(ClusterConfig::new(members, 1).is_err());
    }

    #[test]
    fn test_address_mapping_is_total_and_reversible() {
        let config = five_nodes(3);
        for node in config.nodes() {
            let addr = config.address(node).unwrap();
            assert_eq!(config.node_for_address(&addr), Some(node));
        }
        assert_eq!(config.node_for_address(&"10.9.9.9".parse().unwrap()), None);
    }

    #[test]
    fn test_resolve_explicit_addresses() {
        let specs = vec!["n1=10.0.0.1".to_string(), "n2 = 10.0.0.2".to_string()];
        let config = ClusterConfig::resolve(&specs, 1).unwrap();
        assert_eq!(config.nodes(), &[NodeId::from("n1"), NodeId::from("n2")]);
        assert_eq!(config.index_of(&NodeId::from("n2")), Some(1));
        assert_eq!(config.address(&NodeId::from("n2")), Some("10.0.0.2".parse().unwrap()));

        let bad = vec!["n1=not-an-ip".to_string()];
        assert!(matches!(ClusterConfig::resolve(&bad, 1), Err(ChaosError::Resolve { .. })));
    }

    #[test]
    fn test_try_add_keeps_replica_floor() {
        let config = five_nodes(3);
        let set = DecommissionedSet::new();

        assert!(set.try_add(&NodeId::from("n4"), &config));
        // Already present.
        assert!(!set.try_add(&NodeId::from("n4"), &config));
        assert!(set.try_add(&NodeId::from("n5"), &config));
        // A third removal would leave 2 < rf nodes.
        assert!(!set.try_add(&NodeId::from("n1"), &config));
        // Unknown nodes are never admitted.
        assert!(!set.try_add(&NodeId::from("n9"), &config));

        assert_eq!(set.len(), 2);
        assert!(config.len() - set.len() >= config.rf());
    }

    #[test]
    fn test_pop_any_removes_a_member() {
        let config = five_nodes(1);
        let set = DecommissionedSet::new();
        let mut rng = rand::thread_rng();
        assert_eq!(set.pop_any(&mut rng), None);

        set.try_add(&NodeId::from("n2"), &config);
        set.try_add(&NodeId::from("n3"), &config);
        let popped = set.pop_any(&mut rng).unwrap();
        assert!(popped == NodeId::from("n2") || popped == NodeId::from("n3"));
        assert!(!set.contains(&popped));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let config = five_nodes(1);
        let set = DecommissionedSet::new();
        let other = set.clone();
        set.try_add(&NodeId::from("n1"), &config);
        assert!(other.contains(&NodeId::from("n1")));
    }
}
