extern crate failure;
extern crate failure_derive;
#[macro_use]
extern crate slog;

extern crate needlestack_models;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::Logger;

use needlestack_models::Collection;
use needlestack_models::Node;
use needlestack_models::Replica;
use needlestack_models::ReplicaState;

mod error;
mod greedy;

pub use self::error::Error;
pub use self::error::ErrorKind;
pub use self::error::Result;
pub use self::greedy::Greedy;

/// Key identifying a shard across the cluster.
pub type ItemKey = (String, String);

/// One shard to place: `quantity` copies, each weighing `weight`.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub collection: String,
    pub shard: String,
    pub weight: f64,
    pub quantity: usize,
}

impl Item {
    pub fn new<S1, S2>(collection: S1, shard: S2, weight: f64, quantity: usize) -> Item
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Item {
            collection: collection.into(),
            shard: shard.into(),
            weight,
            quantity,
        }
    }

    pub fn key(&self) -> ItemKey {
        (self.collection.clone(), self.shard.clone())
    }
}

/// A node's current load: the items it holds and their total weight.
#[derive(Clone, Debug)]
pub struct Knapsack {
    pub node: Node,
    pub capacity: Option<f64>,
    items: BTreeMap<ItemKey, f64>,
    current_weight: f64,
}

impl Knapsack {
    pub fn new(node: Node, capacity: Option<f64>) -> Knapsack {
        Knapsack {
            node,
            capacity,
            items: BTreeMap::new(),
            current_weight: 0.0,
        }
    }

    pub fn current_weight(&self) -> f64 {
        self.current_weight
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn contains(&self, key: &ItemKey) -> bool {
        self.items.contains_key(key)
    }

    /// Whether adding `weight` would push the knapsack past its capacity.
    pub fn would_overflow(&self, weight: f64) -> bool {
        match self.capacity {
            Some(capacity) => self.current_weight + weight > capacity,
            None => false,
        }
    }

    pub fn add_item(&mut self, item: &Item) -> Result<()> {
        let key = item.key();
        if self.would_overflow(item.weight) {
            return Err(ErrorKind::CapacityExceeded(
                self.node.hostport.clone(),
                format!("{}/{}", item.collection, item.shard),
            )
            .into());
        }
        if self.items.contains_key(&key) {
            return Err(ErrorKind::DuplicateItem(
                self.node.hostport.clone(),
                format!("{}/{}", item.collection, item.shard),
            )
            .into());
        }
        self.current_weight += item.weight;
        self.items.insert(key, item.weight);
        Ok(())
    }

    fn clear(&mut self) -> Vec<(ItemKey, f64)> {
        self.current_weight = 0.0;
        let items = std::mem::replace(&mut self.items, BTreeMap::new());
        items.into_iter().collect()
    }
}

/// One placed copy of a shard.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct Assignment {
    pub collection: String,
    pub shard: String,
    pub hostport: String,
}

/// Pluggable placement algorithm.
///
/// Implementations mutate the knapsacks they are given and return the
/// assignments they decided on; they never touch cluster descriptors.
pub trait Algorithm: Send + Sync {
    /// Place new items into the knapsacks without moving existing items.
    fn add(&self, items: Vec<Item>, knapsacks: &mut [Knapsack]) -> Result<Vec<Assignment>>;

    /// Empty every knapsack and place all items again from scratch.
    fn rebalance(&self, knapsacks: &mut [Knapsack]) -> Result<Vec<Assignment>>;
}

/// Plan placements for new collections on top of the current cluster state.
///
/// Knapsacks are seeded from the replicas already placed; the new
/// collections are returned with their shards' replicas filled in (state
/// BOOTING) and existing placements are never moved.
pub fn plan_add(
    logger: &Logger,
    nodes: &[Node],
    current: &[Collection],
    add: &[Collection],
    algorithm: &dyn Algorithm,
) -> Result<Vec<Collection>> {
    let mut knapsacks = seed_knapsacks(logger, nodes, current)?;
    let items = collect_items(logger, nodes.len(), add)?;
    let assignments = algorithm.add(items, &mut knapsacks)?;
    Ok(apply_assignments(add, &assignments))
}

/// Plan a from-scratch placement of every current collection.
///
/// Exposed as a building block for an operator-driven rebalance; nothing
/// triggers it automatically since every moved replica implies a reload.
pub fn plan_rebalance(
    logger: &Logger,
    nodes: &[Node],
    current: &[Collection],
    algorithm: &dyn Algorithm,
) -> Result<Vec<Collection>> {
    let mut knapsacks = seed_knapsacks(logger, nodes, current)?;
    let assignments = algorithm.rebalance(&mut knapsacks)?;
    Ok(apply_assignments(current, &assignments))
}

/// Build one knapsack per node, pre-filled with the current placement.
fn seed_knapsacks(
    logger: &Logger,
    nodes: &[Node],
    current: &[Collection],
) -> Result<Vec<Knapsack>> {
    let mut knapsacks: BTreeMap<String, Knapsack> = nodes
        .iter()
        .map(|node| (node.hostport.clone(), Knapsack::new(node.clone(), None)))
        .collect();
    for collection in current {
        for shard in &collection.shards {
            let item = Item::new(
                collection.name.clone(),
                shard.name.clone(),
                checked_weight(collection, shard)?,
                collection.replication_factor as usize,
            );
            for replica in &shard.replicas {
                match knapsacks.get_mut(&replica.node.hostport) {
                    Some(knapsack) => knapsack.add_item(&item)?,
                    None => warn!(
                        logger, "Replica placed on a node that is not live";
                        "collection" => &collection.name,
                        "shard" => &shard.name,
                        "hostport" => &replica.node.hostport,
                    ),
                };
            }
        }
    }
    Ok(knapsacks.into_iter().map(|(_, knapsack)| knapsack).collect())
}

fn collect_items(logger: &Logger, node_count: usize, add: &[Collection]) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    for collection in add {
        let mut quantity = collection.replication_factor as usize;
        if quantity > node_count {
            warn!(
                logger, "Replication factor exceeds live node count";
                "collection" => &collection.name,
                "replication_factor" => collection.replication_factor,
                "nodes" => node_count,
            );
            quantity = node_count;
        }
        for shard in &collection.shards {
            items.push(Item::new(
                collection.name.clone(),
                shard.name.clone(),
                checked_weight(collection, shard)?,
                quantity,
            ));
        }
    }
    Ok(items)
}

fn checked_weight(
    collection: &Collection,
    shard: &needlestack_models::Shard,
) -> Result<f64> {
    let weight = shard.weight;
    if !weight.is_finite() || weight < 0.0 {
        return Err(
            ErrorKind::InvalidWeight(format!("{}/{}", collection.name, shard.name)).into(),
        );
    }
    Ok(weight)
}

/// Synthesize placed collections from descriptors plus solver assignments.
fn apply_assignments(descriptors: &[Collection], assignments: &[Assignment]) -> Vec<Collection> {
    let mut by_key: BTreeMap<ItemKey, BTreeSet<String>> = BTreeMap::new();
    for assignment in assignments {
        by_key
            .entry((assignment.collection.clone(), assignment.shard.clone()))
            .or_insert_with(BTreeSet::new)
            .insert(assignment.hostport.clone());
    }
    descriptors
        .iter()
        .map(|descriptor| {
            let mut collection = descriptor.clone();
            let name = collection.name.clone();
            for shard in &mut collection.shards {
                let key = (name.clone(), shard.name.clone());
                shard.replicas = by_key
                    .get(&key)
                    .map(|hostports| {
                        hostports
                            .iter()
                            .map(|hostport| Replica::new(hostport.clone(), ReplicaState::Booting))
                            .collect()
                    })
                    .unwrap_or_else(Vec::new);
            }
            collection
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use slog::Discard;
    use slog::Logger;

    use needlestack_models::Collection;
    use needlestack_models::DataSource;
    use needlestack_models::IndexDescriptor;
    use needlestack_models::Node;
    use needlestack_models::ReplicaState;
    use needlestack_models::Shard;

    use super::plan_add;
    use super::Greedy;
    use super::Item;
    use super::Knapsack;

    fn logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn shard(name: &str, weight: f64) -> Shard {
        let source = DataSource::LocalFile {
            path: format!("/data/{}.json", name),
        };
        Shard::new(name, weight, IndexDescriptor::Flat(source))
    }

    fn nodes(count: usize) -> Vec<Node> {
        (1..=count).map(|i| Node::new(format!("n{}:50051", i))).collect()
    }

    #[test]
    fn capacity_checked_on_add() {
        let mut knapsack = Knapsack::new(Node::new("n1:50051"), Some(10.0));
        let item = Item::new("c1", "s1", 8.0, 1);
        knapsack.add_item(&item).unwrap();
        let item = Item::new("c1", "s2", 4.0, 1);
        assert!(knapsack.add_item(&item).is_err());
    }

    #[test]
    fn duplicate_rejected() {
        let mut knapsack = Knapsack::new(Node::new("n1:50051"), None);
        let item = Item::new("c1", "s1", 1.0, 1);
        knapsack.add_item(&item).unwrap();
        assert!(knapsack.add_item(&item).is_err());
    }

    #[test]
    fn every_shard_gets_min_rf_nodes_replicas() {
        let logger = logger();
        for node_count in 1..=5 {
            for rf in 1..=4u32 {
                let collection = Collection::new(
                    "c1",
                    rf,
                    vec![shard("s1", 3.0), shard("s2", 1.0), shard("s3", 7.0)],
                );
                let placed = plan_add(&logger, &nodes(node_count), &[], &[collection], &Greedy)
                    .unwrap();
                let expected = (rf as usize).min(node_count);
                for shard in &placed[0].shards {
                    assert_eq!(shard.replicas.len(), expected, "rf={} nodes={}", rf, node_count);
                    let distinct: std::collections::BTreeSet<_> = shard
                        .replicas
                        .iter()
                        .map(|replica| replica.node.hostport.clone())
                        .collect();
                    assert_eq!(distinct.len(), expected);
                    for replica in &shard.replicas {
                        assert_eq!(replica.state, Some(ReplicaState::Booting));
                    }
                }
            }
        }
    }

    #[test]
    fn heaviest_first_into_lightest_knapsack() {
        let logger = logger();
        let collection = Collection::new("c1", 1, vec![shard("shard_a", 20.0), shard("shard_b", 25.0)]);
        let placed = plan_add(&logger, &nodes(2), &[], &[collection], &Greedy).unwrap();
        let hostport = |name: &str| {
            placed[0]
                .shard(name)
                .unwrap()
                .replicas[0]
                .node
                .hostport
                .clone()
        };
        // shard_b (heavier) is placed first, hostport breaks the empty tie.
        assert_eq!(hostport("shard_b"), "n1:50051");
        assert_eq!(hostport("shard_a"), "n2:50051");
    }

    #[test]
    fn deterministic_given_fixed_inputs() {
        let logger = logger();
        let collections = vec![
            Collection::new("c2", 2, vec![shard("s1", 2.0), shard("s2", 2.0)]),
            Collection::new("c1", 1, vec![shard("s1", 2.0), shard("s9", 5.0)]),
        ];
        let first = plan_add(&logger, &nodes(3), &[], &collections, &Greedy).unwrap();
        for _ in 0..10 {
            let again = plan_add(&logger, &nodes(3), &[], &collections, &Greedy).unwrap();
            assert_eq!(again, first);
        }
    }

    #[test]
    fn existing_placement_not_moved() {
        let logger = logger();
        let mut current = Collection::new("c1", 1, vec![shard("s1", 50.0)]);
        current.shards[0].replicas = vec![needlestack_models::Replica::new(
            "n1:50051",
            ReplicaState::Active,
        )];
        let add = Collection::new("c2", 1, vec![shard("s1", 1.0)]);
        let placed = plan_add(&logger, &nodes(2), &[current.clone()], &[add], &Greedy).unwrap();
        // Only the new collection comes back, placed on the idle node.
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].name, "c2");
        assert_eq!(placed[0].shards[0].replicas[0].node.hostport, "n2:50051");
    }

    #[test]
    fn over_requested_replication_factor_is_clamped() {
        let logger = logger();
        let collection = Collection::new("c1", 5, vec![shard("s1", 10.0)]);
        let placed = plan_add(&logger, &nodes(2), &[], &[collection], &Greedy).unwrap();
        assert_eq!(placed[0].shards[0].replicas.len(), 2);
    }

    #[test]
    fn invalid_weight_rejected() {
        let logger = logger();
        let collection = Collection::new("c1", 1, vec![shard("s1", -1.0)]);
        assert!(plan_add(&logger, &nodes(1), &[], &[collection], &Greedy).is_err());
    }
}
