use std::cmp::Ordering;

use super::Assignment;
use super::Item;
use super::Knapsack;
use super::Result;

/// Greedy placement: heaviest item first, each copy into the lightest
/// knapsack that can take it.
///
/// Items sort by weight descending, ties broken by `(collection, shard)`;
/// knapsacks re-sort before every item by `(current weight, item count,
/// hostport)`. Both orders are total, so the packing is deterministic.
pub struct Greedy;

impl super::Algorithm for Greedy {
    fn add(&self, items: Vec<Item>, knapsacks: &mut [Knapsack]) -> Result<Vec<Assignment>> {
        let mut items = items;
        items.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.key().cmp(&b.key()))
        });

        let mut assignments = Vec::new();
        let mut order: Vec<usize> = (0..knapsacks.len()).collect();
        for item in items {
            order.sort_by(|a, b| {
                let a = &knapsacks[*a];
                let b = &knapsacks[*b];
                a.current_weight()
                    .partial_cmp(&b.current_weight())
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.item_count().cmp(&b.item_count()))
                    .then_with(|| a.node.hostport.cmp(&b.node.hostport))
            });

            let mut placed = 0;
            for index in &order {
                if placed == item.quantity.min(knapsacks.len()) {
                    break;
                }
                let knapsack = &mut knapsacks[*index];
                if knapsack.would_overflow(item.weight) || knapsack.contains(&item.key()) {
                    continue;
                }
                knapsack.add_item(&item)?;
                assignments.push(Assignment {
                    collection: item.collection.clone(),
                    shard: item.shard.clone(),
                    hostport: knapsack.node.hostport.clone(),
                });
                placed += 1;
            }
        }
        Ok(assignments)
    }

    fn rebalance(&self, knapsacks: &mut [Knapsack]) -> Result<Vec<Assignment>> {
        use std::collections::BTreeMap;

        // Recover each item's weight and placed copy count, then re-pack.
        let mut items: BTreeMap<super::ItemKey, Item> = BTreeMap::new();
        for knapsack in knapsacks.iter_mut() {
            for (key, weight) in knapsack.clear() {
                items
                    .entry(key.clone())
                    .and_modify(|item| item.quantity += 1)
                    .or_insert_with(|| Item::new(key.0.clone(), key.1.clone(), weight, 1));
            }
        }
        self.add(items.into_iter().map(|(_, item)| item).collect(), knapsacks)
    }
}
