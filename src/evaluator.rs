use std::collections::BTreeSet;

use crate::model::condition::{ConditionNode, Leaf, Logic};
use crate::price_store::PriceLookup;

/// Evaluate a condition tree against the latest known prices.
///
/// Children are visited left to right and evaluation stops as soon as a group's
/// outcome is decided. An empty `AND` is true, an empty `OR` is false, and a leaf
/// whose symbol has no price is false.
pub fn evaluate<P>(node: &ConditionNode, prices: &P) -> bool
where
    P: PriceLookup + ?Sized,
{
    match node {
        ConditionNode::Leaf(leaf) => evaluate_leaf(leaf, prices),
        ConditionNode::Group(group) => match group.logic {
            Logic::And => group.children.iter().all(|child| evaluate(child, prices)),
            Logic::Or => group.children.iter().any(|child| evaluate(child, prices)),
        },
    }
}

fn evaluate_leaf<P>(leaf: &Leaf, prices: &P) -> bool
where
    P: PriceLookup + ?Sized,
{
    let symbol = leaf.symbol.trim();
    if symbol.is_empty() {
        return false;
    }
    match prices.price(symbol) {
        Some(price) => leaf.operator.apply(price, leaf.threshold),
        None => false,
    }
}

/// All symbols referenced by leaves of the tree, deduplicated and sorted.
pub fn required_symbols(node: &ConditionNode) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_symbols(node, &mut out);
    out
}

fn collect_symbols(node: &ConditionNode, out: &mut BTreeSet<String>) {
    match node {
        ConditionNode::Leaf(leaf) => {
            let symbol = leaf.symbol.trim();
            if !symbol.is_empty() {
                out.insert(symbol.to_string());
            }
        }
        ConditionNode::Group(group) => {
            for child in &group.children {
                collect_symbols(child, out);
            }
        }
    }
}
