//! Cycle enumeration over a rate snapshot.
//!
//! Bounded depth-first search for every simple cycle of exactly `L` edges
//! that leaves and returns to the base asset. The intermediate universe is
//! restricted to the most liquid assets directly connected to the base, and
//! neighbours are visited in sorted order, so identical snapshots always
//! produce identical chains in identical order.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::debug;

use super::graph::{RateEdge, RateGraph};
use crate::types::{Asset, Chain, ChainStep};

/// Enumerates and scores arbitrage cycles on one snapshot.
pub struct ChainFinder<'a> {
    graph: &'a RateGraph,
}

impl<'a> ChainFinder<'a> {
    pub fn new(graph: &'a RateGraph) -> Self {
        Self { graph }
    }

    /// All cycles `base → a₁ → … → base` of exactly `chain_length` steps,
    /// using at most `max_assets` distinct assets (base included).
    /// Returned in ranking order.
    pub fn find(&self, base: &str, chain_length: usize, max_assets: usize) -> Vec<Chain> {
        if chain_length < 2 || max_assets < 2 {
            return Vec::new();
        }

        let universe: BTreeSet<Asset> = self
            .graph
            .top_connected_assets(base, max_assets - 1)
            .into_iter()
            .collect();

        let mut chains = Vec::new();
        let mut path: Vec<&RateEdge> = Vec::with_capacity(chain_length);
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        self.walk(base, base, chain_length, &universe, &mut path, &mut visited, &mut chains);

        rank(&mut chains);

        debug!(
            base,
            chain_length,
            universe = universe.len(),
            found = chains.len(),
            "Cycle search complete"
        );
        chains
    }

    #[allow(clippy::too_many_arguments)]
    fn walk<'g>(
        &'g self,
        base: &str,
        current: &str,
        chain_length: usize,
        universe: &'g BTreeSet<Asset>,
        path: &mut Vec<&'g RateEdge>,
        visited: &mut BTreeSet<&'g str>,
        out: &mut Vec<Chain>,
    ) {
        if path.len() == chain_length - 1 {
            if let Some(closing) = self.graph.edge(current, base) {
                path.push(closing);
                out.push(self.to_chain(base, path));
                path.pop();
            }
            return;
        }

        for next in universe {
            if visited.contains(next.as_str()) {
                continue;
            }
            let Some(edge) = self.graph.edge(current, next) else {
                continue;
            };
            visited.insert(next.as_str());
            path.push(edge);
            self.walk(base, next, chain_length, universe, path, visited, out);
            path.pop();
            visited.remove(next.as_str());
        }
    }

    fn to_chain(&self, base: &str, path: &[&RateEdge]) -> Chain {
        let steps: Vec<ChainStep> = path
            .iter()
            .map(|e| ChainStep {
                from: e.from.clone(),
                to: e.to.clone(),
                symbol: e.symbol.clone(),
                side: e.side,
                rate: e.rate,
                min_input: e.min_input,
            })
            .collect();

        Chain {
            id: Chain::route_id(base, &steps),
            base_asset: base.to_string(),
            profit_percent: profit_percent(&steps),
            min_required_amount: min_required_amount(&steps),
            steps,
            timestamp: self.graph.timestamp(),
        }
    }
}

/// Estimated percentage gain of one cycle: `(∏ rate − 1) × 100`.
pub fn profit_percent(steps: &[ChainStep]) -> f64 {
    let product: f64 = steps.iter().map(|s| s.rate).product();
    (product - 1.0) * 100.0
}

/// Smallest starting amount for which every leg meets its market minimum.
///
/// Walks the legs backwards: the input a leg needs is the larger of its own
/// minimum and whatever the next leg needs, converted back through the rate.
pub fn min_required_amount(steps: &[ChainStep]) -> f64 {
    steps.iter().rev().fold(0.0_f64, |next_required, step| {
        let carried = if step.rate > 0.0 {
            next_required / step.rate
        } else {
            f64::INFINITY
        };
        step.min_input.max(carried)
    })
}

/// Profit descending, then fewer steps, then lower entry amount, then id.
pub fn rank(chains: &mut [Chain]) {
    chains.sort_by(compare);
}

fn compare(a: &Chain, b: &Chain) -> Ordering {
    b.profit_percent
        .total_cmp(&a.profit_percent)
        .then_with(|| a.steps.len().cmp(&b.steps.len()))
        .then_with(|| a.min_required_amount.total_cmp(&b.min_required_amount))
        .then_with(|| a.id.cmp(&b.id))
}
