//! Partitioning of the pending graph into dispatch units.
//!
//! Nodes arrive in topological order. A compiled-capable node fuses with the regions of its
//! producers, merging them into one, as long as the contracted unit graph stays acyclic and the
//! region stays within its size cap; otherwise it opens a new region. Fallback and unsupported
//! nodes always form singleton units.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

/// Dispatch path a node is routed to before partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    Compiled,
    Fallback,
    Unsupported,
}

/// Partition input: one pending node.
#[derive(Debug, Clone)]
pub(crate) struct PartitionNode {
    pub(crate) seq: u64,
    pub(crate) route: Route,
    /// Indices of pending producer nodes, all smaller than this node's index.
    pub(crate) producers: Vec<usize>,
}

/// Indices refer to the partitioned node slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DispatchUnit {
    Region(Vec<usize>),
    Fallback(usize),
    Unsupported(usize),
}

impl DispatchUnit {
    pub(crate) fn members(&self) -> &[usize] {
        match self {
            DispatchUnit::Region(members) => members,
            DispatchUnit::Fallback(idx) | DispatchUnit::Unsupported(idx) => std::slice::from_ref(idx),
        }
    }
}

/// Groups `nodes` into units and returns them in dispatch order.
pub(crate) fn partition(nodes: &[PartitionNode], max_region_nodes: usize) -> Vec<DispatchUnit> {
    // Absorbed units become `None`; `unit_of` always points at a live unit.
    let mut units: Vec<Option<DispatchUnit>> = Vec::new();
    let mut unit_of: Vec<usize> = Vec::with_capacity(nodes.len());
    // Units each unit transitively depends on, itself excluded.
    let mut ancestors: Vec<BTreeSet<usize>> = Vec::new();

    for (idx, node) in nodes.iter().enumerate() {
        let direct: BTreeSet<usize> = node.producers.iter().map(|&p| unit_of[p]).collect();
        let mut node_ancestors = direct.clone();
        for &unit in &direct {
            node_ancestors.extend(ancestors[unit].iter().copied());
        }

        let merged = match node.route {
            Route::Compiled => {
                mergeable_regions(&units, &ancestors, &direct, &node_ancestors, max_region_nodes)
            }
            Route::Fallback | Route::Unsupported => BTreeSet::new(),
        };

        let unit = match merged.first().copied() {
            Some(target) => {
                let mut members = vec![idx];
                for &unit in &merged {
                    if let Some(DispatchUnit::Region(absorbed)) = units[unit].take() {
                        members.extend(absorbed);
                    }
                }
                members.sort_unstable();
                for &member in &members[..members.len() - 1] {
                    unit_of[member] = target;
                }
                units[target] = Some(DispatchUnit::Region(members));
                node_ancestors.retain(|unit| !merged.contains(unit));
                // Descendants of an absorbed unit now also depend on everything the node reads.
                for set in ancestors.iter_mut() {
                    if set.iter().any(|unit| merged.contains(unit)) {
                        set.retain(|unit| !merged.contains(unit));
                        set.insert(target);
                        set.extend(node_ancestors.iter().copied());
                    }
                }
                ancestors[target] = node_ancestors;
                target
            }
            None => {
                units.push(Some(match node.route {
                    Route::Compiled => DispatchUnit::Region(vec![idx]),
                    Route::Fallback => DispatchUnit::Fallback(idx),
                    Route::Unsupported => DispatchUnit::Unsupported(idx),
                }));
                ancestors.push(node_ancestors);
                units.len() - 1
            }
        };
        unit_of.push(unit);
    }

    // Compact away absorbed units before ordering.
    let mut remap = vec![usize::MAX; units.len()];
    let mut live = Vec::with_capacity(units.len());
    for (old, unit) in units.into_iter().enumerate() {
        if let Some(unit) = unit {
            remap[old] = live.len();
            live.push(unit);
        }
    }
    let unit_of: Vec<usize> = unit_of.iter().map(|&unit| remap[unit]).collect();
    order_units(nodes, live, &unit_of)
}

/// Producer regions a compiled node can fuse with, together with the node, into one region.
///
/// Candidates are taken in creation order and kept while the union stays within
/// `max_region_nodes` and no unit outside the union lies on a path between two of its members.
fn mergeable_regions(
    units: &[Option<DispatchUnit>],
    ancestors: &[BTreeSet<usize>],
    direct: &BTreeSet<usize>,
    node_ancestors: &BTreeSet<usize>,
    max_region_nodes: usize,
) -> BTreeSet<usize> {
    let mut chosen = BTreeSet::new();
    let mut size = 1;
    for &candidate in direct {
        let len = match &units[candidate] {
            Some(DispatchUnit::Region(members)) => members.len(),
            _ => continue,
        };
        if size + len > max_region_nodes {
            continue;
        }
        let mut trial = chosen.clone();
        trial.insert(candidate);
        let wraps_around = node_ancestors
            .iter()
            .filter(|unit| !trial.contains(*unit))
            .any(|&outside| ancestors[outside].iter().any(|unit| trial.contains(unit)));
        if !wraps_around {
            chosen = trial;
            size += len;
        }
    }
    chosen
}

/// Kahn's algorithm over the contracted graph, breaking ties by the smallest creation sequence
/// in each unit.
fn order_units(
    nodes: &[PartitionNode],
    units: Vec<DispatchUnit>,
    unit_of: &[usize],
) -> Vec<DispatchUnit> {
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); units.len()];
    for (idx, node) in nodes.iter().enumerate() {
        for &producer in &node.producers {
            if unit_of[producer] != unit_of[idx] {
                successors[unit_of[producer]].insert(unit_of[idx]);
            }
        }
    }
    let mut indegree = vec![0usize; units.len()];
    for targets in &successors {
        for &target in targets {
            indegree[target] += 1;
        }
    }
    let first_seq = |unit: usize| {
        units[unit]
            .members()
            .iter()
            .map(|&idx| nodes[idx].seq)
            .min()
            .unwrap_or(u64::MAX)
    };

    let mut ready: BinaryHeap<Reverse<(u64, usize)>> = (0..units.len())
        .filter(|&unit| indegree[unit] == 0)
        .map(|unit| Reverse((first_seq(unit), unit)))
        .collect();
    let mut order = Vec::with_capacity(units.len());
    while let Some(Reverse((_, unit))) = ready.pop() {
        order.push(unit);
        for &next in &successors[unit] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse((first_seq(next), next)));
            }
        }
    }
    if order.len() != units.len() {
        log::error!(
            "dispatch units form a cycle; {} of {} units ordered",
            order.len(),
            units.len()
        );
        let placed: BTreeSet<usize> = order.iter().copied().collect();
        order.extend((0..units.len()).filter(|unit| !placed.contains(unit)));
    }

    let mut slots: Vec<Option<DispatchUnit>> = units.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|unit| slots[unit].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seq: u64, route: Route, producers: &[usize]) -> PartitionNode {
        PartitionNode {
            seq,
            route,
            producers: producers.to_vec(),
        }
    }

    #[test]
    fn chain_of_compiled_nodes_forms_one_region() {
        let nodes = [
            node(0, Route::Compiled, &[]),
            node(1, Route::Compiled, &[0]),
            node(2, Route::Compiled, &[1]),
        ];
        assert_eq!(partition(&nodes, 16), vec![DispatchUnit::Region(vec![0, 1, 2])]);
    }

    #[test]
    fn independent_producers_fuse_through_their_consumer() {
        let nodes = [
            node(0, Route::Compiled, &[]),
            node(1, Route::Compiled, &[]),
            node(2, Route::Compiled, &[0, 1]),
        ];
        assert_eq!(partition(&nodes, 16), vec![DispatchUnit::Region(vec![0, 1, 2])]);
    }

    #[test]
    fn producers_fuse_only_within_the_cap() {
        let nodes = [
            node(0, Route::Compiled, &[]),
            node(1, Route::Compiled, &[0]),
            node(2, Route::Compiled, &[]),
            node(3, Route::Compiled, &[1, 2]),
        ];
        assert_eq!(
            partition(&nodes, 3),
            vec![
                DispatchUnit::Region(vec![2]),
                DispatchUnit::Region(vec![0, 1, 3]),
            ]
        );
    }

    #[test]
    fn fusion_never_wraps_around_through_a_merged_region() {
        // 0 -> 1 (fallback) -> 3 <- 2, then 4 reads 3 and 0. Fusing 0 into {2, 3, 4} would put
        // the fallback node both before and after the region.
        let nodes = [
            node(0, Route::Compiled, &[]),
            node(1, Route::Fallback, &[0]),
            node(2, Route::Compiled, &[]),
            node(3, Route::Compiled, &[1, 2]),
            node(4, Route::Compiled, &[3, 0]),
        ];
        assert_eq!(
            partition(&nodes, 16),
            vec![
                DispatchUnit::Region(vec![0]),
                DispatchUnit::Fallback(1),
                DispatchUnit::Region(vec![2, 3, 4]),
            ]
        );
    }

    #[test]
    fn fallback_node_splits_regions() {
        let nodes = [
            node(0, Route::Compiled, &[]),
            node(1, Route::Fallback, &[0]),
            node(2, Route::Compiled, &[1]),
        ];
        assert_eq!(
            partition(&nodes, 16),
            vec![
                DispatchUnit::Region(vec![0]),
                DispatchUnit::Fallback(1),
                DispatchUnit::Region(vec![2]),
            ]
        );
    }

    #[test]
    fn merge_that_would_create_cycle_is_refused() {
        // 0 -> 1 (fallback) -> 2, and 0 -> 2 directly.
        let nodes = [
            node(0, Route::Compiled, &[]),
            node(1, Route::Fallback, &[0]),
            node(2, Route::Compiled, &[0, 1]),
        ];
        let units = partition(&nodes, 16);
        assert_eq!(units.len(), 3);
        assert_eq!(units[2], DispatchUnit::Region(vec![2]));
    }

    #[test]
    fn region_size_is_capped() {
        let nodes: Vec<_> = (0..5)
            .map(|idx| {
                let producers: Vec<usize> = if idx == 0 { vec![] } else { vec![idx - 1] };
                node(idx as u64, Route::Compiled, &producers)
            })
            .collect();
        assert_eq!(
            partition(&nodes, 2),
            vec![
                DispatchUnit::Region(vec![0, 1]),
                DispatchUnit::Region(vec![2, 3]),
                DispatchUnit::Region(vec![4]),
            ]
        );
    }

    #[test]
    fn independent_units_follow_creation_order() {
        let nodes = [
            node(0, Route::Fallback, &[]),
            node(1, Route::Compiled, &[]),
            node(2, Route::Unsupported, &[]),
            node(3, Route::Compiled, &[1]),
        ];
        assert_eq!(
            partition(&nodes, 16),
            vec![
                DispatchUnit::Fallback(0),
                DispatchUnit::Region(vec![1, 3]),
                DispatchUnit::Unsupported(2),
            ]
        );
    }
}
