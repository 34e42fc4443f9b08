//! Dependency resolution and DDL ordering for catalog objects.
//!
//! [`resolve_dependencies`] turns raw catalog edges into per-object
//! dependency lists; [`sort_relations`] orders objects so every dependency
//! is created before its dependents.
//!
//! Edges are tagged with an [`EdgeKind`]. A cycle through structural or
//! inheritance edges is fatal and reported with every participant. A
//! partition-child-of edge that would close a cycle is dropped from the
//! ordering instead, since the child's definition is emitted with its parent.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::{debug, info};

use crate::catalog::{
    Dependency, DependencyEdge, EdgeKind, ObjectKind, Oid, PartitionRole, Relation, SequenceOwner,
};
use crate::error::{BackupError, Result};

/// `schema.sequence` -> `schema.table.column`.
pub fn sequence_owner_map(owners: &[SequenceOwner]) -> HashMap<String, String> {
    owners
        .iter()
        .map(|o| {
            (
                format!("{}.{}", o.schema, o.sequence),
                format!("{}.{}.{}", o.schema, o.table, o.column),
            )
        })
        .collect()
}

/// Leaves whose rows are captured through their parent: external leaves, and
/// leaves of an externally stored parent.
fn captured_through_parent(relations: &[Relation]) -> HashSet<Oid> {
    let external_names: HashSet<String> = relations
        .iter()
        .filter(|r| r.is_external || r.partition_role == PartitionRole::External)
        .map(Relation::fqn)
        .collect();
    relations
        .iter()
        .filter(|r| r.partition_role == PartitionRole::Leaf)
        .filter(|r| {
            r.is_external
                || r.partition_parent
                    .as_ref()
                    .map_or(false, |p| external_names.contains(p))
        })
        .map(|r| r.oid)
        .collect()
}

/// Annotate each in-scope object with its dependency list and parents.
///
/// `filter_active` means an explicit include/exclude filter is in effect:
/// edges whose target is outside the working set are then dropped, on the
/// assumption the target already exists where the objects are replayed.
pub fn resolve_dependencies(
    relations: Vec<Relation>,
    edges: &[DependencyEdge],
    external_ids: &HashSet<Oid>,
    sequence_owners: &[SequenceOwner],
    filter_active: bool,
) -> Vec<Relation> {
    let (removed, mut relations): (Vec<Relation>, Vec<Relation>) = relations
        .into_iter()
        .partition(|r| external_ids.contains(&r.oid));
    if !removed.is_empty() {
        info!(
            "Skipping {} extension-owned objects: {}",
            removed.len(),
            removed.iter().map(Relation::fqn).collect::<Vec<_>>().join(", ")
        );
    }

    let in_scope: HashSet<String> = relations.iter().map(Relation::fqn).collect();
    let position: HashMap<Oid, usize> = relations
        .iter()
        .enumerate()
        .map(|(i, r)| (r.oid, i))
        .collect();
    let skip_edges = captured_through_parent(&relations);

    for edge in edges {
        let Some(&i) = position.get(&edge.source) else {
            continue;
        };
        if skip_edges.contains(&edge.source) || external_ids.contains(&edge.target_oid) {
            continue;
        }
        let rel = &mut relations[i];
        if edge.kind == EdgeKind::Inheritance && !rel.inherits.contains(&edge.target) {
            rel.inherits.push(edge.target.clone());
        }
        if filter_active && !in_scope.contains(&edge.target) {
            debug!(
                "dropping dependency {} -> {}: target is outside the filtered set",
                rel.fqn(),
                edge.target
            );
            continue;
        }
        let dep = Dependency::new(edge.target.clone(), edge.kind);
        if !rel.depends_upon.contains(&dep) {
            rel.depends_upon.push(dep);
        }
    }

    // Owned sequences are created before the table whose column uses them.
    let owners = sequence_owner_map(sequence_owners);
    let mut table_needs: Vec<(String, String)> = Vec::new();
    for rel in relations.iter_mut().filter(|r| r.kind == ObjectKind::Sequence) {
        let Some(column) = owners.get(&rel.fqn()) else {
            continue;
        };
        rel.owned_by = Some(column.clone());
        if let Some((table, _)) = column.rsplit_once('.') {
            table_needs.push((table.to_string(), rel.fqn()));
        }
    }
    for (table, sequence) in table_needs {
        if let Some(rel) = relations.iter_mut().find(|r| r.fqn() == table) {
            let dep = Dependency::new(sequence, EdgeKind::Structural);
            if !rel.depends_upon.contains(&dep) {
                rel.depends_upon.push(dep);
            }
        }
    }

    relations
}

/// Order relations so that for every in-set edge `a -> b`, `b` precedes `a`.
///
/// Ties keep the input order. Fails with [`BackupError::DependencyCycle`] if
/// structural or inheritance edges form a cycle.
pub fn sort_relations(relations: Vec<Relation>) -> Result<Vec<Relation>> {
    let index: HashMap<String, usize> = relations
        .iter()
        .enumerate()
        .map(|(i, r)| (r.fqn(), i))
        .collect();

    let mut graph: DiGraph<usize, EdgeKind> = DiGraph::with_capacity(relations.len(), 0);
    let nodes: Vec<NodeIndex> = (0..relations.len()).map(|i| graph.add_node(i)).collect();

    let mut self_cycles = Vec::new();
    let mut partition_edges = Vec::new();
    for (i, rel) in relations.iter().enumerate() {
        for dep in &rel.depends_upon {
            let Some(&j) = index.get(&dep.target) else {
                continue;
            };
            match dep.kind {
                EdgeKind::PartitionChildOf => partition_edges.push((j, i)),
                _ if i == j => self_cycles.push(i),
                kind => {
                    graph.add_edge(nodes[j], nodes[i], kind);
                }
            }
        }
    }

    let mut cyclic: Vec<usize> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .flatten()
        .map(|n| graph[n])
        .chain(self_cycles)
        .collect();
    if !cyclic.is_empty() {
        cyclic.sort_unstable();
        cyclic.dedup();
        let mut objects: Vec<String> = cyclic.iter().map(|&i| relations[i].fqn()).collect();
        objects.sort();
        return Err(BackupError::DependencyCycle { objects });
    }

    for (parent, child) in partition_edges {
        if parent == child || has_path_connecting(&graph, nodes[child], nodes[parent], None) {
            debug!(
                "ignoring partition edge {} -> {}: it would close a cycle",
                relations[child].fqn(),
                relations[parent].fqn()
            );
            continue;
        }
        graph.add_edge(nodes[parent], nodes[child], EdgeKind::PartitionChildOf);
    }

    let mut in_degree: Vec<usize> = nodes
        .iter()
        .map(|&n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(relations.len());
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for next in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
            let j = graph[next];
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    let mut slots: Vec<Option<Relation>> = relations.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}
