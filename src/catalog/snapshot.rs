//! Catalog backed by a JSON snapshot of the database's metadata.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    DependencyEdge, MetadataCatalog, ObjectFilter, Oid, PartitionRole, Relation, SequenceOwner,
};
use crate::error::{BackupError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotCatalog {
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub edges: Vec<DependencyEdge>,
    /// Extension-owned objects.
    #[serde(default)]
    pub external_objects: Vec<Oid>,
    #[serde(default)]
    pub sequence_owners: Vec<SequenceOwner>,
}

impl SnapshotCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BackupError::MetadataFetch(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let catalog: SnapshotCatalog = serde_json::from_str(content)
            .map_err(|e| BackupError::MetadataFetch(format!("cannot parse catalog: {e}")))?;
        let mut seen = HashSet::new();
        for rel in &catalog.relations {
            if !seen.insert(rel.oid) {
                return Err(BackupError::MetadataFetch(format!(
                    "identity {} appears twice in the catalog",
                    rel.oid
                )));
            }
        }
        let parent_of = catalog.parent_map();
        for rel in &catalog.relations {
            ancestors(&rel.fqn(), &parent_of)?;
        }
        Ok(catalog)
    }

    fn parent_map(&self) -> HashMap<String, String> {
        self.relations
            .iter()
            .filter_map(|r| r.partition_parent.clone().map(|p| (r.fqn(), p)))
            .collect()
    }

    /// Walk include-filter semantics: named objects, partition parents of
    /// named children, external siblings of named leaves, and (with leaf
    /// partition data) every descendant of a named parent.
    fn included(&self, filter: &ObjectFilter) -> Result<BTreeSet<String>> {
        let mut included: BTreeSet<String> = filter.include.clone();
        let parent_of = self.parent_map();

        // Ancestors of anything explicitly named.
        for name in &filter.include {
            included.extend(ancestors(name, &parent_of)?);
        }

        for rel in &self.relations {
            let Some(parent) = &rel.partition_parent else {
                continue;
            };
            let sibling_named = self.relations.iter().any(|other| {
                other.partition_parent.as_deref() == Some(parent.as_str())
                    && filter.include.contains(&other.fqn())
            });
            if rel.is_external && sibling_named {
                included.insert(rel.fqn());
            }
            if filter.leaf_partition_data
                && ancestors(&rel.fqn(), &parent_of)?
                    .iter()
                    .any(|a| filter.include.contains(a))
            {
                included.insert(rel.fqn());
            }
        }
        Ok(included)
    }

    fn filtered_relations(&self, filter: &ObjectFilter) -> Result<Vec<Relation>> {
        let included = if filter.include.is_empty() {
            None
        } else {
            Some(self.included(filter)?)
        };
        let mut relations: Vec<Relation> = self
            .relations
            .iter()
            .filter(|r| {
                // Non-external leaves are captured through their parent.
                filter.leaf_partition_data
                    || r.partition_role != PartitionRole::Leaf
                    || r.is_external
            })
            .filter(|r| included.as_ref().map_or(true, |set| set.contains(&r.fqn())))
            .filter(|r| !filter.exclude.contains(&r.fqn()))
            .cloned()
            .collect();
        relations.sort_by_key(|r| r.oid);
        Ok(relations)
    }
}

/// Partition parents of `name`, nearest first.
fn ancestors(name: &str, parent_of: &HashMap<String, String>) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut visited = HashSet::from([name]);
    let mut current = name;
    while let Some(parent) = parent_of.get(current) {
        if !visited.insert(parent.as_str()) {
            return Err(BackupError::MetadataFetch(format!(
                "partition hierarchy of {name} loops back to {parent}"
            )));
        }
        found.push(parent.clone());
        current = parent;
    }
    Ok(found)
}

impl MetadataCatalog for SnapshotCatalog {
    fn fetch_relations(&self, filter: &ObjectFilter) -> Result<Vec<Relation>> {
        let relations = self.filtered_relations(filter)?;
        debug!("catalog snapshot returned {} relations", relations.len());
        Ok(relations)
    }

    fn fetch_dependency_edges(&self, filter: &ObjectFilter) -> Result<Vec<DependencyEdge>> {
        if !filter.is_active() {
            return Ok(self.edges.clone());
        }
        let in_scope: HashSet<Oid> = self
            .filtered_relations(filter)?
            .iter()
            .map(|r| r.oid)
            .collect();
        Ok(self
            .edges
            .iter()
            .filter(|e| in_scope.contains(&e.source))
            .cloned()
            .collect())
    }

    fn fetch_external_object_identities(&self) -> Result<HashSet<Oid>> {
        Ok(self.external_objects.iter().copied().collect())
    }

    fn fetch_sequence_owners(&self) -> Result<Vec<SequenceOwner>> {
        Ok(self.sequence_owners.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EdgeKind;

    fn partitioned_catalog() -> SnapshotCatalog {
        SnapshotCatalog {
            relations: vec![
                Relation::new(10, "public", "sales").with_partition(PartitionRole::Parent, None),
                Relation::new(11, "public", "sales_1")
                    .with_partition(PartitionRole::Leaf, Some("public.sales")),
                Relation::new(12, "public", "sales_2")
                    .with_partition(PartitionRole::Leaf, Some("public.sales")),
                Relation::new(13, "public", "sales_ext")
                    .with_partition(PartitionRole::Leaf, Some("public.sales"))
                    .external(),
                Relation::new(20, "public", "customers"),
            ],
            edges: vec![
                DependencyEdge::new(11, 10, "public.sales", EdgeKind::PartitionChildOf),
                DependencyEdge::new(10, 20, "public.customers", EdgeKind::Structural),
            ],
            external_objects: vec![],
            sequence_owners: vec![],
        }
    }

    fn names(relations: &[Relation]) -> Vec<String> {
        relations.iter().map(Relation::fqn).collect()
    }

    #[test]
    fn test_unfiltered_skips_internal_leaves() {
        let catalog = partitioned_catalog();
        let rels = catalog.fetch_relations(&ObjectFilter::default()).unwrap();
        assert_eq!(
            names(&rels),
            vec!["public.sales", "public.sales_ext", "public.customers"]
        );
    }

    #[test]
    fn test_leaf_partition_data_keeps_leaves() {
        let catalog = partitioned_catalog();
        let filter = ObjectFilter {
            leaf_partition_data: true,
            ..ObjectFilter::default()
        };
        assert_eq!(catalog.fetch_relations(&filter).unwrap().len(), 5);
    }

    #[test]
    fn test_include_leaf_pulls_parent_and_external_sibling() {
        let catalog = partitioned_catalog();
        let filter = ObjectFilter {
            leaf_partition_data: true,
            ..ObjectFilter::include(["public.sales_1"])
        };
        let rels = catalog.fetch_relations(&filter).unwrap();
        assert_eq!(
            names(&rels),
            vec!["public.sales", "public.sales_1", "public.sales_ext"]
        );
    }

    #[test]
    fn test_include_parent_with_leaf_data_pulls_children() {
        let catalog = partitioned_catalog();
        let filter = ObjectFilter {
            leaf_partition_data: true,
            ..ObjectFilter::include(["public.sales"])
        };
        let rels = catalog.fetch_relations(&filter).unwrap();
        assert_eq!(rels.len(), 4);
        assert!(!names(&rels).contains(&"public.customers".to_string()));
    }

    #[test]
    fn test_exclude_filter_and_edges() {
        let catalog = partitioned_catalog();
        let filter = ObjectFilter::exclude(["public.sales"]);
        let rels = catalog.fetch_relations(&filter).unwrap();
        assert_eq!(names(&rels), vec!["public.sales_ext", "public.customers"]);
        // Only edges whose source is still in scope come back.
        let edges = catalog.fetch_dependency_edges(&filter).unwrap();
        assert!(edges.is_empty());
    }

    #[test]
    fn test_partition_parent_loop_rejected() {
        let catalog = SnapshotCatalog {
            relations: vec![
                Relation::new(1, "public", "a")
                    .with_partition(PartitionRole::Leaf, Some("public.b")),
                Relation::new(2, "public", "b")
                    .with_partition(PartitionRole::Leaf, Some("public.a")),
            ],
            ..SnapshotCatalog::default()
        };
        let filter = ObjectFilter::include(["public.a"]);
        assert!(matches!(
            catalog.fetch_relations(&filter),
            Err(BackupError::MetadataFetch(_))
        ));
        assert!(matches!(
            catalog.fetch_dependency_edges(&filter),
            Err(BackupError::MetadataFetch(_))
        ));

        let json = serde_json::to_string(&catalog).unwrap();
        assert!(matches!(
            SnapshotCatalog::from_json(&json),
            Err(BackupError::MetadataFetch(_))
        ));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let json = r#"{"relations": [
            {"oid": 1, "schema": "public", "name": "a"},
            {"oid": 1, "schema": "public", "name": "b"}
        ]}"#;
        assert!(matches!(
            SnapshotCatalog::from_json(json),
            Err(BackupError::MetadataFetch(_))
        ));
    }
}
