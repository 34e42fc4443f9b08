//! Catalog data model and the read-only catalog interface.
//!
//! The literal catalog queries live behind [`MetadataCatalog`]; everything
//! downstream only sees [`Relation`]s and tagged [`DependencyEdge`]s.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;

mod snapshot;

pub use snapshot::SnapshotCatalog;

/// Object identity, stable within one catalog snapshot.
pub type Oid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    #[default]
    Table,
    View,
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionRole {
    /// Ordinary table, not part of a partition hierarchy.
    #[default]
    Heap,
    /// Externally stored table outside any hierarchy.
    External,
    Parent,
    Intermediate,
    /// Bottom level of a hierarchy; the only level holding rows.
    Leaf,
}

/// Tag on every dependency edge. Only `PartitionChildOf` may close a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Structural,
    Inheritance,
    PartitionChildOf,
}

/// One in-scope dependency of a relation, by qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub target: String,
    pub kind: EdgeKind,
}

impl Dependency {
    pub fn new(target: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            target: target.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub oid: Oid,
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub kind: ObjectKind,
    #[serde(default)]
    pub partition_role: PartitionRole,
    /// Data lives outside the cluster (external table or external leaf).
    #[serde(default)]
    pub is_external: bool,
    /// Qualified name of the partition parent, for leaves and intermediates.
    #[serde(default)]
    pub partition_parent: Option<String>,
    /// Filled in by the dependency resolver.
    #[serde(default)]
    pub depends_upon: Vec<Dependency>,
    /// Ordered list of inherited parents, filled in by the resolver.
    #[serde(default)]
    pub inherits: Vec<String>,
    /// `schema.table.column` owning this sequence, if any.
    #[serde(default)]
    pub owned_by: Option<String>,
}

impl Relation {
    pub fn new(oid: Oid, schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            oid,
            schema: schema.into(),
            name: name.into(),
            kind: ObjectKind::Table,
            partition_role: PartitionRole::Heap,
            is_external: false,
            partition_parent: None,
            depends_upon: Vec::new(),
            inherits: Vec::new(),
            owned_by: None,
        }
    }

    pub fn with_kind(mut self, kind: ObjectKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_partition(mut self, role: PartitionRole, parent: Option<&str>) -> Self {
        self.partition_role = role;
        self.partition_parent = parent.map(str::to_string);
        self
    }

    pub fn external(mut self) -> Self {
        self.is_external = true;
        self
    }

    /// `schema.name`, the form every dependency refers to.
    pub fn fqn(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn dependency_names(&self) -> Vec<&str> {
        self.depends_upon.iter().map(|d| d.target.as_str()).collect()
    }

    /// Whether relation-level locks apply to this object.
    pub fn is_lockable(&self) -> bool {
        self.kind != ObjectKind::Sequence
    }

    /// Whether segments unload rows for this relation directly.
    pub fn holds_segment_data(&self) -> bool {
        self.kind == ObjectKind::Table
            && !self.is_external
            && !matches!(
                self.partition_role,
                PartitionRole::External | PartitionRole::Intermediate
            )
    }
}

/// A raw edge as fetched from the catalog: `source` depends on `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub source: Oid,
    pub target_oid: Oid,
    /// Qualified name of the target.
    pub target: String,
    pub kind: EdgeKind,
    /// False for non-relation targets such as types.
    #[serde(default = "default_true")]
    pub target_is_relation: bool,
}

fn default_true() -> bool {
    true
}

impl DependencyEdge {
    pub fn new(source: Oid, target_oid: Oid, target: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            source,
            target_oid,
            target: target.into(),
            kind,
            target_is_relation: true,
        }
    }

    /// Edge to a non-relation object (type, domain) the relation uses.
    pub fn on_type(source: Oid, target_oid: Oid, target: impl Into<String>) -> Self {
        Self {
            target_is_relation: false,
            ..Self::new(source, target_oid, target, EdgeKind::Structural)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceOwner {
    pub schema: String,
    pub sequence: String,
    pub table: String,
    pub column: String,
}

/// Include/exclude object filter. At most one of the two sets is non-empty.
#[derive(Debug, Clone, Default)]
pub struct ObjectFilter {
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
    pub leaf_partition_data: bool,
}

impl ObjectFilter {
    pub fn include<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn exclude<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// An explicit object filter is in effect.
    pub fn is_active(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }
}

pub trait MetadataCatalog {
    /// In-scope relations after applying `filter`, ordered by identity.
    fn fetch_relations(&self, filter: &ObjectFilter) -> Result<Vec<Relation>>;

    /// Relation-to-relation and relation-to-type edges for objects in scope.
    fn fetch_dependency_edges(&self, filter: &ObjectFilter) -> Result<Vec<DependencyEdge>>;

    /// Identities of objects owned by an extension rather than this database.
    fn fetch_external_object_identities(&self) -> Result<HashSet<Oid>>;

    fn fetch_sequence_owners(&self) -> Result<Vec<SequenceOwner>> {
        Ok(Vec::new())
    }
}
