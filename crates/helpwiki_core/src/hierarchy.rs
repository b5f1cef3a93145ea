use std::collections::{BTreeMap, HashMap};

use crate::catalog::Catalog;
use crate::error::{Error, Result};

/// Index of a node inside a [`Forest`].
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyNode {
    pub internal_id: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Outline reconstructed from `(id, parent id)` pairs.
///
/// Nodes are stored in depth-first pre-order with children sorted by
/// position when one is known, then by internal id (string order), so
/// iterating the arena is the traversal.
#[derive(Debug, Clone, Default)]
pub struct Forest {
    nodes: Vec<HierarchyNode>,
    roots: Vec<NodeId>,
    by_id: HashMap<String, NodeId>,
}

impl Forest {
    pub fn from_catalog(catalog: &Catalog) -> Result<Self> {
        build_ordered_forest(catalog.documents().map(|record| {
            (
                record.internal_id.as_str(),
                record.parent_id.as_deref(),
                record.toc_position,
            )
        }))
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> &HierarchyNode {
        &self.nodes[id]
    }

    pub fn find(&self, internal_id: &str) -> Option<NodeId> {
        self.by_id.get(internal_id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn preorder(&self) -> impl Iterator<Item = NodeId> + '_ {
        0..self.nodes.len()
    }

    /// Number of ancestors; roots have depth 0.
    pub fn depth(&self, id: NodeId) -> usize {
        let mut depth = 0;
        let mut cursor = self.nodes[id].parent;
        while let Some(parent) = cursor {
            depth += 1;
            cursor = self.nodes[parent].parent;
        }
        depth
    }
}

/// Build the forest. A record whose parent is absent or unknown becomes a
/// root. Records unreachable from any root sit on a parent cycle and fail
/// the build.
pub fn build_forest<'a, I>(records: I) -> Result<Forest>
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>)>,
{
    build_ordered_forest(records.into_iter().map(|(id, parent)| (id, parent, None)))
}

/// Like [`build_forest`], but siblings with a position sort by it first.
/// Siblings without one follow, in id order.
pub fn build_ordered_forest<'a, I>(records: I) -> Result<Forest>
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>, Option<usize>)>,
{
    let items: BTreeMap<&str, (Option<&str>, Option<usize>)> = records
        .into_iter()
        .map(|(id, parent, position)| (id, (parent, position)))
        .collect();
    let sort_key = |id: &&str| {
        items
            .get(*id)
            .and_then(|(_, position)| *position)
            .unwrap_or(usize::MAX)
    };

    let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    let mut roots = Vec::new();
    for (&id, &(parent, _)) in &items {
        match parent {
            Some(parent) if items.contains_key(parent) => {
                grouped.entry(parent).or_default().push(id);
            }
            _ => roots.push(id),
        }
    }
    roots.sort_by_key(sort_key);
    for children in grouped.values_mut() {
        children.sort_by_key(sort_key);
    }

    let mut forest = Forest::default();
    let mut stack: Vec<(&str, Option<NodeId>)> =
        roots.iter().rev().map(|&id| (id, None)).collect();
    while let Some((id, parent)) = stack.pop() {
        if forest.by_id.contains_key(id) {
            continue;
        }
        let node_id = forest.nodes.len();
        forest.nodes.push(HierarchyNode {
            internal_id: id.to_string(),
            parent,
            children: Vec::new(),
        });
        forest.by_id.insert(id.to_string(), node_id);
        match parent {
            Some(parent) => forest.nodes[parent].children.push(node_id),
            None => forest.roots.push(node_id),
        }
        if let Some(children) = grouped.get(id) {
            stack.extend(children.iter().rev().map(|&child| (child, Some(node_id))));
        }
    }

    if forest.nodes.len() < items.len() {
        let ids = items
            .keys()
            .filter(|id| !forest.by_id.contains_key(**id))
            .map(|id| id.to_string())
            .collect();
        return Err(Error::CycleDetected { ids });
    }
    Ok(forest)
}
