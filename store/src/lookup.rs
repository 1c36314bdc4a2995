//! Interning of parsed symbol names into a per-build descriptor tree.
//!
//! Every distinct segment path becomes one [`DescriptorNode`]. Nodes live in a
//! flat arena in creation order, so a parent is always stored before any of
//! its children, and refer to their parent by id rather than by reference.

use std::collections::HashMap;

use thiserror::Error;

use crate::symbols::{self, DescriptorKind, ParseError, SegmentType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorNode {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub segment_type: SegmentType,
    pub segment_quality: Option<DescriptorKind>,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("identity allocator returned id {0} more than once")]
    DuplicateId(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SegmentKey {
    parent_id: Option<i64>,
    segment_type: SegmentType,
    quality: Option<DescriptorKind>,
    name: String,
}

/// Dedup cache for one build. Callers create it fresh for each build and drop
/// it afterwards; ids it holds are meaningless to any other build.
#[derive(Debug, Default)]
pub struct SegmentCache {
    ids: HashMap<SegmentKey, i64>,
}

impl SegmentCache {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SymbolLookup {
    nodes: Vec<DescriptorNode>,
    positions: HashMap<i64, usize>,
    leaves: HashMap<String, i64>,
}

impl SymbolLookup {
    /// Id of the deepest node of `symbol`, if it was part of the build.
    pub fn leaf_id(&self, symbol: &str) -> Option<i64> {
        self.leaves.get(symbol).copied()
    }

    pub fn symbol_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes created by the build, parents before children.
    pub fn nodes(&self) -> &[DescriptorNode] {
        &self.nodes
    }

    pub fn node(&self, id: i64) -> Option<&DescriptorNode> {
        self.positions.get(&id).map(|&pos| &self.nodes[pos])
    }

    /// The chain of nodes from the scheme down to `id`.
    pub fn ancestry(&self, id: i64) -> Vec<&DescriptorNode> {
        let mut chain = Vec::new();
        let mut current = self.node(id);
        while let Some(node) = current {
            chain.push(node);
            current = node.parent_id.and_then(|parent| self.node(parent));
        }
        chain.reverse();
        chain
    }

    /// Rebuilds the symbol name whose leaf is `id`.
    pub fn symbol_name(&self, id: i64) -> Option<String> {
        let chain = self.ancestry(id);
        if chain.first().is_none_or(|root| root.parent_id.is_some()) {
            return None;
        }
        Some(symbols::join_segments(
            chain
                .into_iter()
                .map(|node| (node.segment_type, node.name.as_str())),
        ))
    }

    /// Emits every node exactly once, each after its parent. Stops at the
    /// first error returned by `visit`.
    pub fn traverse<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&DescriptorNode) -> Result<(), E>,
    {
        self.nodes.iter().try_for_each(|node| visit(node))
    }
}

/// Builds the descriptor tree for `symbol_names`.
///
/// `next_id` must hand out a fresh id on every call. Names repeated in the
/// input resolve to the same leaf.
pub fn build_symbol_lookup<'a, I, F>(
    symbol_names: I,
    cache: &mut SegmentCache,
    mut next_id: F,
) -> Result<SymbolLookup, BuildError>
where
    I: IntoIterator<Item = &'a str>,
    F: FnMut() -> i64,
{
    let mut lookup = SymbolLookup::default();

    for symbol_name in symbol_names {
        if lookup.leaves.contains_key(symbol_name) {
            continue;
        }

        let segments = symbols::parse_symbol(symbol_name)?;
        let mut parent_id = None;

        for segment in segments {
            let key = SegmentKey {
                parent_id,
                segment_type: segment.segment_type,
                quality: segment.quality,
                name: segment.name.to_string(),
            };

            let id = match cache.ids.get(&key) {
                Some(&id) => id,
                None => {
                    let id = next_id();
                    if lookup.positions.insert(id, lookup.nodes.len()).is_some() {
                        return Err(BuildError::DuplicateId(id));
                    }
                    lookup.nodes.push(DescriptorNode {
                        id,
                        parent_id,
                        segment_type: key.segment_type,
                        segment_quality: key.quality,
                        name: key.name.clone(),
                    });
                    cache.ids.insert(key, id);
                    id
                }
            };

            parent_id = Some(id);
        }

        if let Some(leaf) = parent_id {
            lookup.leaves.insert(symbol_name.to_string(), leaf);
        }
    }

    Ok(lookup)
}
