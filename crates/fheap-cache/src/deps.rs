//! Flush-dependency bookkeeping.
//!
//! A flush dependency is an ordering edge: the child must be written before
//! its parent can be considered safely finalized. Edges run header → root
//! block → descendants and are created when a block enters the cache,
//! re-keyed when address promotion moves a block, and destroyed when the
//! block is evicted.

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::client::Addr;

/// Parent → children edges among cached blocks, keyed by block address.
///
/// The header participates under its own file address. Structural misuse
/// (duplicate edges, destroying an absent edge) is a caller bug and
/// asserts rather than erroring.
#[derive(Debug, Default)]
pub struct FlushDependencyGraph {
    children: HashMap<Addr, BTreeSet<Addr>>,
    parents: HashMap<Addr, Addr>,
}

impl FlushDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dependency of `parent` on `child` being written first.
    pub fn create_edge(&mut self, parent: Addr, child: Addr) {
        trace!(parent = format_args!("{parent:#x}"), child = format_args!("{child:#x}"), "create flush dependency");
        assert!(
            !self.parents.contains_key(&child),
            "block {child:#x} already has a flush-dependency parent"
        );
        let inserted = self.children.entry(parent).or_default().insert(child);
        assert!(inserted, "duplicate flush-dependency edge {parent:#x} -> {child:#x}");
        self.parents.insert(child, parent);
    }

    /// Tear down the edge from `parent` to `child`.
    pub fn destroy_edge(&mut self, parent: Addr, child: Addr) {
        trace!(parent = format_args!("{parent:#x}"), child = format_args!("{child:#x}"), "destroy flush dependency");
        let removed = self
            .children
            .get_mut(&parent)
            .is_some_and(|set| set.remove(&child));
        assert!(removed, "no flush-dependency edge {parent:#x} -> {child:#x}");
        if self.children.get(&parent).is_some_and(BTreeSet::is_empty) {
            self.children.remove(&parent);
        }
        let recorded = self.parents.remove(&child);
        assert_eq!(recorded, Some(parent), "flush-dependency parent mismatch for {child:#x}");
    }

    /// Re-key a block's edges after address promotion moved it.
    pub fn rename_node(&mut self, old: Addr, new: Addr) {
        if old == new {
            return;
        }
        trace!(old = format_args!("{old:#x}"), new = format_args!("{new:#x}"), "rename flush-dependency node");
        if let Some(kids) = self.children.remove(&old) {
            for kid in &kids {
                self.parents.insert(*kid, new);
            }
            self.children.insert(new, kids);
        }
        if let Some(parent) = self.parents.remove(&old) {
            let set = self
                .children
                .get_mut(&parent)
                .unwrap_or_else(|| unreachable!("parent map out of sync for {old:#x}"));
            assert!(set.remove(&old));
            set.insert(new);
            self.parents.insert(new, parent);
        }
    }

    /// Addresses that must be clean before `parent` may be flushed.
    pub fn children_of(&self, parent: Addr) -> impl Iterator<Item = Addr> + '_ {
        self.children.get(&parent).into_iter().flatten().copied()
    }

    /// The recorded parent of `child`, if any.
    pub fn parent_of(&self, child: Addr) -> Option<Addr> {
        self.parents.get(&child).copied()
    }

    pub fn is_flush_dep_parent(&self, addr: Addr) -> bool {
        self.children.contains_key(&addr)
    }

    pub fn is_flush_dep_child(&self, addr: Addr) -> bool {
        self.parents.contains_key(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_lifecycle() {
        let mut graph = FlushDependencyGraph::new();
        graph.create_edge(0x100, 0x200);
        graph.create_edge(0x100, 0x300);

        assert!(graph.is_flush_dep_parent(0x100));
        assert!(graph.is_flush_dep_child(0x200));
        assert_eq!(graph.parent_of(0x300), Some(0x100));
        assert_eq!(graph.children_of(0x100).collect::<Vec<_>>(), vec![0x200, 0x300]);

        graph.destroy_edge(0x100, 0x200);
        assert!(!graph.is_flush_dep_child(0x200));
        assert!(graph.is_flush_dep_parent(0x100));

        graph.destroy_edge(0x100, 0x300);
        assert!(!graph.is_flush_dep_parent(0x100));
    }

    #[test]
    #[should_panic(expected = "no flush-dependency edge")]
    fn destroying_missing_edge_panics() {
        let mut graph = FlushDependencyGraph::new();
        graph.destroy_edge(0x100, 0x200);
    }

    #[test]
    #[should_panic(expected = "already has a flush-dependency parent")]
    fn second_parent_panics() {
        let mut graph = FlushDependencyGraph::new();
        graph.create_edge(0x100, 0x300);
        graph.create_edge(0x200, 0x300);
    }

    #[test]
    fn rename_rekeys_both_directions() {
        let mut graph = FlushDependencyGraph::new();
        graph.create_edge(0x100, 0x200);
        graph.create_edge(0x200, 0x400);

        // 0x200 is both a child of 0x100 and the parent of 0x400
        graph.rename_node(0x200, 0x900);

        assert_eq!(graph.parent_of(0x900), Some(0x100));
        assert_eq!(graph.parent_of(0x400), Some(0x900));
        assert_eq!(graph.children_of(0x900).collect::<Vec<_>>(), vec![0x400]);
        assert!(!graph.is_flush_dep_child(0x200));
        assert!(!graph.is_flush_dep_parent(0x200));
    }
}
