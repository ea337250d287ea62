//! In-memory relation bookkeeping.
//!
//! Tracks parent→child dependency edges for resident resources as two
//! mirrored maps, so the cascade can walk `parents_of` without touching the
//! durable tier for warm keys.
//!
//! Edges are owned by the parent that declared them: when a parent is evicted
//! or deleted its declared edges go with it, and a child's inverse entry
//! disappears once no resident parent references it. Cold parents are
//! rediscovered from the durable edge table.

use std::collections::{HashMap, HashSet};

/// Bidirectional edge index between resource keys.
#[derive(Debug, Default)]
pub struct RelationGraph {
    /// Ordered children declared by each resident parent.
    children_of: HashMap<String, Vec<String>>,
    /// Inverse: resident parents referencing each key.
    parents_of: HashMap<String, HashSet<String>>,
}

impl RelationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the declared child set of `parent`, repairing both sides.
    ///
    /// Children dropped from the previous declaration lose their inverse
    /// pointer; new children gain one. Self-edges must be filtered out by the
    /// caller before this point.
    pub fn set_children(&mut self, parent: &str, children: Vec<String>) {
        if let Some(previous) = self.children_of.remove(parent) {
            for child in previous {
                if children.contains(&child) {
                    continue;
                }
                self.drop_inverse(&child, parent);
            }
        }
        for child in &children {
            self.parents_of
                .entry(child.clone())
                .or_default()
                .insert(parent.to_string());
        }
        if children.is_empty() {
            return;
        }
        self.children_of.insert(parent.to_string(), children);
    }

    /// Add one declared edge, keeping declaration order.
    pub fn add_child(&mut self, parent: &str, child: &str) {
        let children = self.children_of.entry(parent.to_string()).or_default();
        if !children.iter().any(|c| c == child) {
            children.push(child.to_string());
        }
        self.parents_of
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    /// Resident parents of `key`.
    pub fn parents_of(&self, key: &str) -> Vec<String> {
        self.parents_of
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Declared children of `key`, in declaration order.
    pub fn children_of(&self, key: &str) -> Vec<String> {
        self.children_of.get(key).cloned().unwrap_or_default()
    }

    /// Remove the edges `key` declared (it was evicted or deleted).
    pub fn remove_declared(&mut self, key: &str) {
        if let Some(children) = self.children_of.remove(key) {
            for child in children {
                self.drop_inverse(&child, key);
            }
        }
    }

    /// Remove every trace of `key`: its declared edges and its presence in
    /// any resident parent's declaration. Used by `del`.
    pub fn remove_key(&mut self, key: &str) {
        self.remove_declared(key);
        if let Some(parents) = self.parents_of.remove(key) {
            for parent in parents {
                if let Some(children) = self.children_of.get_mut(&parent) {
                    children.retain(|c| c != key);
                    if children.is_empty() {
                        self.children_of.remove(&parent);
                    }
                }
            }
        }
    }

    pub fn edge_count(&self) -> usize {
        self.children_of.values().map(Vec::len).sum()
    }

    fn drop_inverse(&mut self, child: &str, parent: &str) {
        if let Some(parents) = self.parents_of.get_mut(child) {
            parents.remove(parent);
            if parents.is_empty() {
                self.parents_of.remove(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_are_symmetric() {
        let mut graph = RelationGraph::new();
        graph.set_children("a", vec!["b".into(), "c".into()]);

        assert_eq!(graph.children_of("a"), vec!["b", "c"]);
        assert_eq!(graph.parents_of("b"), vec!["a"]);
        assert_eq!(graph.parents_of("c"), vec!["a"]);
    }

    #[test]
    fn redeclaration_diffs_both_sides() {
        let mut graph = RelationGraph::new();
        graph.set_children("a", vec!["b".into(), "c".into()]);
        graph.set_children("a", vec!["c".into(), "d".into()]);

        assert!(graph.parents_of("b").is_empty());
        assert_eq!(graph.parents_of("c"), vec!["a"]);
        assert_eq!(graph.parents_of("d"), vec!["a"]);
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn shared_child_keeps_other_parent() {
        let mut graph = RelationGraph::new();
        graph.set_children("a", vec!["c".into()]);
        graph.set_children("b", vec!["c".into()]);

        graph.remove_declared("a");

        assert_eq!(graph.parents_of("c"), vec!["b"]);
    }

    #[test]
    fn remove_key_severs_both_directions() {
        let mut graph = RelationGraph::new();
        graph.set_children("a", vec!["b".into()]);
        graph.set_children("b", vec!["c".into()]);

        graph.remove_key("b");

        assert!(graph.children_of("a").is_empty());
        assert!(graph.parents_of("c").is_empty());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn add_child_is_idempotent_and_ordered() {
        let mut graph = RelationGraph::new();
        graph.add_child("a", "b");
        graph.add_child("a", "c");
        graph.add_child("a", "b");

        assert_eq!(graph.children_of("a"), vec!["b", "c"]);
    }
}
