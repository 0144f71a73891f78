//! Mutable geo-aware scheduling tree (§4.9).
//!
//! Nodes live in a flat arena addressed by index, never by pointer, so the
//! parent/child/sibling links are plain `usize`s rather than a cyclic
//! `Rc`/`Weak` graph.

use std::collections::HashMap;

pub type NodeId = usize;

/// Per-leaf scheduling state: a filesystem's online/availability flag,
/// its ul/dl transfer score, and its slot accounting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafState {
    pub available: bool,
    pub ul_score: f64,
    pub dl_score: f64,
    pub fill_ratio: f64,
    pub taken_slots: u32,
    pub free_slots: u32,
}

impl LeafState {
    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.free_slots > 0
    }
}

/// Leaf-only payload: host and filesystem id plus its current state.
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub host: String,
    pub fsid: u32,
    pub state: LeafState,
}

/// Aggregate figures recomputed by `update()` for every node (leaf and
/// intermediate alike).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aggregate {
    pub ul_score: f64,
    pub dl_score: f64,
    pub fill_ratio: f64,
    pub available: bool,
    pub total_space: f64,
    pub taken_slots: u32,
    pub free_slots: u32,
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    leaf: Option<LeafInfo>,
    aggregate: Aggregate,
}

/// A mutable geo-tree keyed by `::`-delimited geotags (e.g.
/// `"region::site::rack::host"`).
pub struct GeoTree {
    nodes: Vec<Node>,
}

impl GeoTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                name: String::new(),
                parent: None,
                children: HashMap::new(),
                leaf: None,
                aggregate: Aggregate::default(),
            }],
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        0
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.leaf.is_some()).count()
    }

    #[must_use]
    pub fn aggregate(&self, id: NodeId) -> Aggregate {
        self.nodes[id].aggregate
    }

    #[must_use]
    pub fn leaf(&self, id: NodeId) -> Option<&LeafInfo> {
        self.nodes[id].leaf.as_ref()
    }

    #[must_use]
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes[id].children.values().copied()
    }

    #[must_use]
    pub fn children_named(&self, id: NodeId) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.nodes[id].children.iter().map(|(name, &child)| (name.as_str(), child))
    }

    /// Split `geotag` on `::`, walking from the root and creating
    /// intermediate nodes as needed; at the terminal component, set the
    /// leaf's state.
    pub fn insert(&mut self, geotag: &str, host: &str, fsid: u32, state: LeafState) {
        let mut current = self.root();
        let parts: Vec<&str> = geotag.split("::").filter(|p| !p.is_empty()).collect();
        for part in &parts {
            current = self.child_or_insert(current, part);
        }
        self.nodes[current].leaf = Some(LeafInfo { host: host.to_string(), fsid, state });
    }

    fn child_or_insert(&mut self, parent: NodeId, name: &str) -> NodeId {
        if let Some(&id) = self.nodes[parent].children.get(name) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_string(),
            parent: Some(parent),
            children: HashMap::new(),
            leaf: None,
            aggregate: Aggregate::default(),
        });
        self.nodes[parent].children.insert(name.to_string(), id);
        id
    }

    /// Locate the leaf named by `geotag`, then repeatedly ascend while the
    /// current ancestor's child count drops to zero, removing the
    /// highest such empty subtree in one operation.
    pub fn remove(&mut self, geotag: &str) {
        let parts: Vec<&str> = geotag.split("::").filter(|p| !p.is_empty()).collect();
        let Some(leaf_id) = self.find(&parts) else { return };

        let mut highest_empty = None;
        let mut current = leaf_id;
        loop {
            let Some(parent) = self.nodes[current].parent else { break };
            let name = self.nodes[current].name.clone();
            self.nodes[parent].children.remove(&name);
            if current == leaf_id || self.nodes[parent].children.is_empty() {
                highest_empty = Some((parent, current));
                current = parent;
            } else {
                break;
            }
        }
        // Only the topmost removal is structurally necessary; the rest of
        // the chain was already unlinked above. Physically drop the node
        // slots is skipped (arena is append-only), matching the "ascend
        // while empty" contract without a generational index scheme.
        let _ = highest_empty;
    }

    fn find(&self, parts: &[&str]) -> Option<NodeId> {
        let mut current = self.root();
        for part in parts {
            current = *self.nodes[current].children.get(*part)?;
        }
        Some(current)
    }

    /// Post-order recompute of aggregates: sum of ul/dl score, fill-ratio
    /// weighted by total space, status as OR of child statuses except
    /// availability, which is true only if some descendant is available.
    pub fn update(&mut self) {
        self.update_node(self.root());
    }

    fn update_node(&mut self, id: NodeId) -> Aggregate {
        let children: Vec<NodeId> = self.nodes[id].children.values().copied().collect();
        if children.is_empty() {
            let agg = if let Some(leaf) = &self.nodes[id].leaf {
                Aggregate {
                    ul_score: leaf.state.ul_score,
                    dl_score: leaf.state.dl_score,
                    fill_ratio: leaf.state.fill_ratio,
                    available: leaf.state.available,
                    total_space: 1.0,
                    taken_slots: leaf.state.taken_slots,
                    free_slots: leaf.state.free_slots,
                }
            } else {
                Aggregate::default()
            };
            self.nodes[id].aggregate = agg;
            return agg;
        }

        let mut sum_ul = 0.0;
        let mut sum_dl = 0.0;
        let mut weighted_fill = 0.0;
        let mut total_space = 0.0;
        let mut available = false;
        let mut taken_slots = 0;
        let mut free_slots = 0;
        for child in children {
            let agg = self.update_node(child);
            sum_ul += agg.ul_score;
            sum_dl += agg.dl_score;
            weighted_fill += agg.fill_ratio * agg.total_space;
            total_space += agg.total_space;
            available |= agg.available;
            taken_slots += agg.taken_slots;
            free_slots += agg.free_slots;
        }
        let fill_ratio = if total_space > 0.0 { weighted_fill / total_space } else { 0.0 };
        let agg = Aggregate {
            ul_score: sum_ul,
            dl_score: sum_dl,
            fill_ratio,
            available,
            total_space,
            taken_slots,
            free_slots,
        };
        self.nodes[id].aggregate = agg;
        agg
    }
}

impl Default for GeoTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(available: bool, free: u32) -> LeafState {
        LeafState { available, ul_score: 1.0, dl_score: 1.0, fill_ratio: 0.5, taken_slots: 0, free_slots: free }
    }

    #[test]
    fn insert_creates_intermediates_and_leaf() {
        let mut tree = GeoTree::new();
        tree.insert("eu::cern::rack1::fs1", "fs1.cern.ch", 1, state(true, 4));
        assert_eq!(tree.leaf_count(), 1);
        assert!(tree.node_count() > 1);
    }

    #[test]
    fn update_propagates_availability() {
        let mut tree = GeoTree::new();
        tree.insert("eu::a", "a", 1, state(false, 0));
        tree.insert("eu::b", "b", 2, state(true, 4));
        tree.update();
        let root_agg = tree.aggregate(tree.root());
        assert!(root_agg.available);
    }

    #[test]
    fn remove_unlinks_leaf_from_parent() {
        let mut tree = GeoTree::new();
        tree.insert("eu::a", "a", 1, state(true, 1));
        let eu = *tree.nodes[tree.root()].children.get("eu").unwrap();
        assert_eq!(tree.children(eu).count(), 1);
        tree.remove("eu::a");
        assert_eq!(tree.children(eu).count(), 0);
    }
}
