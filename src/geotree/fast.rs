//! Compact, contiguous-array geo-tree built from the slow form (§4.10).
//!
//! Nodes are laid out breadth-first; index 0 is the root. Branches are a
//! separate array: for node `i`, the slice
//! `branches[first_branch_idx[i] .. first_branch_idx[i] + children_count[i]]`
//! lists its children, kept sorted by priority. `lhpo` records the last
//! index (within that slice) tying with the first for top priority.

use super::priority::{self, BranchKey, PriorityContext, ScheduleMode};
use super::slow::GeoTree;
use rand::Rng;
use rand::seq::IndexedRandom;
use std::collections::{HashMap, VecDeque};

#[derive(Clone)]
struct FastNode {
    parent: Option<usize>,
    first_branch_idx: usize,
    children_count: usize,
    lhpo: usize,
    key: BranchKey,
    /// ul/dl score feeding the weight evaluator; carried independently of
    /// `key` since weighting and priority ordering use it differently.
    weight_ul: f64,
    weight_dl: f64,
    fsid: Option<u32>,
    geotag: String,
}

/// A built fast-form tree for one scheduling mode. Rebuild (via `build`)
/// whenever the slow form changes meaningfully; in between, `find_free_slot`
/// mutates slot counters and re-sorts in place.
pub struct FastTree {
    nodes: Vec<FastNode>,
    branches: Vec<usize>,
    ctx: PriorityContext,
    fsid_index: HashMap<u32, usize>,
    geotag_index: Vec<(String, usize)>,
}

impl FastTree {
    /// Build the fast form from `tree`'s current state for `mode`. Call
    /// `tree.update()` first so aggregates are current.
    #[must_use]
    pub fn build(tree: &GeoTree, mode: ScheduleMode) -> Self {
        let ctx = mode.context();
        let mut nodes = Vec::new();
        let mut branches = Vec::new();
        let mut fsid_index = HashMap::new();
        let mut geotag_index = Vec::new();

        let mut queue = VecDeque::new();
        queue.push_back((tree.root(), None::<usize>, String::new()));

        while let Some((old_id, parent_new, geotag)) = queue.pop_front() {
            let new_id = nodes.len();
            let agg = tree.aggregate(old_id);
            let leaf = tree.leaf(old_id);
            let key = BranchKey {
                available: agg.available,
                free_slots: agg.free_slots,
                fill_ratio: agg.fill_ratio,
                taken_slots: agg.taken_slots,
            };
            nodes.push(FastNode {
                parent: parent_new,
                first_branch_idx: 0,
                children_count: 0,
                lhpo: 0,
                key,
                weight_ul: agg.ul_score,
                weight_dl: agg.dl_score,
                fsid: leaf.map(|l| l.fsid),
                geotag: geotag.clone(),
            });
            if let Some(fsid) = leaf.map(|l| l.fsid) {
                fsid_index.insert(fsid, new_id);
            }
            geotag_index.push((geotag.clone(), new_id));

            for (name, child) in tree.children_named(old_id) {
                let child_tag =
                    if geotag.is_empty() { name.to_string() } else { format!("{geotag}::{name}") };
                queue.push_back((child, Some(new_id), child_tag));
            }
        }

        // Second pass: fill in branch windows now that every node has a
        // stable new_id, sorted by priority within each parent.
        let mut children_of: HashMap<usize, Vec<usize>> = HashMap::new();
        for (new_id, node) in nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                children_of.entry(parent).or_default().push(new_id);
            }
        }
        for (parent, mut kids) in children_of {
            kids.sort_by(|&a, &b| priority::compare_branches(&ctx, &nodes[a].key, &nodes[b].key));
            let first = branches.len();
            let lhpo = lhpo_of(&ctx, &nodes, &kids);
            nodes[parent].first_branch_idx = first;
            nodes[parent].children_count = kids.len();
            nodes[parent].lhpo = lhpo;
            branches.extend(kids);
        }

        geotag_index.sort_by(|a, b| a.0.cmp(&b.0));

        Self { nodes, branches, ctx, fsid_index, geotag_index }
    }

    #[must_use]
    pub fn root(&self) -> usize {
        0
    }

    #[must_use]
    pub fn fsid_node(&self, fsid: u32) -> Option<usize> {
        self.fsid_index.get(&fsid).copied()
    }

    fn branch_window(&self, node: usize) -> &[usize] {
        let n = &self.nodes[node];
        &self.branches[n.first_branch_idx..n.first_branch_idx + n.children_count]
    }

    fn is_leaf(&self, node: usize) -> bool {
        self.nodes[node].children_count == 0
    }

    /// Descend from `start`, picking among top-priority siblings by
    /// weighted random sampling, optionally decrementing the chosen
    /// leaf's free-slot counter and re-sorting its branch window, and
    /// optionally retrying from the parent when nothing usable is found
    /// under `start`.
    pub fn find_free_slot<R: Rng>(
        &mut self,
        rng: &mut R,
        start: usize,
        allow_up_root: bool,
        decrement: bool,
        skip_saturated: bool,
    ) -> Option<usize> {
        let mut visited_empty = vec![false; self.nodes.len()];
        self.find_free_slot_inner(rng, start, allow_up_root, decrement, skip_saturated, &mut visited_empty)
    }

    fn find_free_slot_inner<R: Rng>(
        &mut self,
        rng: &mut R,
        start: usize,
        allow_up_root: bool,
        decrement: bool,
        skip_saturated: bool,
        visited_empty: &mut [bool],
    ) -> Option<usize> {
        if self.is_leaf(start) {
            let key = self.nodes[start].key;
            let usable = key.available && (!skip_saturated || key.has_free_slot());
            if usable {
                if decrement {
                    self.apply_decrement(start);
                }
                return Some(start);
            }
            return self.ascend_or_none(rng, start, allow_up_root, decrement, skip_saturated, visited_empty);
        }

        loop {
            let window = self.branch_window(start).to_vec();
            if window.is_empty() {
                break;
            }
            let lhpo = self.nodes[start].lhpo;
            let top: Vec<usize> = window[..=lhpo.min(window.len() - 1)].to_vec();
            let candidates: Vec<(usize, u64)> = top
                .iter()
                .filter(|&&id| !visited_empty[id])
                .map(|&id| (id, priority::weight(self.nodes[id].weight_ul, self.nodes[id].weight_dl)))
                .collect();
            let Some(pick) = weighted_pick(rng, &candidates) else {
                // Every top-priority candidate already exhausted; give up
                // on this node for this call.
                break;
            };
            if let Some(found) =
                self.find_free_slot_inner(rng, pick, false, decrement, skip_saturated, visited_empty)
            {
                return Some(found);
            }
            visited_empty[pick] = true;
        }

        self.ascend_or_none(rng, start, allow_up_root, decrement, skip_saturated, visited_empty)
    }

    fn ascend_or_none<R: Rng>(
        &mut self,
        rng: &mut R,
        start: usize,
        allow_up_root: bool,
        decrement: bool,
        skip_saturated: bool,
        visited_empty: &mut [bool],
    ) -> Option<usize> {
        if !allow_up_root {
            return None;
        }
        let Some(parent) = self.nodes[start].parent else { return None };
        visited_empty[start] = true;
        self.find_free_slot_inner(rng, parent, allow_up_root, decrement, skip_saturated, visited_empty)
    }

    fn apply_decrement(&mut self, leaf: usize) {
        {
            let node = &mut self.nodes[leaf];
            node.key.taken_slots += 1;
            node.key.free_slots = node.key.free_slots.saturating_sub(1);
        }
        let mut current = leaf;
        while let Some(parent) = self.nodes[current].parent {
            self.fix_branch_sorting(parent, current);
            current = parent;
        }
    }

    /// Locate `child`'s new rank within `parent`'s branch window after a
    /// state change and move it there; update the parent's LHPO.
    fn fix_branch_sorting(&mut self, parent: usize, child: usize) {
        let n = &self.nodes[parent];
        let (first, count) = (n.first_branch_idx, n.children_count);
        let window = &mut self.branches[first..first + count];
        let Some(pos) = window.iter().position(|&id| id == child) else { return };
        let mut sorted: Vec<usize> = window.to_vec();
        sorted.remove(pos);
        let key = self.nodes[child].key;
        let rank = sorted
            .binary_search_by(|&id| priority::compare_branches(&self.ctx, &self.nodes[id].key, &key))
            .unwrap_or_else(|e| e);
        sorted.insert(rank, child);
        self.branches[first..first + count].copy_from_slice(&sorted);
        self.nodes[parent].lhpo =
            lhpo_of(&self.ctx, &self.nodes, &self.branches[first..first + count].to_vec());
    }

    /// Exhaustively list up to `n` free slots reachable under `start`.
    /// Each returned `LevelRange` records the `[start, end)` span within
    /// the result produced while searching from one up-root level, so
    /// callers can prefer the nearer ranges first.
    pub fn find_free_slots_all<R: Rng>(
        &mut self,
        rng: &mut R,
        start: usize,
        n: usize,
        allow_up_root: bool,
    ) -> (Vec<usize>, Vec<LevelRange>) {
        let mut found = Vec::new();
        let mut levels = Vec::new();
        let mut current = start;
        loop {
            let level_start = found.len();
            loop {
                if found.len() >= n {
                    levels.push(LevelRange { node: current, start: level_start, end: found.len() });
                    return (found, levels);
                }
                match self.find_free_slot(rng, current, false, true, true) {
                    Some(id) => found.push(id),
                    None => break,
                }
            }
            levels.push(LevelRange { node: current, start: level_start, end: found.len() });
            if !allow_up_root {
                break;
            }
            match self.nodes[current].parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        (found, levels)
    }
}

/// The contiguous `[start, end)` slice of a `find_free_slots_all` result
/// produced while searching from `node`, one up-root level.
#[derive(Debug, Clone, Copy)]
pub struct LevelRange {
    pub node: usize,
    pub start: usize,
    pub end: usize,
}

fn lhpo_of(ctx: &PriorityContext, nodes: &[FastNode], window: &[usize]) -> usize {
    if window.is_empty() {
        return 0;
    }
    let top = nodes[window[0]].key;
    let mut lhpo = 0;
    for (i, &id) in window.iter().enumerate().skip(1) {
        if priority::tie(ctx, &top, &nodes[id].key) {
            lhpo = i;
        } else {
            break;
        }
    }
    lhpo
}

fn weighted_pick<R: Rng>(rng: &mut R, candidates: &[(usize, u64)]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let total: u64 = candidates.iter().map(|&(_, w)| w).sum();
    if total == 0 {
        return candidates.choose(rng).map(|&(id, _)| id);
    }
    let mut r = rng.random_range(0..total);
    for &(id, w) in candidates {
        if r < w {
            return Some(id);
        }
        r -= w;
    }
    candidates.last().map(|&(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geotree::slow::{GeoTree, LeafState};

    fn state(free: u32) -> LeafState {
        LeafState { available: true, ul_score: 1.0, dl_score: 1.0, fill_ratio: 0.2, taken_slots: 0, free_slots: free }
    }

    #[test]
    fn find_free_slot_returns_a_leaf_with_capacity() {
        let mut tree = GeoTree::new();
        tree.insert("eu::cern::a", "a", 1, state(4));
        tree.insert("eu::cern::b", "b", 2, state(0));
        tree.update();
        let mut fast = FastTree::build(&tree, ScheduleMode::Placement);
        let mut rng = rand::rng();
        let picked = fast.find_free_slot(&mut rng, fast.root(), true, true, true);
        assert!(picked.is_some());
        let id = picked.unwrap();
        assert_eq!(fast.nodes[id].fsid, Some(1));
    }

    #[test]
    fn find_free_slots_all_respects_requested_count() {
        let mut tree = GeoTree::new();
        for i in 0..5u32 {
            tree.insert(&format!("eu::cern::fs{i}"), &format!("fs{i}"), i, state(2));
        }
        tree.update();
        let mut fast = FastTree::build(&tree, ScheduleMode::Placement);
        let mut rng = rand::rng();
        let (found, levels) = fast.find_free_slots_all(&mut rng, fast.root(), 3, false);
        assert_eq!(found.len(), 3);
        assert_eq!(levels.len(), 1);
    }

    #[test]
    fn s4_four_single_slot_leaves_permute_then_exhaust() {
        let mut tree = GeoTree::new();
        for i in 0..4u32 {
            tree.insert(&format!("eu::cern::fs{i}"), &format!("fs{i}"), i, state(1));
        }
        tree.update();
        let mut fast = FastTree::build(&tree, ScheduleMode::Placement);
        let mut rng = rand::rng();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let picked = fast.find_free_slot(&mut rng, fast.root(), true, true, true);
            let id = picked.expect("slot should be available");
            assert!(seen.insert(fast.nodes[id].fsid.unwrap()));
        }
        assert_eq!(seen.len(), 4);
        assert!(fast.find_free_slot(&mut rng, fast.root(), true, true, true).is_none());
    }

    #[test]
    fn fsid_index_resolves_to_correct_node() {
        let mut tree = GeoTree::new();
        tree.insert("eu::cern::a", "a", 7, state(1));
        tree.update();
        let fast = FastTree::build(&tree, ScheduleMode::Placement);
        let node = fast.fsid_node(7).unwrap();
        assert_eq!(fast.nodes[node].fsid, Some(7));
    }
}
