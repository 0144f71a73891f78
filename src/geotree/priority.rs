//! Branch priority comparators and the weight evaluator used for weighted
//! random sampling within one priority class (§4.10).

use std::cmp::Ordering;

/// One scheduling mode per the pluggable-comparator list in §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Placement,
    RoAccess,
    RwAccess,
    BalancingPlacement,
    BalancingAccess,
    DrainingPlacement,
    DrainingAccess,
    Gateway,
}

impl ScheduleMode {
    /// The fill-ratio ceiling past which a branch is considered
    /// "overfull" for this mode, and whether availability is required.
    #[must_use]
    pub fn context(self) -> PriorityContext {
        match self {
            ScheduleMode::Placement | ScheduleMode::BalancingPlacement | ScheduleMode::DrainingPlacement => {
                PriorityContext { spreading_cap: 0.90, required_available: true }
            }
            ScheduleMode::RoAccess | ScheduleMode::DrainingAccess | ScheduleMode::Gateway => {
                PriorityContext { spreading_cap: 1.0, required_available: false }
            }
            ScheduleMode::RwAccess | ScheduleMode::BalancingAccess => {
                PriorityContext { spreading_cap: 0.95, required_available: true }
            }
        }
    }
}

/// The figures a comparator needs about a branch (leaf or subtree
/// aggregate — both expose the same shape).
#[derive(Debug, Clone, Copy)]
pub struct BranchKey {
    pub available: bool,
    pub free_slots: u32,
    pub fill_ratio: f64,
    pub taken_slots: u32,
}

impl BranchKey {
    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        self.free_slots > 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PriorityContext {
    pub spreading_cap: f64,
    pub required_available: bool,
}

/// Lexicographic order: (1) has a free slot, (2) at or below the
/// spreading cap, (3) fewer taken slots, (4) lower fill ratio. Branches
/// failing the mode's required status with no free slot sort last,
/// modeling "reject" without removing them from the array.
#[must_use]
pub fn compare_branches(ctx: &PriorityContext, a: &BranchKey, b: &BranchKey) -> Ordering {
    let a_ok = !ctx.required_available || a.available;
    let b_ok = !ctx.required_available || b.available;
    let a_dead = !a_ok && !a.has_free_slot();
    let b_dead = !b_ok && !b.has_free_slot();
    if a_dead != b_dead {
        return if a_dead { Ordering::Greater } else { Ordering::Less };
    }
    if a.has_free_slot() != b.has_free_slot() {
        return if a.has_free_slot() { Ordering::Less } else { Ordering::Greater };
    }
    let a_over_cap = a.fill_ratio > ctx.spreading_cap;
    let b_over_cap = b.fill_ratio > ctx.spreading_cap;
    if a_over_cap != b_over_cap {
        return if a_over_cap { Ordering::Greater } else { Ordering::Less };
    }
    match a.taken_slots.cmp(&b.taken_slots) {
        Ordering::Equal => {}
        other => return other,
    }
    // Tolerance: collapse differences under one part in a thousand so
    // near-identical branches don't thrash position on every resort.
    let a_bucket = (a.fill_ratio * 1000.0).round();
    let b_bucket = (b.fill_ratio * 1000.0).round();
    a_bucket.total_cmp(&b_bucket)
}

/// True if `a` and `b` tie under `compare_branches` for `ctx` — used to
/// compute a node's LHPO (last-highest-priority-offset) within its
/// parent's window.
#[must_use]
pub fn tie(ctx: &PriorityContext, a: &BranchKey, b: &BranchKey) -> bool {
    compare_branches(ctx, a, b) == Ordering::Equal
}

/// Non-negative integer weight for weighted random sampling within a
/// priority class — typically the leaf's ul/dl score.
#[must_use]
pub fn weight(ul_score: f64, dl_score: f64) -> u64 {
    ((ul_score + dl_score).max(0.0) * 1000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branches_with_free_slots_sort_before_saturated_ones() {
        let ctx = ScheduleMode::RwAccess.context();
        let free = BranchKey { available: true, free_slots: 2, fill_ratio: 0.5, taken_slots: 3 };
        let saturated = BranchKey { available: true, free_slots: 0, fill_ratio: 0.1, taken_slots: 1 };
        assert_eq!(compare_branches(&ctx, &free, &saturated), Ordering::Less);
    }

    #[test]
    fn fewer_taken_slots_breaks_ties() {
        let ctx = ScheduleMode::Placement.context();
        let a = BranchKey { available: true, free_slots: 1, fill_ratio: 0.2, taken_slots: 2 };
        let b = BranchKey { available: true, free_slots: 1, fill_ratio: 0.2, taken_slots: 5 };
        assert_eq!(compare_branches(&ctx, &a, &b), Ordering::Less);
    }

    #[test]
    fn dead_branches_sort_last() {
        let ctx = ScheduleMode::Placement.context();
        let alive = BranchKey { available: true, free_slots: 1, fill_ratio: 0.99, taken_slots: 9 };
        let dead = BranchKey { available: false, free_slots: 0, fill_ratio: 0.0, taken_slots: 0 };
        assert_eq!(compare_branches(&ctx, &dead, &alive), Ordering::Greater);
    }

    #[test]
    fn free_slots_reaching_zero_makes_a_branch_saturated() {
        let ctx = ScheduleMode::Placement.context();
        let mut key = BranchKey { available: true, free_slots: 1, fill_ratio: 0.2, taken_slots: 0 };
        assert!(key.has_free_slot());
        key.free_slots -= 1;
        assert!(!key.has_free_slot());
    }
}
