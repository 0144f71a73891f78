//! Per-FSID and group-level drain status, and the table mapping one to
//! the other (§4.11 item 5).

/// Drain state of a single filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainState {
    NotDraining,
    Draining,
    Drained,
    DrainFailed,
}

/// Online flag plus drain state for one member filesystem of a group.
#[derive(Debug, Clone, Copy)]
pub struct FsStatus {
    pub online: bool,
    pub drain: DrainState,
}

/// Group-level status derived from its members' statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Off,
    DrainComplete,
    DrainFailed,
    On,
}

/// Derive a group's status from its members, per the table in §4.11:
/// any offline member forces *Off*; all-drained-and-online is
/// *DrainComplete*; all drained-or-failed with at least one failure is
/// *DrainFailed*; otherwise *On*.
#[must_use]
pub fn group_status(members: &[FsStatus]) -> GroupStatus {
    if members.iter().any(|m| !m.online) {
        return GroupStatus::Off;
    }
    if members.iter().all(|m| m.drain == DrainState::Drained) {
        return GroupStatus::DrainComplete;
    }
    let all_settled = members.iter().all(|m| matches!(m.drain, DrainState::Drained | DrainState::DrainFailed));
    let any_failed = members.iter().any(|m| m.drain == DrainState::DrainFailed);
    if all_settled && any_failed {
        return GroupStatus::DrainFailed;
    }
    GroupStatus::On
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs(online: bool, drain: DrainState) -> FsStatus {
        FsStatus { online, drain }
    }

    #[test]
    fn any_offline_member_forces_off() {
        let members = vec![fs(true, DrainState::Drained), fs(false, DrainState::Draining)];
        assert_eq!(group_status(&members), GroupStatus::Off);
    }

    #[test]
    fn all_drained_is_drain_complete() {
        let members = vec![fs(true, DrainState::Drained), fs(true, DrainState::Drained)];
        assert_eq!(group_status(&members), GroupStatus::DrainComplete);
    }

    #[test]
    fn mixed_drained_and_failed_is_drain_failed() {
        let members = vec![fs(true, DrainState::Drained), fs(true, DrainState::DrainFailed)];
        assert_eq!(group_status(&members), GroupStatus::DrainFailed);
    }

    #[test]
    fn still_draining_member_is_on() {
        let members = vec![fs(true, DrainState::Drained), fs(true, DrainState::Draining)];
        assert_eq!(group_status(&members), GroupStatus::On);
    }
}
