/// Notification sent to registered listeners on every mutation (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Updated(u64),
    Deleted(u64),
}

/// Registered by callers that want to observe container or file mutations
/// (e.g. WASP-style overlays, audit trails, index maintainers).
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: ChangeEvent);
}
