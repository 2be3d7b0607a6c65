use serde::Serialize;

use super::types::{DeviceKind, KindSet};

/// Named, prioritised assertion that certain device kinds must not operate.
///
/// Lower `priority` wins for display and notification. Device gating uses the
/// union of `blocked_kinds` across every active reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockReason {
    pub name: &'static str,
    pub priority: u8,
    #[serde(skip)]
    pub blocked_kinds: KindSet,
    pub fatal: bool,
}

impl LockReason {
    pub const fn new(name: &'static str, priority: u8, blocked_kinds: KindSet, fatal: bool) -> Self {
        Self {
            name,
            priority,
            blocked_kinds,
            fatal,
        }
    }

    pub fn blocks(&self, kind: DeviceKind) -> bool {
        self.blocked_kinds.contains(kind)
    }
}

/// Active reasons ordered by (priority, name)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
    active: Vec<LockReason>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the reason was not yet active
    pub fn add(&mut self, reason: &LockReason) -> bool {
        if self.contains(reason.name) {
            return false;
        }
        let pos = self
            .active
            .partition_point(|r| (r.priority, r.name) < (reason.priority, reason.name));
        self.active.insert(pos, reason.clone());
        true
    }

    /// Returns true if the reason was active
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.active.len();
        self.active.retain(|r| r.name != name);
        before != self.active.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.active.iter().any(|r| r.name == name)
    }

    /// Visible cause
    pub fn top(&self) -> Option<&LockReason> {
        self.active.first()
    }

    pub fn blocked_kinds(&self) -> KindSet {
        self.active
            .iter()
            .fold(KindSet::empty(), |set, r| set.union(r.blocked_kinds))
    }

    pub fn any_fatal(&self) -> bool {
        self.active.iter().any(|r| r.fatal)
    }

    /// True if any reason other than `name` is active
    pub fn any_except(&self, name: &str) -> bool {
        self.active.iter().any(|r| r.name != name)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LockReason> {
        self.active.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeviceKind::*;

    const CELL_HIGH: LockReason = LockReason::new("cell_high", 31, KindSet::empty(), false);

    fn reason(name: &'static str, priority: u8, kinds: &[DeviceKind], fatal: bool) -> LockReason {
        LockReason::new(name, priority, KindSet::of(kinds), fatal)
    }

    #[test]
    fn test_ordering_by_priority() {
        let mut set = LockSet::new();
        assert!(set.add(&reason("cell_low", 32, &[Inverter], false)));
        assert!(set.add(&reason("mqtt_offline", 5, &[Charger, Inverter], true)));
        assert!(!set.add(&reason("cell_low", 32, &[Inverter], false)));
        assert_eq!(set.top().map(|r| r.name), Some("mqtt_offline"));
        assert!(set.any_fatal());
        assert!(set.remove("mqtt_offline"));
        assert!(!set.remove("mqtt_offline"));
        assert_eq!(set.top().map(|r| r.name), Some("cell_low"));
        assert!(!set.any_fatal());
    }

    #[test]
    fn test_blocked_union_includes_low_priority() {
        let mut set = LockSet::new();
        set.add(&reason("startup", 2, &[Charger], false));
        set.add(&reason("cell_high", 31, &[Charger, Solar], false));
        let blocked = set.blocked_kinds();
        assert!(blocked.contains(Solar));
        assert!(blocked.contains(Charger));
        assert!(!blocked.contains(Inverter));
        assert!(set.any_except("startup"));
        set.remove("cell_high");
        assert!(!set.any_except("startup"));
    }

    #[test]
    fn test_const_reason() {
        let mut set = LockSet::new();
        set.add(&CELL_HIGH);
        assert!(set.contains("cell_high"));
        assert!(set.blocked_kinds().is_empty());
    }
}
