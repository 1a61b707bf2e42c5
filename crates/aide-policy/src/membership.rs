use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;

/// Time-bounded cache of group memberships, used for DM knowledge-scope
/// expansion in business mode.
///
/// Each member is indexed under every identifier the transport reports for
/// them (phone number and UUID), so lookups accept either form.
pub struct MembershipCache {
    groups: DashMap<String, HashSet<String>>,
    refreshed_at_ms: AtomicI64,
    ttl_ms: i64,
}

impl MembershipCache {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            groups: DashMap::new(),
            refreshed_at_ms: AtomicI64::new(0),
            ttl_ms,
        }
    }

    /// Replace one group's membership. `identifiers` holds every known id
    /// per member, flattened; duplicates collapse in the set.
    pub fn update_group(&self, group_id: &str, identifiers: impl IntoIterator<Item = String>) {
        let members: HashSet<String> =
            identifiers.into_iter().filter(|id| !id.is_empty()).collect();
        self.groups.insert(group_id.to_string(), members);
    }

    pub fn mark_refreshed(&self, now_ms: i64) {
        self.refreshed_at_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn is_stale(&self, now_ms: i64) -> bool {
        now_ms - self.refreshed_at_ms.load(Ordering::Relaxed) > self.ttl_ms
    }

    /// Groups the given identifier belongs to.
    pub fn user_groups(&self, member_id: &str) -> Vec<String> {
        self.groups
            .iter()
            .filter(|entry| entry.value().contains(member_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn is_member(&self, group_id: &str, member_id: &str) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|members| members.contains(member_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_accepts_both_identifier_forms() {
        let cache = MembershipCache::new(900_000);
        cache.update_group(
            "team",
            vec![
                "+15550001111".to_string(),
                "3f1c9a32-aaaa-bbbb-cccc-000000000001".to_string(),
            ],
        );
        assert!(cache.is_member("team", "+15550001111"));
        assert!(cache.is_member("team", "3f1c9a32-aaaa-bbbb-cccc-000000000001"));
        assert_eq!(cache.user_groups("+15550001111"), vec!["team".to_string()]);
    }

    #[test]
    fn empty_identifiers_are_dropped() {
        let cache = MembershipCache::new(900_000);
        cache.update_group("team", vec![String::new(), "+1".to_string()]);
        assert!(!cache.is_member("team", ""));
        assert!(cache.is_member("team", "+1"));
    }

    #[test]
    fn staleness_follows_ttl() {
        let cache = MembershipCache::new(1_000);
        assert!(cache.is_stale(2_000));
        cache.mark_refreshed(2_000);
        assert!(!cache.is_stale(2_500));
        assert!(cache.is_stale(3_001));
    }

    #[test]
    fn replacement_drops_old_members() {
        let cache = MembershipCache::new(900_000);
        cache.update_group("g", vec!["+1".to_string()]);
        cache.update_group("g", vec!["+2".to_string()]);
        assert!(!cache.is_member("g", "+1"));
        assert!(cache.is_member("g", "+2"));
    }
}
