use freshet_core::{CacheEntry, CacheKey, CacheSettings, Clock, ManualClock};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn dotted_key() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,6}", 1..=4).prop_map(|parts| parts.join("."))
}

fn settings_with(entries: &[(&str, u64)]) -> CacheSettings {
    let mut toml = String::from("default_poll_interval_ms = 4000\n");
    for (key, expiration_ms) in entries {
        toml.push_str(&format!(
            "[policies.\"{}\"]\nexpiration_ms = {}\nauto_refresh = false\n",
            key, expiration_ms
        ));
    }
    CacheSettings::from_toml_str(&toml).unwrap()
}

#[test]
fn namespace_policy_applies_to_children_only() {
    let settings = settings_with(&[("receipt", 1_000), ("receipt.summary", 300_000)]);

    let summary = settings.policy_for(&CacheKey::new("receipt.summary")).unwrap();
    assert_eq!(summary.expiration, Duration::from_secs(300));

    let list = settings.policy_for(&CacheKey::new("receipt.list")).unwrap();
    assert_eq!(list.expiration, Duration::from_secs(1));

    assert!(settings.policy_for(&CacheKey::new("receipts")).is_none());
}

#[test]
fn entry_without_value_is_never_fresh() {
    let clock = ManualClock::new();
    let mut entry: CacheEntry<u32> = CacheEntry::empty(CacheKey::new("summary"));
    entry.expires_at = Some(clock.now() + Duration::from_secs(60));
    assert!(entry.is_stale(clock.now()));
}

proptest! {
    #[test]
    fn parents_are_namespaces_of_key(key in dotted_key()) {
        let key = CacheKey::new(key);
        let parents: Vec<&str> = key.parents().collect();
        prop_assert_eq!(parents.len(), key.as_str().matches('.').count());
        for parent in &parents {
            prop_assert!(key.in_namespace(parent));
        }
        for pair in parents.windows(2) {
            prop_assert!(pair[0].len() > pair[1].len());
        }
    }

    #[test]
    fn freshness_ends_exactly_at_expiry(expiration_ms in 1u64..100_000, probe_ms in 0u64..200_000) {
        let clock = Arc::new(ManualClock::new());
        let committed = clock.now();
        let entry = CacheEntry {
            value: Some(Arc::new(7_u32)),
            fetched_at: Some(committed),
            expires_at: Some(committed + Duration::from_millis(expiration_ms)),
            ..CacheEntry::empty(CacheKey::new("k"))
        };
        clock.advance(Duration::from_millis(probe_ms));
        prop_assert_eq!(entry.is_fresh(clock.now()), probe_ms < expiration_ms);
    }

    #[test]
    fn longest_configured_parent_wins(key in dotted_key()) {
        let key = CacheKey::new(key);
        let parents: Vec<String> = key.parents().map(str::to_string).collect();
        prop_assume!(!parents.is_empty());
        let entries: Vec<(&str, u64)> = parents
            .iter()
            .enumerate()
            .map(|(depth, parent)| (parent.as_str(), 1_000 * (depth as u64 + 1)))
            .collect();
        let settings = settings_with(&entries);
        let policy = settings.policy_for(&key).unwrap();
        prop_assert_eq!(policy.expiration, Duration::from_millis(1_000));
    }
}
