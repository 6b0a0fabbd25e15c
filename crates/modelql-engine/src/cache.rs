//! Tag-indexed, TTL-bounded in-memory cache tiers.
//!
//! A [`CacheTier`] is a concurrent key/value map with an inverted tag index,
//! so a mutation can drop every cached value derived from an entity without
//! enumerating keys. The [`CacheManager`] owns the query-result and field
//! tiers; the schema registry owns its own tier for compiled schemas.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::schema::Fingerprint;

/// Attempts made to drain a tag before giving up on concurrent re-taggers.
const INVALIDATE_ATTEMPTS: usize = 3;

struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
    tags: Vec<String>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// One cache tier: entries plus a tag -> keys index.
pub struct CacheTier<V: Clone> {
    name: &'static str,
    entries: DashMap<String, CacheEntry<V>>,
    tag_index: DashMap<String, HashSet<String>>,
}

impl<V: Clone> CacheTier<V> {
    /// Creates an empty tier.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            tag_index: DashMap::new(),
        }
    }

    /// Returns the cached value for a key, dropping it if expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = {
            let entry = self.entries.get(key)?;
            if entry.is_expired() {
                true
            } else {
                return Some(entry.value.clone());
            }
        };
        if expired {
            self.remove(key);
        }
        None
    }

    /// Stores a value under a key with the given TTL and tags.
    ///
    /// A `ttl` of `None` means the entry never expires on its own; it is only
    /// removed by tag invalidation or replacement.
    pub fn put(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        tags: impl IntoIterator<Item = String>,
    ) {
        let key = key.into();
        let tags: Vec<String> = tags.into_iter().collect();

        if let Some(old) = self.entries.remove(&key) {
            self.untag(&key, &old.1.tags);
        }
        for tag in &tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
                tags,
            },
        );
    }

    /// Removes one key and its tag-index references.
    pub fn remove(&self, key: &str) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.untag(key, &entry.tags);
        }
    }

    /// Removes every entry carrying the tag and returns how many were dropped.
    ///
    /// Concurrent writers may re-tag new keys while the drain runs, so the
    /// drain repeats until the tag is empty or the attempt budget runs out.
    pub fn invalidate(&self, tag: &str) -> usize {
        let mut removed = 0;
        for _ in 0..INVALIDATE_ATTEMPTS {
            let Some((_, keys)) = self.tag_index.remove(tag) else {
                return removed;
            };
            for key in keys {
                if let Some((_, entry)) = self.entries.remove(&key) {
                    removed += 1;
                    self.untag(&key, &entry.tags);
                }
            }
        }
        if self.tag_index.contains_key(tag) {
            warn!(tier = self.name, tag, "Tag still populated after invalidation attempts");
        }
        removed
    }

    /// Number of stored entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the tier holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry and the whole tag index.
    pub fn clear(&self) {
        self.entries.clear();
        self.tag_index.clear();
    }

    fn untag(&self, key: &str, tags: &[String]) {
        for tag in tags {
            let empty = self
                .tag_index
                .get_mut(tag)
                .map(|mut keys| {
                    keys.remove(key);
                    keys.is_empty()
                })
                .unwrap_or(false);
            if empty {
                self.tag_index.remove_if(tag, |_, keys| keys.is_empty());
            }
        }
    }
}

/// Builds the key a query response is cached under.
///
/// The query text is whitespace-normalized so formatting differences hit the
/// same entry; variables and the caller partition keep responses from leaking
/// across identities.
#[must_use]
pub fn query_cache_key(
    fingerprint: Fingerprint,
    query: &str,
    variables: &Value,
    partition: &str,
) -> String {
    let normalized: Vec<&str> = query.split_whitespace().collect();
    format!("{fingerprint}:{}:{variables}:{partition}", normalized.join(" "))
}

/// Builds the field-tier key for a single-entity root read.
#[must_use]
pub fn field_cache_key(fingerprint: Fingerprint, entity: &str, id: &str, partition: &str) -> String {
    format!("{fingerprint}:{entity}:{id}:{partition}")
}

/// Owns the query-result and field tiers.
///
/// A tier whose configured TTL is missing or zero is disabled: writes are
/// dropped and reads always miss. Invalidation still runs against both tiers
/// so a tier re-enabled by a config change never serves stale values.
pub struct CacheManager {
    query: CacheTier<Value>,
    field: CacheTier<Value>,
    query_ttl: Option<Duration>,
    field_ttl: Option<Duration>,
}

impl CacheManager {
    /// Creates the manager from engine configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            query: CacheTier::new("query"),
            field: CacheTier::new("field"),
            query_ttl: config.tier_ttl("query"),
            field_ttl: config.tier_ttl("field"),
        }
    }

    /// Probes the query tier.
    #[must_use]
    pub fn get_query(&self, key: &str) -> Option<Value> {
        self.query_ttl.and_then(|_| self.query.get(key))
    }

    /// Stores a query response, tagged with the entities it touched.
    pub fn put_query(&self, key: impl Into<String>, value: Value, tags: Vec<String>) {
        if let Some(ttl) = self.query_ttl {
            self.query.put(key, value, Some(ttl), tags);
        }
    }

    /// Probes the field tier.
    #[must_use]
    pub fn get_field(&self, key: &str) -> Option<Value> {
        self.field_ttl.and_then(|_| self.field.get(key))
    }

    /// Stores a single-entity read, tagged with `entity` and `entity:id`.
    pub fn put_field(&self, key: impl Into<String>, value: Value, entity: &str, id: &str) {
        if let Some(ttl) = self.field_ttl {
            self.field
                .put(key, value, Some(ttl), vec![entity.to_string(), format!("{entity}:{id}")]);
        }
    }

    /// Drops everything derived from an entity instance across both tiers.
    ///
    /// Runs after a mutation's apply commits. Returns how many entries fell.
    pub fn invalidate_entity(&self, entity: &str, id: Option<&str>) -> usize {
        let mut tags = vec![entity.to_string()];
        if let Some(id) = id {
            tags.push(format!("{entity}:{id}"));
        }
        let mut removed = 0;
        for tag in &tags {
            removed += self.query.invalidate(tag);
            removed += self.field.invalidate(tag);
        }
        debug!(entity, removed, "Invalidated cached entries");
        removed
    }

    /// Drops all cached responses, both tiers.
    pub fn clear(&self) {
        self.query.clear();
        self.field.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_get() {
        let tier: CacheTier<Value> = CacheTier::new("test");
        tier.put("k", json!({"a": 1}), None, vec!["User".into()]);
        assert_eq!(tier.get("k"), Some(json!({"a": 1})));
        assert_eq!(tier.get("missing"), None);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let tier: CacheTier<Value> = CacheTier::new("test");
        tier.put("k", json!(1), Some(Duration::ZERO), vec![]);
        assert_eq!(tier.get("k"), None);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_invalidate_by_tag() {
        let tier: CacheTier<Value> = CacheTier::new("test");
        tier.put("a", json!(1), None, vec!["User".into(), "User:1".into()]);
        tier.put("b", json!(2), None, vec!["User".into()]);
        tier.put("c", json!(3), None, vec!["Post".into()]);

        assert_eq!(tier.invalidate("User"), 2);
        assert_eq!(tier.get("a"), None);
        assert_eq!(tier.get("b"), None);
        assert_eq!(tier.get("c"), Some(json!(3)));
        // The narrower tag no longer references the removed key.
        assert_eq!(tier.invalidate("User:1"), 0);
    }

    #[test]
    fn test_replacement_retags() {
        let tier: CacheTier<Value> = CacheTier::new("test");
        tier.put("k", json!(1), None, vec!["User".into()]);
        tier.put("k", json!(2), None, vec!["Post".into()]);

        assert_eq!(tier.invalidate("User"), 0);
        assert_eq!(tier.get("k"), Some(json!(2)));
        assert_eq!(tier.invalidate("Post"), 1);
        assert_eq!(tier.get("k"), None);
    }

    #[test]
    fn test_manager_disabled_tier_drops_writes() {
        let config = EngineConfig::default();
        let cache = CacheManager::new(&config);
        cache.put_query("k", json!(1), vec!["User".into()]);
        assert_eq!(cache.get_query("k"), None);
    }

    #[test]
    fn test_manager_entity_invalidation_spans_tiers() {
        let mut config = EngineConfig::default();
        config.cache_ttl_by_tier.insert("query".into(), 60);
        config.cache_ttl_by_tier.insert("field".into(), 60);
        let cache = CacheManager::new(&config);

        cache.put_query("q1", json!({"users": []}), vec!["User".into()]);
        cache.put_field("f1", json!({"id": "1"}), "User", "1");
        cache.put_field("f2", json!({"id": "9"}), "Post", "9");

        assert_eq!(cache.invalidate_entity("User", Some("1")), 2);
        assert_eq!(cache.get_query("q1"), None);
        assert_eq!(cache.get_field("f1"), None);
        assert_eq!(cache.get_field("f2"), Some(json!({"id": "9"})));
    }

    #[test]
    fn test_query_cache_key_normalizes_whitespace() {
        let fp = Fingerprint::compute(&[], &crate::schema::GenerationOptions::default());
        let a = query_cache_key(fp, "{ user { id } }", &json!({}), "anonymous");
        let b = query_cache_key(fp, "{\n  user {\n    id\n  }\n}", &json!({}), "anonymous");
        assert_eq!(a, b);

        let other = query_cache_key(fp, "{ user { id } }", &json!({}), "admin");
        assert_ne!(a, other);
    }
}
