//! Engine configuration.
//!
//! Configuration is an explicit struct handed to the engine at construction
//! time. Unrecognized options are rejected at deserialization time via
//! `deny_unknown_fields`, and `validate()` rejects out-of-range values at
//! startup rather than at first use.
//!
//! # Example Configuration
//!
//! ```toml
//! max_complexity = 1000
//! max_depth = 10
//! default_page_size = 20
//! fail_fast_bulk_mutations = false
//!
//! [cache_ttl_by_tier]
//! query = 30
//! field = 60
//!
//! [field_visibility_overrides.User]
//! exclude = ["password"]
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Cache tier names accepted in `cache_ttl_by_tier`.
const KNOWN_TIERS: &[&str] = &["query", "field"];

/// Per-entity field visibility override.
///
/// `include` and `exclude` are mutually exclusive. Fields removed here are
/// never placed in any generated type, independent of runtime permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldVisibility {
    /// Only these fields are visible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    /// These fields are hidden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
}

impl FieldVisibility {
    /// Creates an override hiding the given fields.
    #[must_use]
    pub fn exclude(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            include: None,
            exclude: Some(fields.into_iter().map(Into::into).collect()),
        }
    }

    /// Creates an override keeping only the given fields.
    #[must_use]
    pub fn include(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            include: Some(fields.into_iter().map(Into::into).collect()),
            exclude: None,
        }
    }

    /// Returns whether a field is visible under this override.
    #[must_use]
    pub fn is_visible(&self, field: &str) -> bool {
        if let Some(include) = &self.include {
            return include.iter().any(|f| f == field);
        }
        if let Some(exclude) = &self.exclude {
            return !exclude.iter().any(|f| f == field);
        }
        true
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum query complexity allowed.
    /// Default: 1000
    #[serde(default = "default_max_complexity")]
    pub max_complexity: usize,

    /// Maximum query depth allowed.
    /// Default: 10
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Page size assumed for unbounded list fields, both for complexity
    /// scoring and for connection pagination.
    /// Default: 20
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// TTL in seconds per cache tier (`query`, `field`). A missing tier or a
    /// TTL of 0 disables that tier. Stale reads within the TTL are an
    /// explicit opt-in; invalidation on mutation applies regardless.
    #[serde(default)]
    pub cache_ttl_by_tier: BTreeMap<String, u64>,

    /// Abort a bulk mutation at the first invalid item instead of collecting
    /// per-item errors.
    /// Default: false
    #[serde(default)]
    pub fail_fast_bulk_mutations: bool,

    /// Per-entity field visibility overrides, resolved at generation time.
    #[serde(default)]
    pub field_visibility_overrides: BTreeMap<String, FieldVisibility>,

    /// Per-entity generated type name overrides, for resolving collisions
    /// deterministically.
    #[serde(default)]
    pub type_name_overrides: BTreeMap<String, String>,

    /// Surface full internal error detail to callers.
    /// Default: false (production mode redacts)
    #[serde(default)]
    pub development_mode: bool,
}

fn default_max_complexity() -> usize {
    1000
}

fn default_max_depth() -> usize {
    10
}

fn default_page_size() -> usize {
    20
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_complexity: default_max_complexity(),
            max_depth: default_max_depth(),
            default_page_size: default_page_size(),
            cache_ttl_by_tier: BTreeMap::new(),
            fail_fast_bulk_mutations: false,
            field_visibility_overrides: BTreeMap::new(),
            type_name_overrides: BTreeMap::new(),
            development_mode: false,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Configuration` if any value is out of range or
    /// names an unknown cache tier.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_complexity == 0 {
            return Err(EngineError::Configuration(
                "max_complexity must be > 0".into(),
            ));
        }
        if self.max_depth == 0 {
            return Err(EngineError::Configuration("max_depth must be > 0".into()));
        }
        if self.default_page_size == 0 {
            return Err(EngineError::Configuration(
                "default_page_size must be > 0".into(),
            ));
        }
        for tier in self.cache_ttl_by_tier.keys() {
            if !KNOWN_TIERS.contains(&tier.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "unknown cache tier: {tier}"
                )));
            }
        }
        for (entity, visibility) in &self.field_visibility_overrides {
            if visibility.include.is_some() && visibility.exclude.is_some() {
                return Err(EngineError::Configuration(format!(
                    "visibility override for {entity} sets both include and exclude"
                )));
            }
        }
        Ok(())
    }

    /// Returns the TTL for a cache tier, `None` when the tier is disabled.
    #[must_use]
    pub fn tier_ttl(&self, tier: &str) -> Option<Duration> {
        match self.cache_ttl_by_tier.get(tier) {
            Some(0) | None => None,
            Some(secs) => Some(Duration::from_secs(*secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_complexity, 1000);
        assert_eq!(config.max_depth, 10);
        assert_eq!(config.default_page_size, 20);
        assert!(!config.fail_fast_bulk_mutations);
        assert!(!config.development_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut config = EngineConfig::default();
        config.max_depth = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_complexity = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.default_page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let mut config = EngineConfig::default();
        config.cache_ttl_by_tier.insert("object".into(), 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tier_ttl() {
        let mut config = EngineConfig::default();
        config.cache_ttl_by_tier.insert("query".into(), 30);
        config.cache_ttl_by_tier.insert("field".into(), 0);

        assert_eq!(config.tier_ttl("query"), Some(Duration::from_secs(30)));
        assert_eq!(config.tier_ttl("field"), None);
    }

    #[test]
    fn test_conflicting_visibility_rejected() {
        let mut config = EngineConfig::default();
        config.field_visibility_overrides.insert(
            "User".into(),
            FieldVisibility {
                include: Some(vec!["id".into()]),
                exclude: Some(vec!["password".into()]),
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_visibility_resolution() {
        let exclude = FieldVisibility::exclude(["password"]);
        assert!(exclude.is_visible("username"));
        assert!(!exclude.is_visible("password"));

        let include = FieldVisibility::include(["id", "username"]);
        assert!(include.is_visible("id"));
        assert!(!include.is_visible("email"));
    }

    #[test]
    fn test_deserialize_from_toml() {
        let toml = r#"
            max_complexity = 500
            max_depth = 8

            [cache_ttl_by_tier]
            query = 30

            [field_visibility_overrides.User]
            exclude = ["password"]
        "#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_complexity, 500);
        assert_eq!(config.max_depth, 8);
        assert_eq!(config.cache_ttl_by_tier.get("query"), Some(&30));
        assert!(
            !config.field_visibility_overrides["User"].is_visible("password")
        );
    }

    #[test]
    fn test_unrecognized_option_rejected() {
        let toml = r#"
            max_depth = 8
            max_breadth = 100
        "#;

        let result: Result<EngineConfig, _> = toml::from_str(toml);
        assert!(result.is_err());
    }
}
