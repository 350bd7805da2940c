//! Name and tag filters for listing and removal.

use sealreg_core::error::{RegistryError, Result};

/// Marker for untagged images.
pub const NONE_MARKER: &str = "<none>";

const WILDCARD: char = '*';

/// Which field a filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterType {
    Name,
    Tag,
}

/// Compiled match strategy for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterStrategy {
    /// Matches nothing
    None,
    All,
    Prefix(String),
    Suffix(String),
    Substring(String),
    Exact(String),
}

impl FilterStrategy {
    /// Compile a raw pattern for `field`.
    pub fn compile(pattern: &str, field: FilterType) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" {
            return Ok(FilterStrategy::All);
        }
        if pattern == NONE_MARKER {
            return match field {
                FilterType::Name => Err(RegistryError::InvalidFilter(format!(
                    "repository name cannot be {}",
                    NONE_MARKER
                ))),
                FilterType::Tag => Ok(FilterStrategy::None),
            };
        }

        let wildcards = pattern.matches(WILDCARD).count();
        let leading = pattern.starts_with(WILDCARD);
        let trailing = pattern.ends_with(WILDCARD);
        match wildcards {
            0 => Ok(FilterStrategy::Exact(pattern.to_string())),
            1 if leading => Ok(FilterStrategy::Suffix(pattern[1..].to_string())),
            1 if trailing => Ok(FilterStrategy::Prefix(pattern[..pattern.len() - 1].to_string())),
            2 if leading && trailing && pattern.len() > 2 => Ok(FilterStrategy::Substring(
                pattern[1..pattern.len() - 1].to_string(),
            )),
            _ => Err(RegistryError::InvalidFilter(format!(
                "unsupported wildcard placement in '{}'",
                pattern
            ))),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            FilterStrategy::None => false,
            FilterStrategy::All => true,
            FilterStrategy::Prefix(p) => value.starts_with(p.as_str()),
            FilterStrategy::Suffix(s) => value.ends_with(s.as_str()),
            FilterStrategy::Substring(s) => value.contains(s.as_str()),
            FilterStrategy::Exact(e) => value == e,
        }
    }
}

/// A validated `name=...,tag=...` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: FilterStrategy,
    pub tag: FilterStrategy,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            name: FilterStrategy::All,
            tag: FilterStrategy::All,
        }
    }
}

impl Filter {
    /// Parse a comma-separated `key=value` query.
    ///
    /// Unknown keys are logged and ignored. A missing field matches all.
    pub fn validate(query: &str) -> Result<Self> {
        let mut filter = Filter::default();
        for pair in query.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(RegistryError::InvalidFilter(format!(
                    "expected key=value, got '{}'",
                    pair
                )));
            };
            match key.trim() {
                "name" => filter.name = FilterStrategy::compile(value, FilterType::Name)?,
                "tag" => filter.tag = FilterStrategy::compile(value, FilterType::Tag)?,
                other => tracing::warn!(key = other, "Ignoring unsupported filter key"),
            }
        }
        Ok(filter)
    }

    pub fn strategy(&self, field: FilterType) -> &FilterStrategy {
        match field {
            FilterType::Name => &self.name,
            FilterType::Tag => &self.tag,
        }
    }

    /// Values of `data` matching the `field` strategy, in input order.
    pub fn run(&self, data: &[String], field: FilterType) -> Vec<String> {
        let strategy = self.strategy(field);
        data.iter().filter(|v| strategy.matches(v)).cloned().collect()
    }
}

impl std::str::FromStr for Filter {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Filter::validate(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_substring_round_trip() {
        let filter = Filter::validate("name=*labring*").unwrap();
        assert_eq!(
            filter.run(&strings(&["labring/lvscare", "other/x"]), FilterType::Name),
            vec!["labring/lvscare"]
        );
    }

    #[test]
    fn test_none_marker() {
        let filter = Filter::validate("tag=<none>").unwrap();
        assert_eq!(filter.tag, FilterStrategy::None);
        assert!(filter.run(&strings(&["latest", "<none>"]), FilterType::Tag).is_empty());
        assert!(matches!(
            Filter::validate("name=<none>"),
            Err(RegistryError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_compile_strategies() {
        let compile = |p| FilterStrategy::compile(p, FilterType::Name).unwrap();
        assert_eq!(compile(""), FilterStrategy::All);
        assert_eq!(compile("*"), FilterStrategy::All);
        assert_eq!(compile("lab*"), FilterStrategy::Prefix("lab".into()));
        assert_eq!(compile("*care"), FilterStrategy::Suffix("care".into()));
        assert_eq!(compile("*ring*"), FilterStrategy::Substring("ring".into()));
        assert_eq!(compile("nginx"), FilterStrategy::Exact("nginx".into()));
    }

    #[test]
    fn test_rejects_bad_wildcards() {
        for pattern in ["la*ring", "*a*b", "a**", "**", "a*b*"] {
            assert!(
                FilterStrategy::compile(pattern, FilterType::Tag).is_err(),
                "{} should be rejected",
                pattern
            );
        }
    }

    #[test]
    fn test_run_preserves_order() {
        let filter = Filter::validate("tag=v1*").unwrap();
        let tags = strings(&["v1.2", "latest", "v1.0", "v2"]);
        assert_eq!(filter.run(&tags, FilterType::Tag), vec!["v1.2", "v1.0"]);
        assert_eq!(filter.run(&tags, FilterType::Name), tags);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let filter = Filter::validate("label=x, name=nginx").unwrap();
        assert_eq!(filter.name, FilterStrategy::Exact("nginx".into()));
        assert_eq!(filter.tag, FilterStrategy::All);
    }

    #[test]
    fn test_malformed_pair() {
        assert!(Filter::validate("name").is_err());
        assert_eq!(Filter::validate("").unwrap(), Filter::default());
    }
}
