//! Key/value snapshots attached to containers and objects.
//!
//! Used for both provider metadata (`extra`: content type, ETag, lease
//! state...) and user metadata (`meta_data`, e.g. `x-oss-meta-*`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable, ordered string map.
///
/// There is no in-place mutation: [`Metadata::with`] consumes the snapshot
/// and returns a new one, so a record handed to one caller can never change
/// under another.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a snapshot with `key` set to `value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Same as [`Metadata::with`], skipping `None` values.
    pub fn with_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_leaves_earlier_snapshot_untouched() {
        let base = Metadata::new().with("owner", "ops");
        let derived = base.clone().with("tier", "cold");
        assert_eq!(base.len(), 1);
        assert_eq!(derived.get("tier"), Some("cold"));
        assert_eq!(derived.get("owner"), Some("ops"));
    }

    #[test]
    fn with_opt_skips_none() {
        let meta = Metadata::new()
            .with_opt("a", Some("1"))
            .with_opt("b", None::<String>);
        assert!(meta.contains_key("a"));
        assert!(!meta.contains_key("b"));
    }
}
