//! Tag schema identifying replica set resources.
//!
//! Every task, volume and snapshot the controller owns is tagged under the
//! prefix `ess:<set>:`. The replica index is parsed into a [`ReplicaIndex`]
//! here; anything without a well-formed index is not part of the set.

use std::fmt;

use ess_cloud::Tags;
use serde::{Deserialize, Serialize};

/// Ordinal of one replica within the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaIndex(u32);

impl ReplicaIndex {
    /// Wrap a raw index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Raw index value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Parse a tag value. Only plain decimal digits are accepted.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        value.parse().ok().map(Self)
    }
}

impl fmt::Display for ReplicaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Tag keys for one replica set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSchema {
    prefix: String,
}

impl TagSchema {
    /// Schema for the set named `set_name`.
    #[must_use]
    pub fn new(set_name: &str) -> Self {
        Self {
            prefix: format!("ess:{set_name}:"),
        }
    }

    /// Key holding the replica index.
    #[must_use]
    pub fn index_key(&self) -> String {
        format!("{}index", self.prefix)
    }

    /// Key of the managed marker.
    #[must_use]
    pub fn managed_key(&self) -> String {
        format!("{}managed", self.prefix)
    }

    /// Key linking a snapshot to its source volume.
    #[must_use]
    pub fn volume_id_key(&self) -> String {
        format!("{}volume-id", self.prefix)
    }

    /// Key naming the snapshot a task's volume was restored from.
    #[must_use]
    pub fn snapshot_id_key(&self) -> String {
        format!("{}snapshot-id", self.prefix)
    }

    /// Replica index carried by `tags`, if well formed.
    #[must_use]
    pub fn index_of(&self, tags: &Tags) -> Option<ReplicaIndex> {
        tags.get(&self.index_key())
            .and_then(|v| ReplicaIndex::parse(v))
    }

    /// Tags for a replica task and its volume.
    #[must_use]
    pub fn replica_tags(&self, index: ReplicaIndex, restored_from: Option<&str>) -> Tags {
        let mut tags = Tags::from([
            (self.index_key(), index.to_string()),
            (self.managed_key(), "true".to_string()),
        ]);
        if let Some(snapshot_id) = restored_from {
            tags.insert(self.snapshot_id_key(), snapshot_id.to_string());
        }
        tags
    }

    /// Tags for a snapshot of `volume_id`.
    #[must_use]
    pub fn snapshot_tags(&self, index: ReplicaIndex, volume_id: &str) -> Tags {
        Tags::from([
            (self.index_key(), index.to_string()),
            (self.managed_key(), "true".to_string()),
            (self.volume_id_key(), volume_id.to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_parse_fails_closed() {
        assert_eq!(ReplicaIndex::parse("0"), Some(ReplicaIndex::new(0)));
        assert_eq!(ReplicaIndex::parse("12"), Some(ReplicaIndex::new(12)));
        assert_eq!(ReplicaIndex::parse(""), None);
        assert_eq!(ReplicaIndex::parse("-1"), None);
        assert_eq!(ReplicaIndex::parse("+1"), None);
        assert_eq!(ReplicaIndex::parse(" 1"), None);
        assert_eq!(ReplicaIndex::parse("1a"), None);
        assert_eq!(ReplicaIndex::parse("99999999999"), None);
    }

    #[test]
    fn test_schema_is_scoped_by_set() {
        let db = TagSchema::new("db");
        let cache = TagSchema::new("cache");
        let tags = db.replica_tags(ReplicaIndex::new(1), Some("snap-1"));

        assert_eq!(db.index_of(&tags), Some(ReplicaIndex::new(1)));
        assert_eq!(tags.get("ess:db:managed").map(String::as_str), Some("true"));
        assert_eq!(
            tags.get("ess:db:snapshot-id").map(String::as_str),
            Some("snap-1")
        );
        assert_eq!(cache.index_of(&tags), None);
        assert!(!tags.contains_key("ess:cache:managed"));
    }

    #[test]
    fn test_snapshot_tags_carry_lineage() {
        let schema = TagSchema::new("db");
        let tags = schema.snapshot_tags(ReplicaIndex::new(4), "vol-9");
        assert_eq!(tags.get("ess:db:volume-id").map(String::as_str), Some("vol-9"));
        assert_eq!(tags.get("ess:db:index").map(String::as_str), Some("4"));
        assert_eq!(tags.get("ess:db:managed").map(String::as_str), Some("true"));
    }
}
