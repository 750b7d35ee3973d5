//! Snapshot metadata: lineage records and the namespaced snapshotter facade.

pub mod snapshotter;
pub mod storage;

use berth_common::filters::label_field;
use berth_common::types::Timestamp;
use berth_common::{Adaptor, Error, Labels, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use snapshotter::MetaSnapshotter;

/// Lifecycle state of a snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Read-only working mount
    View,
    /// Mutable working mount
    Active,
    /// Immutable; the only kind that may be a parent
    Committed,
}

impl Kind {
    pub(crate) const fn to_byte(self) -> u8 {
        match self {
            Self::View => 1,
            Self::Active => 2,
            Self::Committed => 3,
        }
    }

    pub(crate) const fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::View),
            2 => Some(Self::Active),
            3 => Some(Self::Committed),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::View => "view",
            Self::Active => "active",
            Self::Committed => "committed",
        })
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "view" => Ok(Self::View),
            "active" => Ok(Self::Active),
            "committed" => Ok(Self::Committed),
            _ => Err(Error::invalid_argument(format!("unknown snapshot kind {s:?}"))),
        }
    }
}

/// Metadata of one snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub kind: Kind,
    pub name: String,
    /// Parent key, empty for a root snapshot
    pub parent: String,
    pub labels: Labels,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Info {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            kind: Kind::Active,
            name: name.into(),
            parent: String::new(),
            labels: Labels::new(),
            created_at: Timestamp::default(),
            updated_at: Timestamp::default(),
        }
    }
}

impl Adaptor for Info {
    fn field(&self, fieldpath: &[String]) -> Option<String> {
        match fieldpath.first().map(String::as_str)? {
            "kind" => Some(self.kind.to_string()),
            "name" => Some(self.name.clone()),
            "parent" => Some(self.parent.clone()),
            "labels" => label_field(&self.labels, &fieldpath[1..]),
            _ => None,
        }
    }
}

/// Resource usage of a snapshot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub inodes: i64,
    pub size: i64,
}

impl Usage {
    pub fn add(&mut self, other: Self) {
        self.inodes += other.inodes;
        self.size += other.size;
    }
}

/// Lineage view of an active or view snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub id: u64,
    pub kind: Kind,
    /// Ancestor ids, immediate parent first
    pub parent_ids: Vec<u64>,
}

/// Mount instruction returned by a backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub options: Vec<String>,
}

/// Storage backend that performs the actual snapshot work.
///
/// Keys passed to a backend are already namespaced and unique per
/// snapshot id; the backend never sees caller-chosen keys directly.
pub trait Snapshotter: Send + Sync {
    fn prepare(&self, key: &str, parent: &str) -> Result<Vec<Mount>>;

    fn view(&self, key: &str, parent: &str) -> Result<Vec<Mount>>;

    fn commit(&self, name: &str, key: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Kind of the backend snapshot, `NotFound` if absent
    fn stat(&self, key: &str) -> Result<Kind>;

    fn mounts(&self, key: &str) -> Result<Vec<Mount>>;

    /// Every key the backend holds
    fn walk(&self, f: &mut dyn FnMut(&str) -> Result<()>) -> Result<()>;

    fn usage(&self, key: &str) -> Result<Usage>;
}

/// Options for creating or committing a snapshot
#[derive(Clone, Debug, Default)]
pub struct SnapshotOpts {
    pub labels: Labels,
}

impl SnapshotOpts {
    #[must_use]
    pub fn with_labels(labels: Labels) -> Self {
        Self { labels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_common::Filter;

    #[test]
    fn test_kind_codec() {
        for k in [Kind::View, Kind::Active, Kind::Committed] {
            assert_eq!(Kind::from_byte(k.to_byte()), Some(k));
            assert_eq!(k.to_string().parse::<Kind>().unwrap(), k);
        }
        assert_eq!(Kind::from_byte(0), None);
        assert!("bogus".parse::<Kind>().unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_info_filter_fields() {
        let mut info = Info::new("layer-1");
        info.kind = Kind::Committed;
        info.parent = "base".into();
        info.labels.insert("containerd.io/gc.root".into(), "1".into());

        assert!(Filter::parse("kind==committed,parent==base").unwrap().matches(&info));
        assert!(Filter::parse(r#"labels."containerd.io/gc.root""#).unwrap().matches(&info));
        assert!(!Filter::parse("name==other").unwrap().matches(&info));
    }
}
