//! Labels and the reserved garbage collection label convention.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Label map stored with every record
pub type Labels = BTreeMap<String, String>;

/// Maximum combined size of a label key and value
pub const MAX_LABEL_SIZE: usize = 4096;

/// Marks a content or snapshot node as a root
pub const LABEL_GC_ROOT: &str = "containerd.io/gc.root";
/// Prefix of every reference label
pub const LABEL_GC_REF_PREFIX: &str = "containerd.io/gc.ref.";
/// References a content digest
pub const LABEL_GC_REF_CONTENT: &str = "containerd.io/gc.ref.content";
/// References a snapshot: `containerd.io/gc.ref.snapshot.<snapshotter>`
pub const LABEL_GC_REF_SNAPSHOT: &str = "containerd.io/gc.ref.snapshot.";
/// A lease carrying this label only keeps its listed resources alive
pub const LABEL_GC_FLAT: &str = "containerd.io/gc.flat";
/// RFC 3339 expiry for leases, images and rooted nodes
pub const LABEL_GC_EXPIRE: &str = "containerd.io/gc.expire";

/// Validate a single label
pub fn validate(key: &str, value: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("label key must not be empty"));
    }
    if key.contains('\0') {
        return Err(Error::invalid_argument(format!(
            "label key {key:?} contains a NUL byte"
        )));
    }
    if key.len() + value.len() > MAX_LABEL_SIZE {
        let head: String = key.chars().take(10).collect();
        return Err(Error::invalid_argument(format!(
            "label key and value length ({} bytes) greater than maximum size ({MAX_LABEL_SIZE} bytes), key: {head}",
            key.len() + value.len()
        )));
    }
    Ok(())
}

/// Validate every label in the map
pub fn validate_all(labels: &Labels) -> Result<()> {
    labels.iter().try_for_each(|(k, v)| validate(k, v))
}

/// Build a label map from key/value pairs
pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Labels
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Return the part of `key` after `prefix` when the key is `prefix`
/// itself or `prefix` followed by `.` or `/` and a suffix.
///
/// `containerd.io/gc.ref.content`, `containerd.io/gc.ref.content.0` and
/// `containerd.io/gc.ref.content/l0` all match the content prefix.
#[must_use]
pub fn reference_suffix<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some(rest);
    }
    rest.strip_prefix('.').or_else(|| rest.strip_prefix('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_label_size() {
        assert!(validate("k", "v").is_ok());
        assert!(validate("", "v").is_err());
        assert!(validate("k", &"v".repeat(MAX_LABEL_SIZE)).is_err());
        assert!(validate("k", &"v".repeat(MAX_LABEL_SIZE - 1)).is_ok());
    }

    #[test]
    fn test_reference_suffix() {
        assert_eq!(reference_suffix(LABEL_GC_REF_CONTENT, LABEL_GC_REF_CONTENT), Some(""));
        assert_eq!(
            reference_suffix("containerd.io/gc.ref.content.0", LABEL_GC_REF_CONTENT),
            Some("0")
        );
        assert_eq!(
            reference_suffix("containerd.io/gc.ref.content/layer", LABEL_GC_REF_CONTENT),
            Some("layer")
        );
        assert_eq!(
            reference_suffix("containerd.io/gc.ref.contentx", LABEL_GC_REF_CONTENT),
            None
        );
    }
}
