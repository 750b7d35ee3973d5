//! Typed field encoding shared by the stores.
//!
//! Strings are stored raw, integers as varints, timestamps as RFC 3339
//! text, and opaque payloads with bincode. Labels, annotations and
//! extensions are sub-buckets with one entry per key so single keys can be
//! updated in place.

use crate::error::{MetaStoreResult, corrupt};
use crate::kv::{self, KvRead, KvWrite, Path};
use crate::schema::{KEY_CREATED_AT, KEY_LABELS, KEY_UPDATED_AT};
use berth_common::types::{Timestamp, format_timestamp, parse_timestamp};
use berth_common::{Any, Labels};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

pub fn read_string<K: KvRead + ?Sized>(kv: &K, path: &Path) -> MetaStoreResult<Option<String>> {
    kv.get(path.as_bytes())?
        .map(|v| String::from_utf8(v).map_err(|e| corrupt(path, e)))
        .transpose()
}

pub fn write_string<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, value: &str) -> MetaStoreResult<()> {
    kv.put(path.as_bytes(), value.as_bytes())
}

/// Write `value`, or remove the field when it is empty
pub fn write_optional_string<K: KvWrite + ?Sized>(
    kv: &mut K,
    path: &Path,
    value: &str,
) -> MetaStoreResult<()> {
    if value.is_empty() {
        kv.delete(path.as_bytes())?;
        Ok(())
    } else {
        write_string(kv, path, value)
    }
}

pub fn read_uvarint<K: KvRead + ?Sized>(kv: &K, path: &Path) -> MetaStoreResult<Option<u64>> {
    kv.get(path.as_bytes())?
        .map(|v| {
            kv::uvarint(&v)
                .map(|(n, _)| n)
                .ok_or_else(|| corrupt(path, "invalid uvarint"))
        })
        .transpose()
}

pub fn write_uvarint<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, value: u64) -> MetaStoreResult<()> {
    kv.put(path.as_bytes(), &kv::encode_uvarint(value))
}

pub fn read_varint<K: KvRead + ?Sized>(kv: &K, path: &Path) -> MetaStoreResult<Option<i64>> {
    kv.get(path.as_bytes())?
        .map(|v| {
            kv::varint(&v)
                .map(|(n, _)| n)
                .ok_or_else(|| corrupt(path, "invalid varint"))
        })
        .transpose()
}

pub fn write_varint<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, value: i64) -> MetaStoreResult<()> {
    kv.put(path.as_bytes(), &kv::encode_varint(value))
}

pub fn read_timestamp<K: KvRead + ?Sized>(kv: &K, path: &Path) -> MetaStoreResult<Option<Timestamp>> {
    read_string(kv, path)?
        .map(|s| parse_timestamp(&s).map_err(|e| corrupt(path, e)))
        .transpose()
}

pub fn write_timestamp<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, ts: &Timestamp) -> MetaStoreResult<()> {
    write_string(kv, path, &format_timestamp(ts))
}

/// Read `createdat` and `updatedat` of a record, defaulting to the epoch
pub fn read_timestamps<K: KvRead + ?Sized>(kv: &K, record: &Path) -> MetaStoreResult<(Timestamp, Timestamp)> {
    let created = read_timestamp(kv, &record.join(KEY_CREATED_AT))?.unwrap_or_default();
    let updated = read_timestamp(kv, &record.join(KEY_UPDATED_AT))?.unwrap_or_default();
    Ok((created, updated))
}

pub fn write_timestamps<K: KvWrite + ?Sized>(
    kv: &mut K,
    record: &Path,
    created: &Timestamp,
    updated: &Timestamp,
) -> MetaStoreResult<()> {
    write_timestamp(kv, &record.join(KEY_CREATED_AT), created)?;
    write_timestamp(kv, &record.join(KEY_UPDATED_AT), updated)
}

pub fn read_bincode<K: KvRead + ?Sized, T: DeserializeOwned>(kv: &K, path: &Path) -> MetaStoreResult<Option<T>> {
    kv.get(path.as_bytes())?
        .map(|v| bincode::deserialize(&v).map_err(Into::into))
        .transpose()
}

pub fn write_bincode<K: KvWrite + ?Sized, T: Serialize>(kv: &mut K, path: &Path, value: &T) -> MetaStoreResult<()> {
    kv.put(path.as_bytes(), &bincode::serialize(value)?)
}

/// Self-describing encoding for values whose serde layout skips fields
pub fn read_json<K: KvRead + ?Sized, T: DeserializeOwned>(kv: &K, path: &Path) -> MetaStoreResult<Option<T>> {
    kv.get(path.as_bytes())?
        .map(|v| serde_json::from_slice(&v).map_err(|e| corrupt(path, e)))
        .transpose()
}

pub fn write_json<K: KvWrite + ?Sized, T: Serialize>(kv: &mut K, path: &Path, value: &T) -> MetaStoreResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| corrupt(path, e))?;
    kv.put(path.as_bytes(), &bytes)
}

/// Read a string map stored one entry per key under `bucket`
pub fn read_map<K: KvRead + ?Sized>(kv: &K, bucket: &Path) -> MetaStoreResult<Labels> {
    kv::leaves(kv, bucket)?
        .into_iter()
        .map(|(k, v)| -> MetaStoreResult<(String, String)> {
            let v = String::from_utf8(v).map_err(|e| corrupt(bucket.join(&k), e))?;
            Ok((k, v))
        })
        .collect()
}

/// Replace the whole map under `bucket`
pub fn write_map<K: KvWrite + ?Sized>(kv: &mut K, bucket: &Path, map: &Labels) -> MetaStoreResult<()> {
    kv::delete_bucket(kv, bucket)?;
    for (k, v) in map {
        write_string(kv, &bucket.join(k), v)?;
    }
    Ok(())
}

/// Set one key of a map; an empty value removes it
pub fn write_map_entry<K: KvWrite + ?Sized>(
    kv: &mut K,
    bucket: &Path,
    key: &str,
    value: Option<&str>,
) -> MetaStoreResult<()> {
    let path = bucket.join(key);
    match value {
        Some(v) if !v.is_empty() => write_string(kv, &path, v),
        _ => {
            kv.delete(path.as_bytes())?;
            Ok(())
        }
    }
}

pub fn read_any<K: KvRead + ?Sized>(kv: &K, path: &Path) -> MetaStoreResult<Option<Any>> {
    read_bincode(kv, path)
}

pub fn write_any<K: KvWrite + ?Sized>(kv: &mut K, path: &Path, value: Option<&Any>) -> MetaStoreResult<()> {
    match value {
        Some(any) => write_bincode(kv, path, any),
        None => {
            kv.delete(path.as_bytes())?;
            Ok(())
        }
    }
}

/// Change to a string map requested through field paths
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MapUpdate {
    /// Replace the whole map
    Replace(Labels),
    /// Set or remove single keys
    Keys(Vec<(String, Option<String>)>),
}

impl MapUpdate {
    /// Plan an update where `labels` and `labels.<key>` are the only
    /// accepted field paths; no field paths replaces the labels
    pub fn labels_only(labels: &Labels, fieldpaths: &[&str], object: &str) -> berth_common::Result<Self> {
        if fieldpaths.is_empty() {
            return Ok(Self::Replace(labels.clone()));
        }
        let mut keys = Vec::new();
        let mut replace = false;
        for path in fieldpaths {
            if *path == KEY_LABELS {
                replace = true;
                continue;
            }
            match path.strip_prefix("labels.") {
                Some(key) if !key.is_empty() => keys.push((key.to_string(), labels.get(key).cloned())),
                _ => {
                    return Err(berth_common::Error::invalid_argument(format!(
                        "cannot update {path:?} field on {object}"
                    )));
                }
            }
        }
        if replace {
            return Ok(Self::Replace(labels.clone()));
        }
        Ok(Self::Keys(keys))
    }

    /// Resolve against the current map
    pub fn merge(&self, current: &mut Labels) {
        match self {
            Self::Replace(map) => current.clone_from(map),
            Self::Keys(keys) => {
                for (k, v) in keys {
                    match v {
                        Some(v) if !v.is_empty() => {
                            current.insert(k.clone(), v.clone());
                        }
                        _ => {
                            current.remove(k);
                        }
                    }
                }
            }
        }
    }

    pub fn apply<K: KvWrite + ?Sized>(&self, kv: &mut K, bucket: &Path) -> MetaStoreResult<()> {
        match self {
            Self::Replace(map) => write_map(kv, bucket, map),
            Self::Keys(keys) => keys
                .iter()
                .try_for_each(|(k, v)| write_map_entry(&mut *kv, bucket, k, v.as_deref())),
        }
    }
}

/// Read named `Any` payloads stored one entry per name under `bucket`
pub fn read_extensions<K: KvRead + ?Sized>(kv: &K, bucket: &Path) -> MetaStoreResult<BTreeMap<String, Any>> {
    kv::leaves(kv, bucket)?
        .into_iter()
        .map(|(name, v)| -> MetaStoreResult<(String, Any)> {
            Ok((name, bincode::deserialize(&v)?))
        })
        .collect()
}

pub fn write_extensions<K: KvWrite + ?Sized>(
    kv: &mut K,
    bucket: &Path,
    extensions: &BTreeMap<String, Any>,
) -> MetaStoreResult<()> {
    kv::delete_bucket(kv, bucket)?;
    for (name, any) in extensions {
        write_bincode(kv, &bucket.join(name), any)?;
    }
    Ok(())
}
