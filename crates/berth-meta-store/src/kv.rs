//! Nested buckets over a single ordered key space.
//!
//! A bucket is addressed by a [`Path`], its components joined by `0x00`.
//! Buckets that must exist while empty carry a marker entry (the path
//! itself with an empty value); fields are plain entries below it. Child
//! enumeration is a prefix scan that skips over each child's subtree.

use crate::error::{MetaStoreResult, corrupt};
use berth_common::{Error, Result};
use redb::{ReadableTable, Table};
use std::fmt;

/// Component separator
pub const SEPARATOR: u8 = 0x00;

/// Encoded bucket or field path
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Path(Vec<u8>);

impl Path {
    pub fn new(component: impl AsRef<[u8]>) -> Self {
        Self(component.as_ref().to_vec())
    }

    /// Append one component
    #[must_use]
    pub fn join(&self, component: impl AsRef<[u8]>) -> Self {
        let component = component.as_ref();
        let mut out = Vec::with_capacity(self.0.len() + 1 + component.len());
        out.extend_from_slice(&self.0);
        out.push(SEPARATOR);
        out.extend_from_slice(component);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Prefix shared by every entry below this path
    pub fn child_prefix(&self) -> Vec<u8> {
        let mut p = self.0.clone();
        p.push(SEPARATOR);
        p
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.split(|b| *b == SEPARATOR).enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(&String::from_utf8_lossy(part))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

/// Check a caller-supplied name used as a path component
pub fn check_component(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument(format!("{what} must not be empty")));
    }
    if name.as_bytes().contains(&SEPARATOR) {
        return Err(Error::invalid_argument(format!(
            "{what} {name:?} must not contain NUL"
        )));
    }
    Ok(())
}

/// Read access to the key space
pub trait KvRead {
    fn get(&self, key: &[u8]) -> MetaStoreResult<Option<Vec<u8>>>;

    /// First entry whose key is `>= from`
    fn seek(&self, from: &[u8]) -> MetaStoreResult<Option<(Vec<u8>, Vec<u8>)>>;

    /// All entries whose key starts with `prefix`, in key order
    fn entries(&self, prefix: &[u8]) -> MetaStoreResult<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Write access to the key space
pub trait KvWrite: KvRead {
    fn put(&mut self, key: &[u8], value: &[u8]) -> MetaStoreResult<()>;

    fn delete(&mut self, key: &[u8]) -> MetaStoreResult<bool>;
}

impl<T> KvRead for T
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    fn get(&self, key: &[u8]) -> MetaStoreResult<Option<Vec<u8>>> {
        Ok(ReadableTable::get(self, key)?.map(|v| v.value().to_vec()))
    }

    fn seek(&self, from: &[u8]) -> MetaStoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        match self.range::<&[u8]>(from..)?.next() {
            Some(entry) => {
                let (k, v) = entry?;
                Ok(Some((k.value().to_vec(), v.value().to_vec())))
            }
            None => Ok(None),
        }
    }

    fn entries(&self, prefix: &[u8]) -> MetaStoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.range::<&[u8]>(prefix..)? {
            let (k, v) = entry?;
            let k = k.value();
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.value().to_vec()));
        }
        Ok(out)
    }
}

impl KvWrite for Table<'_, &'static [u8], &'static [u8]> {
    fn put(&mut self, key: &[u8], value: &[u8]) -> MetaStoreResult<()> {
        self.insert(key, value)?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> MetaStoreResult<bool> {
        Ok(self.remove(key)?.is_some())
    }
}

/// Whether the bucket marker (or a field) exists at `path`
pub fn exists<K: KvRead + ?Sized>(kv: &K, path: &Path) -> MetaStoreResult<bool> {
    Ok(kv.get(path.as_bytes())?.is_some())
}

/// Create a bucket marker; returns false if it already existed
pub fn create_bucket<K: KvWrite + ?Sized>(kv: &mut K, path: &Path) -> MetaStoreResult<bool> {
    if exists(kv, path)? {
        return Ok(false);
    }
    kv.put(path.as_bytes(), &[])?;
    Ok(true)
}

/// Delete a bucket and everything below it; returns false if nothing existed
pub fn delete_bucket<K: KvWrite + ?Sized>(kv: &mut K, path: &Path) -> MetaStoreResult<bool> {
    let mut found = kv.delete(path.as_bytes())?;
    found |= delete_children(kv, path)? > 0;
    Ok(found)
}

/// Delete everything below `path`, keeping the entry at `path` itself
pub fn delete_children<K: KvWrite + ?Sized>(kv: &mut K, path: &Path) -> MetaStoreResult<usize> {
    let keys = kv.entries(&path.child_prefix())?;
    for (k, _) in &keys {
        kv.delete(k)?;
    }
    Ok(keys.len())
}

/// Names of the direct children of `path`, in key order
pub fn children<K: KvRead + ?Sized>(kv: &K, path: &Path) -> MetaStoreResult<Vec<String>> {
    let prefix = path.child_prefix();
    let mut names = Vec::new();
    let mut from = prefix.clone();
    while let Some((key, _)) = kv.seek(&from)? {
        if !key.starts_with(&prefix) {
            break;
        }
        let rest = &key[prefix.len()..];
        let end = rest.iter().position(|b| *b == SEPARATOR).unwrap_or(rest.len());
        let name = &rest[..end];
        names.push(
            String::from_utf8(name.to_vec()).map_err(|e| corrupt(Path(key.clone()), e))?,
        );

        // Keys under `name` continue with 0x00; 0x01 is the first byte past them.
        from.truncate(prefix.len());
        from.extend_from_slice(name);
        from.push(SEPARATOR + 1);
    }
    Ok(names)
}

/// Leaf entries directly below `path` as `(name, value)` pairs
pub fn leaves<K: KvRead + ?Sized>(kv: &K, path: &Path) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
    let prefix = path.child_prefix();
    let mut out = Vec::new();
    for (key, value) in kv.entries(&prefix)? {
        let rest = &key[prefix.len()..];
        if rest.contains(&SEPARATOR) {
            continue;
        }
        let name = String::from_utf8(rest.to_vec()).map_err(|e| corrupt(Path(key.clone()), e))?;
        out.push((name, value));
    }
    Ok(out)
}

/// Append the unsigned varint encoding of `v`
pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decode an unsigned varint, returning the value and bytes consumed
pub fn uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut shift = 0u32;
    for (i, b) in buf.iter().enumerate() {
        if i == 10 {
            return None;
        }
        if *b < 0x80 {
            if i == 9 && *b > 1 {
                return None;
            }
            return Some((x | (u64::from(*b) << shift), i + 1));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    None
}

pub fn encode_uvarint(v: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    put_uvarint(&mut buf, v);
    buf
}

/// Zig-zag signed varint
pub fn encode_varint(v: i64) -> Vec<u8> {
    encode_uvarint(((v << 1) ^ (v >> 63)) as u64)
}

pub fn varint(buf: &[u8]) -> Option<(i64, usize)> {
    let (ux, n) = uvarint(buf)?;
    let mut x = (ux >> 1) as i64;
    if ux & 1 != 0 {
        x = !x;
    }
    Some((x, n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables;
    use redb::Database;
    use tempfile::tempdir;

    fn with_table(f: impl FnOnce(&mut Table<'_, &'static [u8], &'static [u8]>)) {
        let dir = tempdir().unwrap();
        let db = Database::create(dir.path().join("kv.redb")).unwrap();
        let txn = db.begin_write().unwrap();
        {
            let mut table = txn.open_table(tables::META).unwrap();
            f(&mut table);
        }
        txn.commit().unwrap();
    }

    #[test]
    fn test_children_skips_subtrees() {
        with_table(|t| {
            let root = Path::new("v1");
            create_bucket(t, &root.join("a")).unwrap();
            t.put(root.join("a").join("x").as_bytes(), b"1").unwrap();
            t.put(root.join("a").join("y").join("z").as_bytes(), b"2").unwrap();
            create_bucket(t, &root.join("a\u{1}b")).unwrap();
            t.put(root.join("b").join("x").as_bytes(), b"3").unwrap();
            // a sibling of the root must not leak in
            create_bucket(t, &Path::new("v1a")).unwrap();

            assert_eq!(children(t, &root).unwrap(), vec!["a", "a\u{1}b", "b"]);
            assert_eq!(children(t, &root.join("a")).unwrap(), vec!["x", "y"]);
        });
    }

    #[test]
    fn test_delete_bucket_removes_subtree_only() {
        with_table(|t| {
            let a = Path::new("v1").join("a");
            let ab = Path::new("v1").join("ab");
            create_bucket(t, &a).unwrap();
            t.put(a.join("f").as_bytes(), b"x").unwrap();
            create_bucket(t, &ab).unwrap();

            assert!(delete_bucket(t, &a).unwrap());
            assert!(!exists(t, &a).unwrap());
            assert!(!exists(t, &a.join("f")).unwrap());
            assert!(exists(t, &ab).unwrap());
            assert!(!delete_bucket(t, &a).unwrap());
        });
    }

    #[test]
    fn test_create_bucket_reports_existing() {
        with_table(|t| {
            let p = Path::new("x");
            assert!(create_bucket(t, &p).unwrap());
            assert!(!create_bucket(t, &p).unwrap());
        });
    }

    #[test]
    fn test_leaves() {
        with_table(|t| {
            let labels = Path::new("obj").join("labels");
            t.put(labels.join("k1").as_bytes(), b"v1").unwrap();
            t.put(labels.join("k2").as_bytes(), b"").unwrap();
            t.put(labels.join("k2").join("deep").as_bytes(), b"no").unwrap();
            let got = leaves(t, &labels).unwrap();
            assert_eq!(
                got,
                vec![("k1".to_string(), b"v1".to_vec()), ("k2".to_string(), Vec::new())]
            );
        });
    }

    #[test]
    fn test_varints() {
        for v in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let enc = encode_uvarint(v);
            assert_eq!(uvarint(&enc), Some((v, enc.len())));
        }
        for v in [0i64, -1, 1, -64, 64, i64::MIN, i64::MAX] {
            let enc = encode_varint(v);
            assert_eq!(varint(&enc), Some((v, enc.len())));
        }
        assert_eq!(encode_uvarint(300), vec![0xac, 0x02]);
        assert_eq!(uvarint(&[0x80]), None);
    }

    #[test]
    fn test_check_component() {
        assert!(check_component("key", "ok/with/slashes").is_ok());
        assert!(check_component("key", "").unwrap_err().is_invalid_argument());
        assert!(check_component("key", "a\0b").unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_path_display() {
        let p = Path::new("v1").join("default").join("images");
        assert_eq!(p.to_string(), "v1/default/images");
    }
}
