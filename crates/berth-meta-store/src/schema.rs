//! On-disk bucket layout.
//!
//! ```text
//! dbversion                                   -> uvarint schema version
//! v1/<ns>                                     namespace marker
//! v1/<ns>/content/blob/<digest>               size, createdat, updatedat, labels/<k>
//! v1/<ns>/snapshots/<sn>/<key>                id, kind, parent, createdat, updatedat,
//!                                             inodes, size, labels/<k>
//! v1/<ns>/images/<name>                       createdat, updatedat, target/..., labels/<k>
//! v1/<ns>/containers/<id>                     image, runtime/..., spec, snapshotter,
//!                                             snapshotkey, sandboxid, labels, extensions
//! v1/<ns>/sandboxes/<id>                      runtime/..., spec, sandboxer, labels, extensions
//! v1/<ns>/leases/<id>                         createdat, labels/<k>, content/<digest>,
//!                                             snapshots/<sn>/<key>, resources/<type>/<id>
//! v1/<ns>/indexes/seq/<sn>                    -> uvarint last snapshot id
//! v1/<ns>/indexes/parents/<sn>/<pid>\0<cid>   -> child key
//! ```

use crate::kv::{self, KvWrite, Path, put_uvarint};
use berth_common::Result;
use berth_common::types::validate_identifier;

/// Version bucket holding every namespace
pub const VERSION_BUCKET: &str = "v1";
/// Top-level key holding the schema version
pub const KEY_SCHEMA_VERSION: &[u8] = b"dbversion";

pub const BUCKET_CONTENT: &str = "content";
pub const BUCKET_BLOB: &str = "blob";
pub const BUCKET_SNAPSHOTS: &str = "snapshots";
pub const BUCKET_IMAGES: &str = "images";
pub const BUCKET_CONTAINERS: &str = "containers";
pub const BUCKET_SANDBOXES: &str = "sandboxes";
pub const BUCKET_LEASES: &str = "leases";
pub const BUCKET_INDEXES: &str = "indexes";
pub const BUCKET_SEQUENCE: &str = "seq";
pub const BUCKET_PARENTS: &str = "parents";
pub const BUCKET_RESOURCES: &str = "resources";

pub const KEY_LABELS: &str = "labels";
pub const KEY_ANNOTATIONS: &str = "annotations";
pub const KEY_EXTENSIONS: &str = "extensions";
pub const KEY_CREATED_AT: &str = "createdat";
pub const KEY_UPDATED_AT: &str = "updatedat";
pub const KEY_SIZE: &str = "size";
pub const KEY_INODES: &str = "inodes";
pub const KEY_ID: &str = "id";
pub const KEY_KIND: &str = "kind";
pub const KEY_PARENT: &str = "parent";
pub const KEY_TARGET: &str = "target";
pub const KEY_MEDIA_TYPE: &str = "mediatype";
pub const KEY_DIGEST: &str = "digest";
pub const KEY_PLATFORM: &str = "platform";
pub const KEY_IMAGE: &str = "image";
pub const KEY_RUNTIME: &str = "runtime";
pub const KEY_NAME: &str = "name";
pub const KEY_OPTIONS: &str = "options";
pub const KEY_SPEC: &str = "spec";
pub const KEY_SNAPSHOTTER: &str = "snapshotter";
pub const KEY_SNAPSHOT_KEY: &str = "snapshotkey";
pub const KEY_SANDBOX_ID: &str = "sandboxid";
pub const KEY_SANDBOXER: &str = "sandboxer";

pub fn version_root() -> Path {
    Path::new(VERSION_BUCKET)
}

pub fn namespace(ns: &str) -> Path {
    version_root().join(ns)
}

pub fn blobs(ns: &str) -> Path {
    namespace(ns).join(BUCKET_CONTENT).join(BUCKET_BLOB)
}

pub fn blob(ns: &str, digest: &str) -> Path {
    blobs(ns).join(digest)
}

pub fn snapshotters(ns: &str) -> Path {
    namespace(ns).join(BUCKET_SNAPSHOTS)
}

pub fn snapshotter(ns: &str, sn: &str) -> Path {
    snapshotters(ns).join(sn)
}

pub fn snapshot(ns: &str, sn: &str, key: &str) -> Path {
    snapshotter(ns, sn).join(key)
}

pub fn images(ns: &str) -> Path {
    namespace(ns).join(BUCKET_IMAGES)
}

pub fn image(ns: &str, name: &str) -> Path {
    images(ns).join(name)
}

pub fn containers(ns: &str) -> Path {
    namespace(ns).join(BUCKET_CONTAINERS)
}

pub fn container(ns: &str, id: &str) -> Path {
    containers(ns).join(id)
}

pub fn sandboxes(ns: &str) -> Path {
    namespace(ns).join(BUCKET_SANDBOXES)
}

pub fn sandbox(ns: &str, id: &str) -> Path {
    sandboxes(ns).join(id)
}

pub fn leases(ns: &str) -> Path {
    namespace(ns).join(BUCKET_LEASES)
}

pub fn lease(ns: &str, id: &str) -> Path {
    leases(ns).join(id)
}

pub fn sequence(ns: &str, sn: &str) -> Path {
    namespace(ns).join(BUCKET_INDEXES).join(BUCKET_SEQUENCE).join(sn)
}

pub fn parent_index(ns: &str, sn: &str) -> Path {
    namespace(ns).join(BUCKET_INDEXES).join(BUCKET_PARENTS).join(sn)
}

/// Index bucket holding every child of `parent`
pub fn parent_index_prefix(ns: &str, sn: &str, parent: u64) -> Path {
    let mut id = Vec::with_capacity(10);
    put_uvarint(&mut id, parent);
    parent_index(ns, sn).join(id)
}

/// Index entry for one parent/child edge
pub fn parent_index_entry(ns: &str, sn: &str, parent: u64, child: u64) -> Path {
    let mut id = Vec::with_capacity(10);
    put_uvarint(&mut id, child);
    parent_index_prefix(ns, sn, parent).join(id)
}

/// Validate `ns` and create its bucket if needed
pub fn ensure_namespace<K: KvWrite + ?Sized>(kv: &mut K, ns: &str) -> Result<()> {
    validate_identifier(ns).map_err(|e| e.context("namespace"))?;
    kv::create_bucket(kv, &namespace(ns))?;
    Ok(())
}
