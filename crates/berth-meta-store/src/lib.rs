//! Berth Metadata Store - namespaced metadata and garbage collection
//!
//! This crate keeps the records of content blobs, snapshots, images,
//! containers, sandboxes and leases in a single redb database, and removes
//! whatever no root can reach.

pub mod collector;
pub mod containers;
pub mod content;
pub mod db;
pub mod error;
pub mod events;
pub mod fields;
pub mod gc;
pub mod images;
pub mod kv;
pub mod leases;
pub mod migrations;
pub mod sandboxes;
pub mod schema;
pub mod snapshot;
pub mod tables;
pub mod tx;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use collector::{CollectionContext, CollectorRegistry, ResourceCollector};
pub use containers::{Container, ContainerStore, RuntimeInfo};
pub use content::{ContentBackend, ContentInfo, ContentStore};
pub use db::{Db, DbOptions};
pub use error::{MetaStoreError, MetaStoreResult};
pub use events::{Event, Publisher};
pub use gc::GcStats;
pub use images::{Image, ImageStore};
pub use leases::{DeleteOpts, Lease, LeaseManager, Resource};
pub use sandboxes::{Sandbox, SandboxStore};
pub use snapshot::{Info, Kind, MetaSnapshotter, Mount, SnapshotOpts, Snapshotter, Usage};
pub use tx::{CancelToken, Context, Tx};
