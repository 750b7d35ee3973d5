//! Store events.
//!
//! Stores queue an [`Event`] on the transaction; the database hands it to
//! the configured [`Publisher`] after commit. Publishing never fails the
//! mutation that produced it.

use berth_common::{Labels, Result};
use serde::Serialize;
use tracing::warn;

/// Something that happened to a stored object
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ContentDelete { digest: String },
    ImageCreate { name: String, labels: Labels },
    ImageUpdate { name: String, labels: Labels },
    ImageDelete { name: String },
    ContainerCreate { id: String, image: String, runtime: String },
    ContainerUpdate { id: String, image: String, snapshot_key: String },
    ContainerDelete { id: String },
    SandboxCreate { id: String },
    SandboxUpdate { id: String },
    SandboxDelete { id: String },
    SnapshotPrepare { snapshotter: String, key: String, parent: String },
    SnapshotCommit { snapshotter: String, key: String, name: String },
    SnapshotRemove { snapshotter: String, key: String },
    LeaseCreate { id: String },
    LeaseDelete { id: String },
}

impl Event {
    /// Topic the event is published under
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::ContentDelete { .. } => "/content/delete",
            Self::ImageCreate { .. } => "/images/create",
            Self::ImageUpdate { .. } => "/images/update",
            Self::ImageDelete { .. } => "/images/delete",
            Self::ContainerCreate { .. } => "/containers/create",
            Self::ContainerUpdate { .. } => "/containers/update",
            Self::ContainerDelete { .. } => "/containers/delete",
            Self::SandboxCreate { .. } => "/sandboxes/create",
            Self::SandboxUpdate { .. } => "/sandboxes/update",
            Self::SandboxDelete { .. } => "/sandboxes/delete",
            Self::SnapshotPrepare { .. } => "/snapshot/prepare",
            Self::SnapshotCommit { .. } => "/snapshot/commit",
            Self::SnapshotRemove { .. } => "/snapshot/remove",
            Self::LeaseCreate { .. } => "/leases/create",
            Self::LeaseDelete { .. } => "/leases/delete",
        }
    }
}

/// Event sink
pub trait Publisher: Send + Sync {
    fn publish(&self, namespace: &str, topic: &str, event: &Event) -> Result<()>;
}

/// Publish queued events, logging failures
pub(crate) fn publish_all(publisher: Option<&dyn Publisher>, events: Vec<(String, Event)>) {
    let Some(publisher) = publisher else {
        return;
    };
    for (namespace, event) in events {
        if let Err(e) = publisher.publish(&namespace, event.topic(), &event) {
            warn!(
                "Failed to publish {} event in namespace '{}': {}",
                event.topic(),
                namespace,
                e
            );
        }
    }
}
