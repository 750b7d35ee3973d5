//! Berth GC - garbage collection primitives
//!
//! This crate knows nothing about content, snapshots or leases. It models
//! the reachability graph as typed [`Node`]s, marks the live set from a
//! list of roots, and schedules collections for any [`Collector`].

pub mod graph;
pub mod scheduler;

pub use graph::{Node, ResourceType, mark};
pub use scheduler::{Collector, Scheduler, SchedulerConfig, SchedulerHandle, Stats};
