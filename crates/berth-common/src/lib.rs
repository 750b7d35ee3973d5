//! Berth Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration, identifiers and
//! helper types used by the metadata store, the garbage collector and the
//! daemon.

pub mod config;
pub mod error;
pub mod filters;
pub mod labels;
pub mod types;
pub mod typeurl;

pub use config::Config;
pub use error::{Error, Result};
pub use filters::{Adaptor, Filter};
pub use labels::Labels;
pub use types::*;
pub use typeurl::{Any, TypeRegistry};
