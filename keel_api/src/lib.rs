//! Serializable surface of the keel storage-planning engine: error taxonomy,
//! guided-target and unattended-intent documents, rendered action streams,
//! and status types.

pub mod config;
pub mod constants;
pub mod error;
pub mod primitives;
pub mod status;
