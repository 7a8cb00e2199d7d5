//! keel: a single-machine storage planning agent. Probes block devices,
//! keeps an in-memory model of disks, partitions and LVM entities in sync
//! with the live hardware, and turns guided or unattended partitioning
//! intents into a rendered action plan for an external applier.

pub mod cli;
pub mod diagnostics;
pub mod engine;
pub mod model;
pub mod probe;

pub use engine::{EngineConfig, StorageEngine};

pub const KEEL_VERSION: &str = env!("CARGO_PKG_VERSION");
