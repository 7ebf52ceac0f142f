//! Core ingestion pipeline: points, pooling, the feeder facade, per-category compaction, filtering, election gating,
//! and process lifecycle coordination.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod compactor;
pub mod election;
pub mod feeder;
pub mod filter;
pub mod point;
pub mod pooling;
pub mod runtime;
