//! Network edges of the agent: the dataway upload client and leader elector, and push ingestion.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod dataway;
pub mod push;
