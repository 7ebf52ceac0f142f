//! Process bootstrap helpers shared by agent binaries.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;
pub mod tls;
