//! Process lifecycle: the exit broadcast, the shutdown drain barrier, and the collector registry.

mod collector;
pub use self::collector::{Collector, CollectorRegistry, RegistryError};

mod exit;
pub use self::exit::{DrainError, DrainGuard, ExitCoordinator, ExitSignal};
