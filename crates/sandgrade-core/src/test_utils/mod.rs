//! In-memory doubles for the container runtime and the broker

pub mod delivery;
pub mod runtime;

pub use delivery::{AckRecord, MemoryDelivery};
pub use runtime::{ScriptedRuntime, WaitBehaviour};
