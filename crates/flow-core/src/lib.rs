// Flow Core - data model, error kinds and the Store abstraction for the
// conversational flow automation engine.

pub mod error;
pub mod model;
pub mod store;

pub use error::{FlowError, FlowResult};
pub use model::*;
pub use store::{FlowPatch, MemoryStore, Store};

/// Crate version, surfaced on `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
