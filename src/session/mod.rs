//! Session state machine and the process-wide registry.

pub mod registry;
pub mod state;

pub use registry::SessionRegistry;
pub use state::Session;
