//! Talking to the automation service and its local launcher daemon.

pub mod launcher;
pub mod resilient;

pub use launcher::{LaunchError, LaunchedSession, QuickProfileLauncher, SessionLauncher};
pub use resilient::{CallError, CallPolicy, ResilientClient};
