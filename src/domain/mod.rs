//! Domain layer - Protocol types and port definitions
//!
//! This module defines the protocol data model, the publish-context model
//! shared by the controller and node sides, and the traits (ports) that
//! adapters implement.

pub mod context;
pub mod ports;
pub mod types;

pub use context::*;
pub use ports::*;
pub use types::*;
