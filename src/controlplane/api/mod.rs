//! API Module
//!
//! REST surface for the Identity, Controller and Node services, plus
//! health and metrics endpoints.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
