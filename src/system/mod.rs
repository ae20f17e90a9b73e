//! System utilities
//!
//! Host queries and process control.

pub mod processes;
pub mod resources;
pub mod signals;
