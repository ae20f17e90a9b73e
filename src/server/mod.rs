//! Server launching
//!
//! Validation, command-line construction, process supervision and the launch
//! flow that ties them together.

pub mod command;
pub mod launcher;
pub mod prompt;
pub mod supervisor;
pub mod validation;
