//! Shared type definitions
//!
//! This module contains the data types shared between storage, system and server code.

pub mod config;
pub mod model;
