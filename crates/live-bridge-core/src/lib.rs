//! Core types, config, errors, and wire protocol for Live Bridge.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
