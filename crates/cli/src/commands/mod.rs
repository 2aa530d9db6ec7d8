//! CLI command implementations

pub mod threshold;
