//! Command implementations for the CLI

pub mod optimize;
pub mod runs;
