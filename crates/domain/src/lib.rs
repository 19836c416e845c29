//! The shared `Error` type used across the workspace's crates.

pub mod error;
