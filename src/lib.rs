//! Boxcar - a serverless-style CI runner driven by GitHub events.
//!
//! This library provides event intake and parsing, layered build
//! configuration, the clone-and-run pipeline, and multi-channel status
//! reporting.

pub mod actions;
pub mod broadcast;
pub mod config;
pub mod events;
pub mod executor;
pub mod git;
pub mod notify;
pub mod runner;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
pub mod test_utils;
