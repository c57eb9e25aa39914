//! Yield agent: autonomous two-pool rebalancing for a delegated agent wallet.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod chain;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod status;
pub mod types;
