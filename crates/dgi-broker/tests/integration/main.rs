//! Integration test entry point for dgi-broker.
//!
//! Run with: cargo test --test integration

mod harness;
mod delivery;
mod reliability;
mod shutdown;
