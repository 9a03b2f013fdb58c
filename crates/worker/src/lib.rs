//! `genqueue-worker` library crate.
//!
//! Configuration and input loading for the batch worker binary, exposed
//! for testing. The entrypoint lives in `main.rs`.

pub mod config;
pub mod inputs;
