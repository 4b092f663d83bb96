//! Shared elflow model types: bookmark state, protocol messages, and job runs.
//!
//! This crate carries no I/O so both the state stores and the engine can
//! depend on it.

#![warn(clippy::pedantic)]

pub mod job;
pub mod message;
pub mod state;
