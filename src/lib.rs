//! vidrelay - disposable HLS streams from remote video sources
//!
//! This library crate exposes the core functionality for integration testing.

pub mod config;
pub mod server;
pub mod session;
pub mod source;
