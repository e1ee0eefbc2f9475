//! Testing utilities and mock implementations
//!
//! Lets the dispatcher and consumer run against an in-memory broker with a
//! scripted business handler.

pub mod mocks;

pub use mocks::*;
