//! Wire-level types for the order channels
//!
//! This module defines the records exchanged with the broker and the
//! naming rules for channels and consumer groups.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
