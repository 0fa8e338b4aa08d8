//! Core fedlink primitives shared across crates.
//!
//! Includes identity newtypes, run descriptors, content hashing, protocol
//! constants, and base errors.

pub mod constants;
pub mod error;
pub mod hash;
pub mod types;

pub use types::{Fab, NodeId, ObjectId, Run, RunId, RunStatus};
