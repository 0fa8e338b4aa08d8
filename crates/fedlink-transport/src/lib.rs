//! RPC capability surface for fedlink.
//!
//! The channels only depend on the narrow call traits defined here; any
//! generated stub or adapter that implements them can be plugged in.

pub mod api;
pub mod memory;
pub mod messages;
pub mod status;

pub use api::{AppIoApi, FleetApi, LinkApi};
pub use status::{RpcError, StatusCode};
