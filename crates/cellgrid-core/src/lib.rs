//! cellgrid Core
//!
//! Shared plumbing for the cellgrid renderer crates: logging setup, puffin
//! profiling hooks, hash collections and small pixel-space geometry types.

pub mod alloc;
pub mod geometry;
pub mod logging;
pub mod profiling;
