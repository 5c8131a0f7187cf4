//! Window + runtime loop.
//!
//! Owns the `winit` event loop and the primary window, and drives the scene
//! host, frame callbacks and the local executor from it.

mod runtime;

pub use runtime::{Runtime, RuntimeConfig};
