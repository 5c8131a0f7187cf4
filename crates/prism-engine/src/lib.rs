//! Prism engine crate.
//!
//! Device/surface lifecycle and per-scene resource management for the prism
//! rendering sandbox, plus the winit runtime that hosts scenes.

pub mod device;
pub mod scene;
pub mod time;
pub mod window;

pub mod logging;
