//! Frame timing.
//!
//! One `FrameClock` per render loop; call `tick()` once per display refresh to
//! obtain the `FrameTime` handed to scheduled frame callbacks.

mod frame_clock;

pub use frame_clock::{FrameClock, FrameTime};
