//! GPU device + surface lifecycle.
//!
//! This module is responsible for:
//! - acquiring the adapter/device/queue and negotiating optional features
//! - creating & configuring presentation surfaces and their depth textures
//! - tracking per-scene resources and pooled readback buffers
//!
//! Everything here is written against the [`Backend`] trait; [`WgpuBackend`]
//! drives real hardware and [`headless::HeadlessBackend`] stands in for it in
//! tests.

mod backend;
mod error;
mod frame;
pub mod headless;
mod host;
mod readback;
mod registry;
mod surface;
mod wgpu_backend;

pub use backend::{Backend, Canvas, DeviceLostSink, DeviceRequest, UncapturedErrorSink};
pub use error::{AcquireError, ErrorHandler, GpuError, SurfaceErrorAction};
pub use frame::FrameContext;
pub use host::{DeviceHost, DeviceHostOptions, GpuContext, LostFlag};
pub use readback::{ReadbackPool, ReadbackSlot};
pub use registry::{DisposeError, Disposer, ResourceRegistry, TrackedEntry, TrackedResource};
pub use surface::{BackingSize, SizeProvider, SurfaceConfig, SurfaceManager};
pub use wgpu_backend::{WgpuBackend, WindowCanvas};
