use std::sync::Arc;

use thiserror::Error;

/// Failures and notifications produced by the device layer.
///
/// `AdapterUnavailable`, `DeviceRequestFailed`, `SurfaceNotConfigured`,
/// `MissingCanvasTarget` and `SurfaceAcquire` are returned to the caller.
/// `DeviceLost` and `UncapturedDevice` are never returned; they only reach the
/// `on_error` handler supplied at init time.
#[derive(Debug, Clone, Error)]
pub enum GpuError {
    #[error("no graphics adapter available")]
    AdapterUnavailable,

    #[error("device request failed: {reason}")]
    DeviceRequestFailed { reason: String },

    #[error("surface used before configure()")]
    SurfaceNotConfigured,

    #[error("no canvas was supplied when the device host was initialized")]
    MissingCanvasTarget,

    #[error("failed to create presentation surface: {reason}")]
    SurfaceCreationFailed { reason: String },

    #[error("failed to acquire surface texture: {0:?}")]
    SurfaceAcquire(AcquireError),

    #[error("device lost ({reason}): {message}")]
    DeviceLost { reason: String, message: String },

    #[error("uncaptured device error: {message}")]
    UncapturedDevice { message: String },
}

/// Callback receiving every error the device layer reports.
pub type ErrorHandler = Arc<dyn Fn(&GpuError) + Send + Sync>;

/// Driver-level reason a surface texture could not be acquired.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AcquireError {
    Lost,
    Outdated,
    Timeout,
    OutOfMemory,
    Other,
}

/// High-level response after a surface error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SurfaceErrorAction {
    /// Surface was reconfigured; rendering may resume next frame.
    Reconfigured,
    /// Transient error; skip the current frame.
    SkipFrame,
    /// Fatal error (commonly OOM); the mount should be torn down.
    Fatal,
}
