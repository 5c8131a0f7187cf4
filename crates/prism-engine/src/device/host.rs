use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::backend::{Backend, DeviceRequest};
use super::registry::ResourceRegistry;
use super::surface::{SurfaceConfig, SurfaceManager};
use super::{ErrorHandler, GpuError};

/// Initialization parameters for a [`DeviceHost`].
///
/// Keep this structure minimal. Optional capabilities are expressed as
/// `optional_features` tiers rather than by retrying at the call site.
pub struct DeviceHostOptions<B: Backend> {
    /// Canvas later bound by [`DeviceHost::configure_surface`]. Also used to
    /// pick an adapter able to present to it.
    pub canvas: Option<B::Canvas>,

    pub power_preference: wgpu::PowerPreference,

    /// Features the device must have; init fails without them.
    pub required_features: wgpu::Features,

    /// Optional feature tiers, most preferred first.
    ///
    /// The host first asks for every tier, then drops tiers from the end until
    /// a request succeeds. The final attempt asks for `required_features` only.
    pub optional_features: Vec<wgpu::Features>,

    /// Limits requested from the adapter/device.
    pub required_limits: wgpu::Limits,

    pub label: String,

    /// Receives init failures as well as device-lost and uncaptured-error
    /// notifications for the lifetime of the device.
    pub on_error: Option<ErrorHandler>,
}

impl<B: Backend> Default for DeviceHostOptions<B> {
    fn default() -> Self {
        Self {
            canvas: None,
            power_preference: wgpu::PowerPreference::HighPerformance,
            required_features: wgpu::Features::empty(),
            optional_features: Vec::new(),
            required_limits: wgpu::Limits::default(),
            label: "prism device".to_string(),
            on_error: None,
        }
    }
}

/// Shared view of an acquired device.
///
/// Cloned into components that need the device after init (surface managers,
/// readback pools). Cloning does not extend the device's life past
/// [`DeviceHost::dispose`].
pub struct GpuContext<B: Backend> {
    pub backend: B,
    pub adapter: B::Adapter,
    pub device: B::Device,
    pub queue: B::Queue,
    pub limits: wgpu::Limits,
    pub features: wgpu::Features,
}

impl<B: Backend> Clone for GpuContext<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            adapter: self.adapter.clone(),
            device: self.device.clone(),
            queue: self.queue.clone(),
            limits: self.limits.clone(),
            features: self.features,
        }
    }
}

/// Set once the device behind a [`DeviceHost`] is lost. Loss is terminal;
/// the flag never clears.
#[derive(Debug, Clone, Default)]
pub struct LostFlag(Arc<AtomicBool>);

impl LostFlag {
    pub fn is_lost(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Marks the device lost. Returns true only for the first call.
    fn mark(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// Owns adapter/device/queue acquisition and the device's notification
/// subscriptions.
pub struct DeviceHost<B: Backend> {
    gpu: GpuContext<B>,
    canvas: Option<B::Canvas>,
    label: String,
    lost: LostFlag,
    teardown: Vec<Box<dyn FnOnce()>>,
    disposed: bool,
}

impl<B: Backend> DeviceHost<B> {
    /// Acquires an adapter and a device.
    ///
    /// Failures are returned and, when `on_error` is set, reported to it first.
    pub async fn init(backend: B, options: DeviceHostOptions<B>) -> Result<Self, GpuError> {
        let DeviceHostOptions {
            canvas,
            power_preference,
            required_features,
            optional_features,
            required_limits,
            label,
            on_error,
        } = options;

        let report = |err: GpuError| {
            if let Some(handler) = &on_error {
                handler(&err);
            }
            err
        };

        let Some(adapter) = backend
            .request_adapter(power_preference, canvas.as_ref())
            .await
        else {
            log::error!("{label}: no graphics adapter available");
            return Err(report(GpuError::AdapterUnavailable));
        };

        let supported = backend.adapter_features(&adapter);
        let mut last_reason = String::from("no device request attempted");
        let mut acquired = None;
        for features in feature_candidates(required_features, &optional_features) {
            // The required-only set always goes to the driver so its refusal is reported.
            if features != required_features && !supported.contains(features) {
                log::debug!("{label}: adapter lacks {:?}; skipping", features.difference(supported));
                continue;
            }
            let request = DeviceRequest {
                label: &label,
                features,
                limits: &required_limits,
            };
            match backend.request_device(&adapter, &request).await {
                Ok((device, queue)) => {
                    acquired = Some((device, queue, features));
                    break;
                }
                Err(reason) => {
                    log::warn!("{label}: device request with {features:?} failed: {reason}");
                    last_reason = reason;
                }
            }
        }

        let Some((device, queue, granted)) = acquired else {
            log::error!("{label}: device request failed: {last_reason}");
            return Err(report(GpuError::DeviceRequestFailed {
                reason: last_reason,
            }));
        };

        let wanted = optional_features
            .iter()
            .fold(required_features, |acc, tier| acc | *tier);
        if granted != wanted {
            log::info!(
                "{label}: running without optional features {:?}",
                wanted.difference(granted)
            );
        }

        let lost = LostFlag::default();
        let mut teardown: Vec<Box<dyn FnOnce()>> = Vec::new();
        if let Some(handler) = on_error.clone() {
            teardown.push(subscribe_uncaptured(&backend, &device, handler));
        }
        teardown.push(subscribe_device_lost(
            &backend,
            &device,
            &label,
            lost.clone(),
            on_error,
        ));

        let limits = backend.adapter_limits(&adapter);
        log::debug!("{label}: device acquired with {granted:?}");

        Ok(Self {
            gpu: GpuContext {
                backend,
                adapter,
                device,
                queue,
                limits,
                features: granted,
            },
            canvas,
            label,
            lost,
            teardown,
            disposed: false,
        })
    }

    pub fn adapter(&self) -> &B::Adapter {
        &self.gpu.adapter
    }

    pub fn device(&self) -> &B::Device {
        &self.gpu.device
    }

    pub fn queue(&self) -> &B::Queue {
        &self.gpu.queue
    }

    /// Limits supported by the selected adapter.
    pub fn limits(&self) -> &wgpu::Limits {
        &self.gpu.limits
    }

    /// Features actually enabled on the device.
    pub fn granted_features(&self) -> wgpu::Features {
        self.gpu.features
    }

    pub fn has_feature(&self, feature: wgpu::Features) -> bool {
        self.gpu.features.contains(feature)
    }

    pub fn context(&self) -> &GpuContext<B> {
        &self.gpu
    }

    pub fn canvas(&self) -> Option<&B::Canvas> {
        self.canvas.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_lost()
    }

    /// Shared flag for code that outlives borrows of the host, such as frame
    /// loops.
    pub fn lost_flag(&self) -> LostFlag {
        self.lost.clone()
    }

    /// Binds the canvas supplied at init time to `surface`.
    pub fn configure_surface(
        &self,
        surface: &mut SurfaceManager<B>,
        config: SurfaceConfig,
    ) -> Result<(), GpuError> {
        let Some(canvas) = self.canvas.clone() else {
            return Err(GpuError::MissingCanvasTarget);
        };
        surface.configure(&self.gpu, canvas, config)
    }

    /// Returns a fresh registry; registries are never shared between hosts.
    pub fn create_resource_registry(&self) -> ResourceRegistry {
        ResourceRegistry::new()
    }

    /// Runs teardown hooks in registration order, then destroys the device.
    ///
    /// Subsequent calls are no-ops.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        for hook in self.teardown.drain(..) {
            hook();
        }
        self.gpu.backend.destroy_device(&self.gpu.device);
        log::debug!("{}: device disposed", self.label);
    }
}

impl<B: Backend> Drop for DeviceHost<B> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Feature sets to request, from most to least capable.
fn feature_candidates(required: wgpu::Features, optional: &[wgpu::Features]) -> Vec<wgpu::Features> {
    let mut out = Vec::with_capacity(optional.len() + 1);
    for keep in (0..=optional.len()).rev() {
        let set = optional[..keep]
            .iter()
            .fold(required, |acc, tier| acc | *tier);
        if !out.contains(&set) {
            out.push(set);
        }
    }
    out
}

fn subscribe_uncaptured<B: Backend>(
    backend: &B,
    device: &B::Device,
    handler: ErrorHandler,
) -> Box<dyn FnOnce()> {
    let attached = Arc::new(AtomicBool::new(true));
    let flag = attached.clone();
    backend.set_uncaptured_error_sink(
        device,
        Arc::new(move |message| {
            if flag.load(Ordering::Acquire) {
                log::warn!("uncaptured device error: {message}");
                handler(&GpuError::UncapturedDevice { message });
            }
        }),
    );
    Box::new(move || attached.store(false, Ordering::Release))
}

fn subscribe_device_lost<B: Backend>(
    backend: &B,
    device: &B::Device,
    label: &str,
    lost: LostFlag,
    handler: Option<ErrorHandler>,
) -> Box<dyn FnOnce()> {
    let attached = Arc::new(AtomicBool::new(true));
    let flag = attached.clone();
    let label = label.to_string();
    backend.set_device_lost_sink(
        device,
        Arc::new(move |reason, message| {
            if !flag.load(Ordering::Acquire) || !lost.mark() {
                return;
            }
            log::error!("{label}: device lost ({reason}): {message}");
            if let Some(handler) = &handler {
                handler(&GpuError::DeviceLost { reason, message });
            }
        }),
    );
    Box::new(move || attached.store(false, Ordering::Release))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::device::headless::{HeadlessBackend, HeadlessCanvas};

    fn collecting_handler() -> (ErrorHandler, Arc<Mutex<Vec<GpuError>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: ErrorHandler = Arc::new(move |err: &GpuError| {
            sink.lock().unwrap().push(err.clone());
        });
        (handler, seen)
    }

    #[test]
    fn candidates_drop_tiers_from_the_end() {
        let a = wgpu::Features::TIMESTAMP_QUERY;
        let b = wgpu::Features::SHADER_F16;
        let c = feature_candidates(wgpu::Features::empty(), &[a, b]);
        assert_eq!(c, vec![a | b, a, wgpu::Features::empty()]);
    }

    #[test]
    fn candidates_without_optional_tiers_request_required_only() {
        let req = wgpu::Features::DEPTH_CLIP_CONTROL;
        assert_eq!(feature_candidates(req, &[]), vec![req]);
    }

    #[test]
    fn candidates_skip_duplicate_sets() {
        let req = wgpu::Features::TIMESTAMP_QUERY;
        let c = feature_candidates(req, &[req]);
        assert_eq!(c, vec![req]);
    }

    #[test]
    fn missing_adapter_is_thrown_and_reported_once() {
        let backend = HeadlessBackend::new();
        backend.set_adapter_available(false);
        let (handler, seen) = collecting_handler();

        let result = pollster::block_on(DeviceHost::init(
            backend,
            DeviceHostOptions {
                on_error: Some(handler),
                ..DeviceHostOptions::default()
            },
        ));

        assert!(matches!(result, Err(GpuError::AdapterUnavailable)));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], GpuError::AdapterUnavailable));
    }

    #[test]
    fn device_failure_reports_before_returning() {
        let backend = HeadlessBackend::new();
        backend.set_fail_device_requests(true);
        let (handler, seen) = collecting_handler();

        let result = pollster::block_on(DeviceHost::init(
            backend,
            DeviceHostOptions {
                on_error: Some(handler),
                ..DeviceHostOptions::default()
            },
        ));

        assert!(matches!(result, Err(GpuError::DeviceRequestFailed { .. })));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsupported_optional_feature_falls_back() {
        let backend = HeadlessBackend::new();
        let host = pollster::block_on(DeviceHost::init(
            backend.clone(),
            DeviceHostOptions {
                optional_features: vec![wgpu::Features::TIMESTAMP_QUERY],
                ..DeviceHostOptions::default()
            },
        ))
        .unwrap();

        assert!(!host.has_feature(wgpu::Features::TIMESTAMP_QUERY));
        assert_eq!(backend.device_requests(), vec![wgpu::Features::empty()]);
    }

    #[test]
    fn unsupported_required_feature_still_reaches_the_driver() {
        let backend = HeadlessBackend::new();
        let result = pollster::block_on(DeviceHost::init(
            backend.clone(),
            DeviceHostOptions {
                required_features: wgpu::Features::SHADER_F16,
                optional_features: vec![wgpu::Features::TIMESTAMP_QUERY],
                ..DeviceHostOptions::default()
            },
        ));

        assert!(matches!(result, Err(GpuError::DeviceRequestFailed { .. })));
        assert_eq!(backend.device_requests(), vec![wgpu::Features::SHADER_F16]);
    }

    #[test]
    fn device_loss_sets_the_lost_flag_without_a_handler() {
        let backend = HeadlessBackend::new();
        let host =
            pollster::block_on(DeviceHost::init(backend.clone(), DeviceHostOptions::default()))
                .unwrap();
        let flag = host.lost_flag();
        assert!(!flag.is_lost());

        backend.emit_device_lost("Unknown", "gone");
        assert!(flag.is_lost());
        assert!(host.is_lost());
    }

    #[test]
    fn supported_optional_feature_is_granted() {
        let backend = HeadlessBackend::new();
        backend.set_supported_features(wgpu::Features::TIMESTAMP_QUERY);
        let host = pollster::block_on(DeviceHost::init(
            backend.clone(),
            DeviceHostOptions {
                optional_features: vec![wgpu::Features::TIMESTAMP_QUERY],
                ..DeviceHostOptions::default()
            },
        ))
        .unwrap();

        assert!(host.has_feature(wgpu::Features::TIMESTAMP_QUERY));
        assert_eq!(backend.device_requests().len(), 1);
    }

    #[test]
    fn configure_without_canvas_is_rejected() {
        let backend = HeadlessBackend::new();
        let host =
            pollster::block_on(DeviceHost::init(backend, DeviceHostOptions::default())).unwrap();
        let mut surface = SurfaceManager::new();
        let err = host
            .configure_surface(&mut surface, SurfaceConfig::default())
            .unwrap_err();
        assert!(matches!(err, GpuError::MissingCanvasTarget));
    }

    #[test]
    fn notifications_are_routed_until_dispose() {
        let backend = HeadlessBackend::new();
        let (handler, seen) = collecting_handler();
        let mut host = pollster::block_on(DeviceHost::init(
            backend.clone(),
            DeviceHostOptions {
                canvas: Some(HeadlessCanvas::new(1, 10.0, 10.0, 1.0)),
                on_error: Some(handler),
                ..DeviceHostOptions::default()
            },
        ))
        .unwrap();

        backend.emit_uncaptured_error("validation");
        backend.emit_uncaptured_error("validation again");
        backend.emit_device_lost("Unknown", "gone");
        backend.emit_device_lost("Unknown", "gone twice");
        assert_eq!(seen.lock().unwrap().len(), 3);

        host.dispose();
        backend.emit_device_lost("Destroyed", "after dispose");
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(backend.live_devices(), 0);
    }

    #[test]
    fn dispose_twice_is_a_no_op() {
        let backend = HeadlessBackend::new();
        let mut host =
            pollster::block_on(DeviceHost::init(backend.clone(), DeviceHostOptions::default()))
                .unwrap();
        host.dispose();
        host.dispose();
        assert!(host.is_disposed());
        assert_eq!(backend.live_devices(), 0);
    }
}
