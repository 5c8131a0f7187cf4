//! Scene lifecycle properties driven through the headless backend.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::executor::LocalPool;
use futures::future::LocalBoxFuture;

use prism_engine::device::headless::{HeadlessBackend, HeadlessCanvas, HeadlessRoot};
use prism_engine::device::{
    Canvas, DeviceHost, DeviceHostOptions, ReadbackPool, SurfaceConfig, SurfaceManager,
    TrackedResource,
};
use prism_engine::scene::{
    Activation, CanvasDescriptor, CanvasRoot, Cleanup, DisposeStack, EventKind, EventListeners,
    FrameLoop, FrameScheduler, MountContext, Scene, SceneHost, ScenePhase, WindowSignal,
};
use prism_engine::time::FrameTime;

type Ctx = MountContext<HeadlessBackend>;

#[derive(Default)]
struct Counters {
    mounted: Cell<u32>,
    cleaned: Cell<u32>,
}

/// Scene that allocates one of everything the core manages.
struct ProbeScene {
    id: &'static str,
    extra_canvases: usize,
    optional_features: Vec<wgpu::Features>,
    gates: Rc<RefCell<VecDeque<oneshot::Receiver<()>>>>,
    cleanup_gates: Rc<RefCell<VecDeque<oneshot::Receiver<()>>>>,
    counters: Rc<Counters>,
}

impl ProbeScene {
    fn new(id: &'static str) -> Self {
        Self {
            id,
            extra_canvases: 0,
            optional_features: Vec::new(),
            gates: Rc::new(RefCell::new(VecDeque::new())),
            cleanup_gates: Rc::new(RefCell::new(VecDeque::new())),
            counters: Rc::new(Counters::default()),
        }
    }

    fn with_extra_canvases(mut self, n: usize) -> Self {
        self.extra_canvases = n;
        self
    }

    fn with_optional(mut self, features: wgpu::Features) -> Self {
        self.optional_features.push(features);
        self
    }

    /// The next mount waits until the returned sender fires.
    fn gate(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.borrow_mut().push_back(rx);
        tx
    }

    /// The next mounted instance holds its cleanup open until the returned
    /// sender fires.
    fn gate_cleanup(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.cleanup_gates.borrow_mut().push_back(rx);
        tx
    }
}

impl Scene<HeadlessBackend> for ProbeScene {
    fn id(&self) -> &str {
        self.id
    }

    fn title(&self) -> &str {
        self.id
    }

    fn mount(&self, ctx: Ctx) -> LocalBoxFuture<'static, anyhow::Result<Cleanup>> {
        let gate = self.gates.borrow_mut().pop_front();
        let cleanup_gate = self.cleanup_gates.borrow_mut().pop_front();
        let extra = self.extra_canvases;
        let optional = self.optional_features.clone();
        let counters = self.counters.clone();
        let label = self.id;

        Box::pin(async move {
            if let Some(gate) = gate {
                gate.await?;
            }
            let mut stack = DisposeStack::new(label);
            let c = counters.clone();
            stack.defer("counter", move || c.cleaned.set(c.cleaned.get() + 1));
            if let Some(gate) = cleanup_gate {
                stack.push("cleanup gate", move || {
                    Box::pin(async move {
                        gate.await?;
                        Ok(())
                    })
                });
            }
            let result = build(&ctx, extra, optional, &mut stack).await;
            if result.is_ok() {
                counters.mounted.set(counters.mounted.get() + 1);
            }
            stack.finish(result).await
        })
    }
}

async fn build(
    ctx: &Ctx,
    extra: usize,
    optional: Vec<wgpu::Features>,
    stack: &mut DisposeStack,
) -> anyhow::Result<()> {
    let host = DeviceHost::init(
        ctx.backend.clone(),
        DeviceHostOptions {
            canvas: Some(ctx.primary_canvas()),
            optional_features: optional,
            ..DeviceHostOptions::default()
        },
    )
    .await?;
    let host = Rc::new(RefCell::new(host));
    let h = host.clone();
    stack.defer("device", move || h.borrow_mut().dispose());

    let mut surface = SurfaceManager::new();
    host.borrow().configure_surface(
        &mut surface,
        SurfaceConfig::default().with_depth(wgpu::TextureFormat::Depth24Plus),
    )?;
    let surface = Rc::new(RefCell::new(surface));
    let s = surface.clone();
    stack.defer("surface", move || s.borrow_mut().dispose());

    for i in 0..extra {
        let canvas = ctx
            .root
            .create_canvas(CanvasDescriptor {
                title: format!("extra {i}"),
                logical_size: (64.0, 64.0),
            })
            .await?;
        let root = ctx.root.clone();
        let id = canvas.canvas_id();
        stack.defer("canvas", move || root.release(id));
    }

    let s = surface.clone();
    let listener = ctx.listeners.add_listener(EventKind::Resize, move |_| {
        s.borrow_mut().resize();
    });
    let listeners = ctx.listeners.clone();
    stack.defer("resize listener", move || {
        listeners.remove_listener(listener);
    });

    let readback = ReadbackPool::new(host.borrow().context());
    let r = readback.clone();
    stack.defer("readback pool", move || r.dispose());

    let mut registry = host.borrow().create_resource_registry();
    registry.add(TrackedResource::new("uniforms", Rc::new([0f32; 16])));
    stack.push("registry", move || {
        Box::pin(async move { registry.dispose_all().await.map_err(anyhow::Error::from) })
    });

    let s = surface.clone();
    let spawner = ctx.spawner.clone();
    let lost = host.borrow().lost_flag();
    let frame_loop = FrameLoop::start_until_lost(&ctx.frames, lost, move |_| {
        if let Ok(frame) = s.borrow().acquire_frame() {
            frame.present();
        }
        if let Some(slot) = readback.try_begin(16) {
            readback.finish(slot, &spawner, |_| {});
        }
        ControlFlow::Continue(())
    });
    stack.defer("frame loop", move || frame_loop.cancel());

    Ok(())
}

struct Harness {
    pool: LocalPool,
    backend: HeadlessBackend,
    canvas: HeadlessCanvas,
    root: Rc<HeadlessRoot>,
    frames: FrameScheduler,
    listeners: EventListeners,
    host: SceneHost<HeadlessBackend>,
    frame_index: u64,
}

impl Harness {
    fn new(scenes: Vec<Rc<dyn Scene<HeadlessBackend>>>, default_id: &str) -> Self {
        let pool = LocalPool::new();
        let backend = HeadlessBackend::new();
        let canvas = HeadlessCanvas::new(1, 300.0, 150.0, 2.0);
        let root = Rc::new(HeadlessRoot::new(canvas.clone()));
        let frames = FrameScheduler::new();
        let listeners = EventListeners::new();
        let ctx = MountContext {
            backend: backend.clone(),
            root: root.clone(),
            frames: frames.clone(),
            listeners: listeners.clone(),
            spawner: pool.spawner(),
        };
        let host = SceneHost::new(ctx, scenes, default_id);
        Self {
            pool,
            backend,
            canvas,
            root,
            frames,
            listeners,
            host,
            frame_index: 0,
        }
    }

    fn activate(&mut self, id: &str) -> Activation {
        let host = self.host.clone();
        self.pool
            .run_until(async move { host.activate_scene(id).await })
            .expect("activation failed")
    }

    /// One frame; readbacks issued by it stay outstanding.
    fn tick(&mut self) {
        self.frames
            .run_frame(FrameTime::synthetic(self.frame_index, 0.0));
        self.frame_index += 1;
        self.pool.run_until_stalled();
    }

    /// `n` frames, each followed by the driver resolving its readbacks.
    fn run_frames(&mut self, n: u64) {
        for _ in 0..n {
            self.tick();
            self.backend.complete_reads(&[0; 16]);
            self.pool.run_until_stalled();
        }
    }

    fn cleanup(&mut self) {
        let host = self.host.clone();
        self.pool
            .run_until(async move { host.cleanup_active_scene().await });
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            devices: self.backend.live_devices(),
            textures: self.backend.live_textures(),
            buffers: self.backend.live_buffers(),
            listeners: self.listeners.count(),
            pending_frames: self.frames.pending_count(),
            canvases: self.root.canvas_count(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Snapshot {
    devices: usize,
    textures: usize,
    buffers: usize,
    listeners: usize,
    pending_frames: usize,
    canvases: usize,
}

const EMPTY: Snapshot = Snapshot {
    devices: 0,
    textures: 0,
    buffers: 0,
    listeners: 0,
    pending_frames: 0,
    canvases: 0,
};

#[test]
fn cleanup_is_idempotent() {
    let scene = ProbeScene::new("points");
    let counters = scene.counters.clone();
    let mut h = Harness::new(vec![Rc::new(scene)], "points");

    h.activate("points");
    h.run_frames(2);
    h.cleanup();
    h.cleanup();

    assert_eq!(counters.mounted.get(), 1);
    assert_eq!(counters.cleaned.get(), 1);
    assert_eq!(h.snapshot(), EMPTY);
}

#[test]
fn overlapping_activations_leave_only_the_latest_mounted() {
    let a = ProbeScene::new("a");
    let b = ProbeScene::new("b");
    let release_a = a.gate();
    let (a_counters, b_counters) = (a.counters.clone(), b.counters.clone());
    let mut h = Harness::new(vec![Rc::new(a), Rc::new(b)], "a");

    let spawner = h.pool.spawner();
    h.host.spawn_activation(&spawner, "a");
    h.pool.run_until_stalled();
    assert_eq!(h.host.phase("a"), ScenePhase::Mounting);

    h.host.spawn_activation(&spawner, "b");
    h.pool.run_until_stalled();
    assert_eq!(h.host.active_scene().as_deref(), Some("b"));

    release_a.send(()).unwrap();
    h.pool.run_until_stalled();

    assert_eq!(h.host.active_scene().as_deref(), Some("b"));
    assert_eq!(h.host.phase("a"), ScenePhase::Unmounted);
    assert_eq!(h.host.phase("b"), ScenePhase::Mounted);
    assert_eq!(a_counters.mounted.get(), 1);
    assert_eq!(a_counters.cleaned.get(), 1);
    assert_eq!(b_counters.cleaned.get(), 0);
    assert_eq!(h.backend.live_devices(), 1);
    assert_eq!(h.listeners.count_of(EventKind::Resize), 1);
}

#[test]
fn unmount_releases_everything() {
    let scene = ProbeScene::new("multi").with_extra_canvases(3);
    let mut h = Harness::new(vec![Rc::new(scene)], "multi");

    h.activate("multi");
    h.run_frames(3);
    let mounted = h.snapshot();
    assert_eq!(mounted.devices, 1);
    assert_eq!(mounted.canvases, 3);
    assert_eq!(mounted.listeners, 1);
    assert_eq!(mounted.pending_frames, 1);

    h.cleanup();
    assert_eq!(h.snapshot(), EMPTY);
    assert_eq!(h.listeners.dispatch(WindowSignal::Resized { canvas_id: 1 }), 0);
}

#[test]
fn primary_surface_uses_backing_pixels() {
    let scene = ProbeScene::new("points");
    let mut h = Harness::new(vec![Rc::new(scene)], "points");

    h.activate("points");
    let cfg = h.backend.surface_config(1).unwrap();
    assert_eq!((cfg.width, cfg.height), (600, 300));

    h.canvas.set_client_size(0.0, -5.0);
    h.listeners.dispatch(WindowSignal::Resized { canvas_id: 1 });
    let cfg = h.backend.surface_config(1).unwrap();
    assert_eq!((cfg.width, cfg.height), (1, 1));
}

#[test]
fn unsupported_optional_feature_still_mounts() {
    let scene = ProbeScene::new("particles").with_optional(wgpu::Features::TIMESTAMP_QUERY);
    let mut h = Harness::new(vec![Rc::new(scene)], "particles");

    assert_eq!(h.activate("particles"), Activation::Mounted("particles".into()));
    assert_eq!(h.backend.device_requests(), vec![wgpu::Features::empty()]);
}

#[test]
fn returning_to_a_scene_restores_the_baseline() {
    let text = ProbeScene::new("msdf-text");
    let points = ProbeScene::new("points").with_extra_canvases(2);
    let mut h = Harness::new(vec![Rc::new(text), Rc::new(points)], "msdf-text");

    h.activate("msdf-text");
    h.run_frames(2);
    let baseline = h.snapshot();

    h.activate("points");
    h.run_frames(2);
    assert_eq!(h.snapshot().canvases, 2);

    h.activate("msdf-text");
    h.run_frames(2);
    assert_eq!(h.snapshot(), baseline);
    assert_eq!(h.host.active_scene().as_deref(), Some("msdf-text"));
}

#[test]
fn late_readback_is_discarded_after_unmount() {
    let scene = ProbeScene::new("particles");
    let mut h = Harness::new(vec![Rc::new(scene)], "particles");

    h.activate("particles");
    h.tick();
    assert_eq!(h.backend.pending_reads(), 1);

    h.cleanup();
    h.pool.run_until_stalled();

    // Unmount aborts the outstanding map instead of waiting on the driver.
    assert_eq!(h.backend.pending_reads(), 0);
    assert_eq!(h.backend.complete_reads(&[0; 16]), 0);
    assert_eq!(h.backend.live_buffers(), 0);
    assert_eq!(h.backend.buffers_created(), 1);
}

#[test]
fn device_loss_stops_the_frame_loop() {
    let scene = ProbeScene::new("points");
    let mut h = Harness::new(vec![Rc::new(scene)], "points");

    h.activate("points");
    h.run_frames(2);
    let presented = h.backend.presented_frames();
    assert_eq!(h.frames.pending_count(), 1);

    h.backend.emit_device_lost("Unknown", "driver reset");
    h.backend.emit_device_lost("Unknown", "driver reset again");
    h.run_frames(3);

    assert_eq!(h.frames.pending_count(), 0);
    assert_eq!(h.backend.presented_frames(), presented);

    h.cleanup();
    assert_eq!(h.snapshot(), EMPTY);
}

#[test]
fn activation_waits_for_a_slow_cleanup() {
    let a = ProbeScene::new("a");
    let b = ProbeScene::new("b");
    let c = ProbeScene::new("c");
    let release_cleanup = a.gate_cleanup();
    let (a_counters, c_counters) = (a.counters.clone(), c.counters.clone());
    let mut h = Harness::new(vec![Rc::new(a), Rc::new(b), Rc::new(c)], "a");

    h.activate("a");
    let spawner = h.pool.spawner();
    h.host.spawn_activation(&spawner, "b");
    h.pool.run_until_stalled();
    assert_eq!(h.host.phase("a"), ScenePhase::Unmounting);

    h.host.spawn_activation(&spawner, "c");
    h.pool.run_until_stalled();
    assert_eq!(h.host.phase("c"), ScenePhase::Unmounted);
    assert_eq!(c_counters.mounted.get(), 0);
    assert_eq!(a_counters.cleaned.get(), 0);

    release_cleanup.send(()).unwrap();
    h.pool.run_until_stalled();

    assert_eq!(a_counters.cleaned.get(), 1);
    assert_eq!(h.host.phase("a"), ScenePhase::Unmounted);
    assert_eq!(h.host.phase("b"), ScenePhase::Unmounted);
    assert_eq!(h.host.phase("c"), ScenePhase::Mounted);
    assert_eq!(h.host.active_scene().as_deref(), Some("c"));
    assert_eq!(h.backend.live_devices(), 1);
}

#[test]
fn cleanup_supersedes_a_mount_in_flight() {
    let scene = ProbeScene::new("multi").with_extra_canvases(2);
    let release = scene.gate();
    let counters = scene.counters.clone();
    let mut h = Harness::new(vec![Rc::new(scene)], "multi");

    let spawner = h.pool.spawner();
    h.host.spawn_activation(&spawner, "multi");
    h.pool.run_until_stalled();
    assert_eq!(h.host.mounts_in_flight(), 1);

    h.cleanup();
    assert_eq!(h.host.mounts_in_flight(), 1);

    release.send(()).unwrap();
    h.pool.run_until_stalled();

    assert_eq!(h.host.mounts_in_flight(), 0);
    assert!(h.host.active_scene().is_none());
    assert_eq!(counters.mounted.get(), 1);
    assert_eq!(counters.cleaned.get(), 1);
    assert_eq!(h.snapshot(), EMPTY);
}
