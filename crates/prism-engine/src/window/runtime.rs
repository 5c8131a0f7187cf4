use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::channel::oneshot;
use futures::executor::LocalPool;
use futures::future::LocalBoxFuture;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

use crate::device::{Canvas, WgpuBackend, WindowCanvas};
use crate::scene::{
    CanvasDescriptor, CanvasRoot, EventListeners, FrameScheduler, MountContext, Scene, SceneHost,
    SceneSelector, WindowSignal,
};
use crate::time::FrameClock;

/// Window/runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub title: String,
    pub initial_size: LogicalSize<f64>,

    /// Scene mounted at startup. Defaults to `default_scene`.
    pub initial_scene: Option<String>,

    /// Fallback scene for unknown ids and failed mounts. Defaults to the first
    /// scene in the catalog.
    pub default_scene: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            title: "prism".to_string(),
            initial_size: LogicalSize::new(1280.0, 720.0),
            initial_scene: None,
            default_scene: None,
        }
    }
}

/// Entry point for the runtime.
pub struct Runtime;

impl Runtime {
    /// Opens the primary window and runs the scene selector until it closes.
    pub fn run(config: RuntimeConfig, scenes: Vec<Rc<dyn Scene<WgpuBackend>>>) -> Result<()> {
        anyhow::ensure!(!scenes.is_empty(), "no scenes registered");

        let event_loop = EventLoop::new().context("failed to create winit EventLoop")?;
        let mut state = AppState::new(config, scenes);

        event_loop
            .run_app(&mut state)
            .context("winit event loop terminated with error")?;

        Ok(())
    }
}

type CanvasReply = oneshot::Sender<anyhow::Result<WindowCanvas>>;

/// Content root over winit windows.
///
/// Extra canvases are separate windows. They can only be created from inside
/// the event loop, so `create_canvas` queues a request that the runtime serves
/// on its next turn.
struct WindowRoot {
    primary: WindowCanvas,
    extra: RefCell<HashMap<u64, WindowCanvas>>,
    requests: RefCell<Vec<(CanvasDescriptor, CanvasReply)>>,
    closing: Cell<bool>,
}

impl WindowRoot {
    fn new(primary: WindowCanvas) -> Self {
        Self {
            primary,
            extra: RefCell::new(HashMap::new()),
            requests: RefCell::new(Vec::new()),
            closing: Cell::new(false),
        }
    }

    /// Refuses further canvas requests and drops the queued ones, so mounts
    /// waiting on a window fail instead of hanging.
    fn close(&self) {
        self.closing.set(true);
        self.requests.borrow_mut().clear();
    }

    fn serve_requests(&self, event_loop: &ActiveEventLoop) {
        let requests = std::mem::take(&mut *self.requests.borrow_mut());
        for (desc, reply) in requests {
            let attrs = Window::default_attributes()
                .with_title(desc.title)
                .with_inner_size(LogicalSize::new(desc.logical_size.0, desc.logical_size.1));

            let result = event_loop
                .create_window(attrs)
                .context("failed to create canvas window")
                .map(|window| {
                    let canvas = WindowCanvas::new(Arc::new(window));
                    self.extra
                        .borrow_mut()
                        .insert(canvas.canvas_id(), canvas.clone());
                    canvas
                });
            // A dropped receiver means the mount gave up; the window goes with it.
            if let Err(Ok(canvas)) = reply.send(result) {
                self.release(canvas.canvas_id());
            }
        }
    }

    fn contains(&self, canvas_id: u64) -> bool {
        canvas_id == self.primary.canvas_id() || self.extra.borrow().contains_key(&canvas_id)
    }

    fn request_redraw_all(&self) {
        self.primary.window().request_redraw();
        for canvas in self.extra.borrow().values() {
            canvas.window().request_redraw();
        }
    }
}

impl CanvasRoot<WindowCanvas> for WindowRoot {
    fn primary(&self) -> WindowCanvas {
        self.primary.clone()
    }

    fn create_canvas(
        &self,
        desc: CanvasDescriptor,
    ) -> LocalBoxFuture<'static, anyhow::Result<WindowCanvas>> {
        if self.closing.get() {
            return Box::pin(async { Err(anyhow::anyhow!("runtime is shutting down")) });
        }
        let (tx, rx) = oneshot::channel();
        self.requests.borrow_mut().push((desc, tx));
        Box::pin(async move {
            rx.await
                .map_err(|_| anyhow::anyhow!("canvas request dropped before the window opened"))?
        })
    }

    fn release(&self, canvas_id: u64) {
        // Dropping the last Arc closes the window.
        self.extra.borrow_mut().remove(&canvas_id);
    }

    fn clear(&self) {
        self.extra.borrow_mut().clear();
        self.requests.borrow_mut().clear();
    }

    fn canvas_count(&self) -> usize {
        self.extra.borrow().len()
    }
}

struct Session {
    primary: WindowCanvas,
    root: Rc<WindowRoot>,
    host: SceneHost<WgpuBackend>,
    selector: SceneSelector,
}

struct AppState {
    config: RuntimeConfig,
    scenes: Vec<Rc<dyn Scene<WgpuBackend>>>,
    backend: WgpuBackend,

    pool: LocalPool,
    frames: FrameScheduler,
    listeners: EventListeners,
    clock: FrameClock,

    session: Option<Session>,
    exit_requested: bool,
}

impl AppState {
    fn new(config: RuntimeConfig, scenes: Vec<Rc<dyn Scene<WgpuBackend>>>) -> Self {
        Self {
            config,
            scenes,
            backend: WgpuBackend::new(),
            pool: LocalPool::new(),
            frames: FrameScheduler::new(),
            listeners: EventListeners::new(),
            clock: FrameClock::default(),
            session: None,
            exit_requested: false,
        }
    }

    fn start_session(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let attrs = Window::default_attributes()
            .with_title(self.config.title.clone())
            .with_inner_size(self.config.initial_size);
        let window = event_loop
            .create_window(attrs)
            .context("failed to create window")?;

        let primary = WindowCanvas::new(Arc::new(window));
        let root = Rc::new(WindowRoot::new(primary.clone()));

        let ctx = MountContext {
            backend: self.backend.clone(),
            root: root.clone(),
            frames: self.frames.clone(),
            listeners: self.listeners.clone(),
            spawner: self.pool.spawner(),
        };

        let default_id = match &self.config.default_scene {
            Some(id) => id.clone(),
            None => self
                .scenes
                .first()
                .map(|s| s.id().to_string())
                .context("no scenes registered")?,
        };
        let host = SceneHost::new(ctx, self.scenes.clone(), default_id.clone());
        let mut selector = SceneSelector::new(host.scenes());

        let initial = self.config.initial_scene.clone().unwrap_or(default_id);
        if selector.select(&initial).is_none() {
            log::warn!("unknown initial scene `{initial}`");
        }
        host.spawn_activation(&self.pool.spawner(), &initial);

        self.session = Some(Session {
            primary,
            root,
            host,
            selector,
        });
        self.refresh_title();
        Ok(())
    }

    fn refresh_title(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let title = match session.selector.current() {
            Some(entry) => format!("{} | {}", self.config.title, entry.title),
            None => self.config.title.clone(),
        };
        session.primary.window().set_title(&title);
    }

    fn handle_key(&mut self, event: &KeyEvent) {
        if event.state != ElementState::Pressed || event.repeat {
            return;
        }
        let PhysicalKey::Code(code) = event.physical_key else {
            return;
        };
        if code == KeyCode::Escape {
            self.exit_requested = true;
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let selected = match code {
            KeyCode::ArrowRight => session.selector.next(),
            KeyCode::ArrowLeft => session.selector.previous(),
            other => match digit_index(other) {
                Some(index) => session.selector.select_index(index),
                None => return,
            },
        };
        let Some(id) = selected.map(|entry| entry.id.clone()) else {
            return;
        };

        session.host.spawn_activation(&self.pool.spawner(), &id);
        self.refresh_title();
    }

    /// Unmounts the active scene before the windows go away.
    ///
    /// Mounts still in flight are superseded by the cleanup and driven until
    /// they unwind on their own.
    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(session) = self.session.take() {
            self.listeners.dispatch(WindowSignal::Unload);
            session.root.close();
            self.pool.run_until(session.host.cleanup_active_scene());
            self.pool.run_until_stalled();

            let stuck = session.host.mounts_in_flight();
            if stuck > 0 {
                log::warn!("{stuck} scene mount(s) still pending at shutdown; dropping them");
            }
            log::info!("scene host shut down");
        }
        event_loop.exit();
    }
}

impl ApplicationHandler for AppState {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.session.is_some() {
            return;
        }

        if let Err(e) = self.start_session(event_loop) {
            log::error!("failed to start: {e:#}");
            self.exit_requested = true;
            event_loop.exit();
            return;
        }
        self.pool.run_until_stalled();
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exit_requested {
            self.shutdown(event_loop);
            return;
        }

        if let Some(session) = &self.session {
            session.root.serve_requests(event_loop);
        }
        self.pool.run_until_stalled();

        event_loop.set_control_flow(ControlFlow::Wait);

        // Continuous redraw; frame callbacks drive every canvas.
        if let Some(session) = &self.session {
            session.root.request_redraw_all();
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if self.exit_requested {
            self.shutdown(event_loop);
            return;
        }

        let canvas_id = u64::from(window_id);
        let (is_primary, known) = match &self.session {
            Some(session) => (
                canvas_id == session.primary.canvas_id(),
                session.root.contains(canvas_id),
            ),
            None => return,
        };
        if !known {
            return;
        }

        match &event {
            WindowEvent::CloseRequested if is_primary => {
                self.exit_requested = true;
            }
            WindowEvent::CloseRequested => {
                log::debug!("ignoring close of scene-owned canvas {canvas_id}");
            }

            WindowEvent::Resized(_) | WindowEvent::ScaleFactorChanged { .. } => {
                self.listeners
                    .dispatch(WindowSignal::Resized { canvas_id });
            }

            WindowEvent::Occluded(occluded) if is_primary => {
                self.listeners.dispatch(WindowSignal::VisibilityChanged {
                    visible: !occluded,
                });
            }

            WindowEvent::KeyboardInput { event, .. } if is_primary => {
                self.handle_key(event);
            }

            WindowEvent::RedrawRequested if is_primary => {
                let ft = self.clock.tick();
                self.frames.run_frame(ft);
                self.pool.run_until_stalled();
            }

            _ => {}
        }

        if self.exit_requested {
            self.shutdown(event_loop);
        }
    }
}

fn digit_index(code: KeyCode) -> Option<usize> {
    let index = match code {
        KeyCode::Digit1 => 0,
        KeyCode::Digit2 => 1,
        KeyCode::Digit3 => 2,
        KeyCode::Digit4 => 3,
        KeyCode::Digit5 => 4,
        KeyCode::Digit6 => 5,
        KeyCode::Digit7 => 6,
        KeyCode::Digit8 => 7,
        KeyCode::Digit9 => 8,
        _ => return None,
    };
    Some(index)
}
