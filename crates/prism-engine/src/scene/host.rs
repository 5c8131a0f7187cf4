use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures::executor::LocalSpawner;
use futures::future::{LocalBoxFuture, Shared};
use futures::task::LocalSpawnExt;
use futures::FutureExt;

use super::cleanup::Cleanup;
use super::context::MountContext;
use super::selector::SceneEntry;
use super::{Scene, ScenePhase};
use crate::device::Backend;

/// Result of a successful [`SceneHost::activate_scene`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    Mounted(String),
    /// The requested scene was unknown or failed to mount; the default scene
    /// was mounted instead.
    FellBack { requested: String, mounted: String },
    /// A newer activation arrived first; nothing from this call stayed mounted.
    Superseded,
}

#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("no scene `{0}` in the catalog")]
    UnknownScene(String),

    #[error("scene `{id}` failed to mount: {reason}")]
    MountFailed { id: String, reason: String },
}

struct ActiveScene {
    id: String,
    token: u64,
    cleanup: Cleanup,
}

enum MountOutcome {
    Installed,
    Stale,
    Failed(anyhow::Error),
}

struct HostInner<B: Backend> {
    scenes: Vec<Rc<dyn Scene<B>>>,
    default_id: String,
    ctx: MountContext<B>,
    latest: Cell<u64>,
    mounting: Cell<usize>,
    active: RefCell<Option<ActiveScene>>,
    /// Teardown of the previous scene while it is still running. Every
    /// activation waits on it before touching the content root.
    pending_unmount: RefCell<Option<Shared<LocalBoxFuture<'static, ()>>>>,
    phases: RefCell<HashMap<String, (u64, ScenePhase)>>,
}

impl<B: Backend> HostInner<B> {
    fn set_phase(&self, id: &str, token: u64, phase: ScenePhase) {
        let mut phases = self.phases.borrow_mut();
        match phases.get_mut(id) {
            Some(entry) if entry.0 > token => {}
            Some(entry) => *entry = (token, phase),
            None => {
                phases.insert(id.to_string(), (token, phase));
            }
        }
    }

    fn clear_finished_unmount(&self) {
        let mut slot = self.pending_unmount.borrow_mut();
        if slot.as_ref().is_some_and(|p| p.peek().is_some()) {
            *slot = None;
        }
    }
}

/// Sequences scene activation.
///
/// Each activation stamps a token; only the newest token may install its
/// scene. An older mount that resolves late is cleaned up on the spot.
pub struct SceneHost<B: Backend> {
    inner: Rc<HostInner<B>>,
}

impl<B: Backend> Clone for SceneHost<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> SceneHost<B> {
    pub fn new(
        ctx: MountContext<B>,
        scenes: Vec<Rc<dyn Scene<B>>>,
        default_id: impl Into<String>,
    ) -> Self {
        Self {
            inner: Rc::new(HostInner {
                scenes,
                default_id: default_id.into(),
                ctx,
                latest: Cell::new(0),
                mounting: Cell::new(0),
                active: RefCell::new(None),
                pending_unmount: RefCell::new(None),
                phases: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn scenes(&self) -> Vec<SceneEntry> {
        self.inner
            .scenes
            .iter()
            .map(|s| SceneEntry {
                id: s.id().to_string(),
                title: s.title().to_string(),
            })
            .collect()
    }

    pub fn default_scene(&self) -> &str {
        &self.inner.default_id
    }

    pub fn active_scene(&self) -> Option<String> {
        self.inner.active.borrow().as_ref().map(|a| a.id.clone())
    }

    pub fn phase(&self, id: &str) -> ScenePhase {
        self.inner
            .phases
            .borrow()
            .get(id)
            .map(|(_, phase)| *phase)
            .unwrap_or(ScenePhase::Unmounted)
    }

    /// Mount futures started and not yet resolved, including superseded ones
    /// still unwinding.
    pub fn mounts_in_flight(&self) -> usize {
        self.inner.mounting.get()
    }

    pub fn context(&self) -> &MountContext<B> {
        &self.inner.ctx
    }

    /// Tears down the active scene, then mounts `id`.
    ///
    /// Unknown ids and failed mounts fall back to the default scene. If the
    /// default scene fails too, the content root is left empty.
    pub async fn activate_scene(&self, id: &str) -> Result<Activation, SceneError> {
        let token = self.next_token();
        log::info!("activating scene `{id}`");

        self.take_and_run_active().await;
        if !self.is_latest(token) {
            return Ok(Activation::Superseded);
        }
        self.inner.ctx.root.clear();

        let default_id = self.inner.default_id.clone();
        let (scene, fell_back) = match self.find(id) {
            Some(scene) => (scene, false),
            None => {
                log::warn!("unknown scene `{id}`; falling back to `{default_id}`");
                let scene = self
                    .find(&default_id)
                    .ok_or_else(|| SceneError::UnknownScene(id.to_string()))?;
                (scene, true)
            }
        };
        let mounted_id = scene.id().to_string();

        let err = match self.mount(scene, token).await {
            MountOutcome::Installed if fell_back => {
                return Ok(Activation::FellBack {
                    requested: id.to_string(),
                    mounted: mounted_id,
                });
            }
            MountOutcome::Installed => return Ok(Activation::Mounted(mounted_id)),
            MountOutcome::Stale => return Ok(Activation::Superseded),
            MountOutcome::Failed(err) => err,
        };

        log::error!("scene `{mounted_id}` failed to mount: {err:#}");
        self.inner.ctx.root.clear();
        if mounted_id == default_id {
            return Err(SceneError::MountFailed {
                id: mounted_id,
                reason: format!("{err:#}"),
            });
        }

        let Some(default) = self.find(&default_id) else {
            return Err(SceneError::MountFailed {
                id: mounted_id,
                reason: format!("{err:#}"),
            });
        };
        match self.mount(default, token).await {
            MountOutcome::Installed => Ok(Activation::FellBack {
                requested: id.to_string(),
                mounted: default_id,
            }),
            MountOutcome::Stale => Ok(Activation::Superseded),
            MountOutcome::Failed(err) => {
                log::error!("default scene `{default_id}` failed to mount: {err:#}");
                self.inner.ctx.root.clear();
                Err(SceneError::MountFailed {
                    id: default_id,
                    reason: format!("{err:#}"),
                })
            }
        }
    }

    /// Runs `activate_scene` on `spawner`, logging the outcome.
    pub fn spawn_activation(&self, spawner: &LocalSpawner, id: &str) {
        let host = self.clone();
        let id = id.to_string();
        let task = async move {
            match host.activate_scene(&id).await {
                Ok(Activation::Mounted(id)) => log::info!("scene `{id}` mounted"),
                Ok(Activation::FellBack { requested, mounted }) => {
                    log::warn!("scene `{requested}` unavailable; `{mounted}` mounted instead")
                }
                Ok(Activation::Superseded) => log::debug!("activation of `{id}` superseded"),
                Err(err) => log::error!("{err}"),
            }
        };
        if let Err(err) = spawner.spawn_local(task) {
            log::error!("cannot schedule scene activation: {err}");
        }
    }

    /// Unmounts the active scene, if any, and empties the content root.
    ///
    /// Mounts still in flight are superseded and cleaned up when they resolve.
    pub async fn cleanup_active_scene(&self) {
        let token = self.next_token();
        self.take_and_run_active().await;
        if self.is_latest(token) {
            self.inner.ctx.root.clear();
        }
    }

    fn next_token(&self) -> u64 {
        let token = self.inner.latest.get() + 1;
        self.inner.latest.set(token);
        token
    }

    fn is_latest(&self, token: u64) -> bool {
        self.inner.latest.get() == token
    }

    fn find(&self, id: &str) -> Option<Rc<dyn Scene<B>>> {
        self.inner.scenes.iter().find(|s| s.id() == id).cloned()
    }

    fn set_phase(&self, id: &str, token: u64, phase: ScenePhase) {
        self.inner.set_phase(id, token, phase);
    }

    /// Waits out any unmount already running, then unmounts the active scene.
    async fn take_and_run_active(&self) {
        let pending = self.inner.pending_unmount.borrow().clone();
        if let Some(pending) = pending {
            pending.await;
            self.inner.clear_finished_unmount();
        }

        let active = self.inner.active.borrow_mut().take();
        let Some(active) = active else {
            return;
        };
        let inner: Weak<HostInner<B>> = Rc::downgrade(&self.inner);
        let unmount = async move {
            if let Some(inner) = inner.upgrade() {
                inner.set_phase(&active.id, active.token, ScenePhase::Unmounting);
            }
            active.cleanup.run().await;
            if let Some(inner) = inner.upgrade() {
                inner.set_phase(&active.id, active.token, ScenePhase::Unmounted);
            }
            log::debug!("scene `{}` unmounted", active.id);
        }
        .boxed_local()
        .shared();
        *self.inner.pending_unmount.borrow_mut() = Some(unmount.clone());
        unmount.await;
        self.inner.clear_finished_unmount();
    }

    async fn mount(&self, scene: Rc<dyn Scene<B>>, token: u64) -> MountOutcome {
        let id = scene.id().to_string();
        self.set_phase(&id, token, ScenePhase::Mounting);

        self.inner.mounting.set(self.inner.mounting.get() + 1);
        let _in_flight = InFlight(&self.inner.mounting);
        let result = scene.mount(self.inner.ctx.clone()).await;

        match result {
            Ok(cleanup) if self.is_latest(token) => {
                *self.inner.active.borrow_mut() = Some(ActiveScene {
                    id: id.clone(),
                    token,
                    cleanup,
                });
                self.set_phase(&id, token, ScenePhase::Mounted);
                MountOutcome::Installed
            }
            Ok(cleanup) => {
                log::debug!("scene `{id}` resolved after a newer activation; disposing");
                self.set_phase(&id, token, ScenePhase::Unmounting);
                cleanup.run().await;
                self.set_phase(&id, token, ScenePhase::Unmounted);
                MountOutcome::Stale
            }
            Err(err) => {
                self.set_phase(&id, token, ScenePhase::Unmounted);
                if self.is_latest(token) {
                    MountOutcome::Failed(err)
                } else {
                    MountOutcome::Stale
                }
            }
        }
    }
}

/// Decrements the in-flight mount count when the mount resolves or is dropped.
struct InFlight<'a>(&'a Cell<usize>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::LocalPool;

    use super::*;
    use crate::device::headless::{HeadlessBackend, HeadlessCanvas, HeadlessRoot};
    use crate::scene::{EventListeners, FrameScheduler};

    struct Fixed {
        id: &'static str,
        fail: bool,
        mounts: Rc<Cell<u32>>,
        cleanups: Rc<Cell<u32>>,
    }

    impl Scene<HeadlessBackend> for Fixed {
        fn id(&self) -> &str {
            self.id
        }

        fn title(&self) -> &str {
            self.id
        }

        fn mount(
            &self,
            _ctx: MountContext<HeadlessBackend>,
        ) -> LocalBoxFuture<'static, anyhow::Result<Cleanup>> {
            let fail = self.fail;
            let mounts = self.mounts.clone();
            let cleanups = self.cleanups.clone();
            Box::pin(async move {
                if fail {
                    anyhow::bail!("intentional failure");
                }
                mounts.set(mounts.get() + 1);
                Ok(Cleanup::from_fn(move || cleanups.set(cleanups.get() + 1)))
            })
        }
    }

    fn scene(id: &'static str, fail: bool) -> (Rc<dyn Scene<HeadlessBackend>>, Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let mounts = Rc::new(Cell::new(0));
        let cleanups = Rc::new(Cell::new(0));
        let s = Fixed {
            id,
            fail,
            mounts: mounts.clone(),
            cleanups: cleanups.clone(),
        };
        (Rc::new(s), mounts, cleanups)
    }

    fn host(scenes: Vec<Rc<dyn Scene<HeadlessBackend>>>, pool: &LocalPool) -> SceneHost<HeadlessBackend> {
        let ctx = MountContext {
            backend: HeadlessBackend::new(),
            root: Rc::new(HeadlessRoot::new(HeadlessCanvas::new(1, 300.0, 150.0, 1.0))),
            frames: FrameScheduler::new(),
            listeners: EventListeners::new(),
            spawner: pool.spawner(),
        };
        SceneHost::new(ctx, scenes, "home")
    }

    #[test]
    fn switching_runs_previous_cleanup_first() {
        let pool = LocalPool::new();
        let (home, _, home_cleanups) = scene("home", false);
        let (other, other_mounts, _) = scene("other", false);
        let host = host(vec![home, other], &pool);

        let a = pollster::block_on(host.activate_scene("home")).unwrap();
        assert_eq!(a, Activation::Mounted("home".into()));
        assert_eq!(host.phase("home"), ScenePhase::Mounted);

        let b = pollster::block_on(host.activate_scene("other")).unwrap();
        assert_eq!(b, Activation::Mounted("other".into()));
        assert_eq!(home_cleanups.get(), 1);
        assert_eq!(other_mounts.get(), 1);
        assert_eq!(host.phase("home"), ScenePhase::Unmounted);
        assert_eq!(host.active_scene().as_deref(), Some("other"));
    }

    #[test]
    fn unknown_id_falls_back_to_default() {
        let pool = LocalPool::new();
        let (home, home_mounts, _) = scene("home", false);
        let host = host(vec![home], &pool);

        let a = pollster::block_on(host.activate_scene("nope")).unwrap();
        assert_eq!(
            a,
            Activation::FellBack {
                requested: "nope".into(),
                mounted: "home".into()
            }
        );
        assert_eq!(home_mounts.get(), 1);
    }

    #[test]
    fn failed_mount_falls_back_to_default() {
        let pool = LocalPool::new();
        let (home, _, _) = scene("home", false);
        let (broken, _, _) = scene("broken", true);
        let host = host(vec![home, broken], &pool);

        let a = pollster::block_on(host.activate_scene("broken")).unwrap();
        assert!(matches!(a, Activation::FellBack { .. }));
        assert_eq!(host.active_scene().as_deref(), Some("home"));
        assert_eq!(host.phase("broken"), ScenePhase::Unmounted);
    }

    #[test]
    fn failing_default_leaves_nothing_active() {
        let pool = LocalPool::new();
        let (home, _, _) = scene("home", true);
        let host = host(vec![home], &pool);

        let err = pollster::block_on(host.activate_scene("home")).unwrap_err();
        assert!(matches!(err, SceneError::MountFailed { .. }));
        assert!(host.active_scene().is_none());
    }

    #[test]
    fn cleanup_active_scene_twice_disposes_once() {
        let pool = LocalPool::new();
        let (home, _, cleanups) = scene("home", false);
        let host = host(vec![home], &pool);

        pollster::block_on(host.activate_scene("home")).unwrap();
        pollster::block_on(host.cleanup_active_scene());
        pollster::block_on(host.cleanup_active_scene());
        assert_eq!(cleanups.get(), 1);
        assert!(host.active_scene().is_none());
    }

    #[test]
    fn spawned_activation_runs_on_the_pool() {
        let mut pool = LocalPool::new();
        let (home, mounts, _) = scene("home", false);
        let host = host(vec![home], &pool);

        host.spawn_activation(&pool.spawner(), "home");
        assert_eq!(mounts.get(), 0);
        pool.run_until_stalled();
        assert_eq!(mounts.get(), 1);
    }
}
