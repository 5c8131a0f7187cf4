use std::cell::{Cell, RefCell};
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::device::LostFlag;
use crate::time::FrameTime;

type FrameCallback = Box<dyn FnOnce(FrameTime)>;

/// Handle of a pending frame request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameRequestId(u64);

#[derive(Default)]
struct SchedulerState {
    next_id: u64,
    pending: Vec<(FrameRequestId, FrameCallback)>,
}

/// One-shot callbacks run on the next display refresh.
///
/// Callbacks requested while a frame runs are deferred to the following frame.
#[derive(Clone, Default)]
pub struct FrameScheduler {
    inner: Rc<RefCell<SchedulerState>>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_frame(&self, f: impl FnOnce(FrameTime) + 'static) -> FrameRequestId {
        let mut st = self.inner.borrow_mut();
        st.next_id += 1;
        let id = FrameRequestId(st.next_id);
        st.pending.push((id, Box::new(f)));
        id
    }

    /// Returns false if the request already ran or was cancelled.
    pub fn cancel_frame(&self, id: FrameRequestId) -> bool {
        let mut st = self.inner.borrow_mut();
        let before = st.pending.len();
        st.pending.retain(|(pending, _)| *pending != id);
        st.pending.len() != before
    }

    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    /// Runs every callback requested before this call. Returns how many ran.
    pub fn run_frame(&self, time: FrameTime) -> usize {
        let batch = std::mem::take(&mut self.inner.borrow_mut().pending);
        let count = batch.len();
        for (_, callback) in batch {
            callback(time);
        }
        count
    }
}

struct LoopState {
    scheduler: FrameScheduler,
    disposed: Cell<bool>,
    pending: Cell<Option<FrameRequestId>>,
    frames: Cell<u64>,
}

type LoopBody = Rc<RefCell<dyn FnMut(FrameTime) -> ControlFlow<()>>>;

/// A body rescheduled every frame until cancelled.
///
/// Each iteration checks the disposed flag on entry and stops without
/// rescheduling once it is set. The body itself can stop the loop by returning
/// `ControlFlow::Break`.
#[derive(Clone)]
pub struct FrameLoop {
    state: Rc<LoopState>,
}

impl FrameLoop {
    pub fn start(
        scheduler: &FrameScheduler,
        body: impl FnMut(FrameTime) -> ControlFlow<()> + 'static,
    ) -> Self {
        let state = Rc::new(LoopState {
            scheduler: scheduler.clone(),
            disposed: Cell::new(false),
            pending: Cell::new(None),
            frames: Cell::new(0),
        });
        let body: LoopBody = Rc::new(RefCell::new(body));
        schedule(state.clone(), body);
        Self { state }
    }

    /// Like [`FrameLoop::start`], but the loop breaks on the first frame after
    /// `lost` is set and never calls `body` again.
    pub fn start_until_lost(
        scheduler: &FrameScheduler,
        lost: LostFlag,
        mut body: impl FnMut(FrameTime) -> ControlFlow<()> + 'static,
    ) -> Self {
        Self::start(scheduler, move |time| {
            if lost.is_lost() {
                log::warn!("device lost; frame loop stopped");
                return ControlFlow::Break(());
            }
            body(time)
        })
    }

    /// Stops the loop. Idempotent.
    pub fn cancel(&self) {
        self.state.disposed.set(true);
        if let Some(id) = self.state.pending.take() {
            self.state.scheduler.cancel_frame(id);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.state.disposed.get()
    }

    pub fn frames_rendered(&self) -> u64 {
        self.state.frames.get()
    }
}

fn schedule(state: Rc<LoopState>, body: LoopBody) {
    let st = state.clone();
    let id = state.scheduler.request_frame(move |time| {
        st.pending.set(None);
        if st.disposed.get() {
            return;
        }
        st.frames.set(st.frames.get() + 1);
        let flow = (&mut *body.borrow_mut())(time);
        if flow.is_break() {
            st.disposed.set(true);
        } else if !st.disposed.get() {
            schedule(st, body);
        }
    });
    state.pending.set(Some(id));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(i: u64) -> FrameTime {
        FrameTime::synthetic(i, i as f32 / 60.0)
    }

    #[test]
    fn requests_made_during_a_frame_wait_for_the_next() {
        let sched = FrameScheduler::new();
        let hits = Rc::new(Cell::new(0));

        let s = sched.clone();
        let h = hits.clone();
        sched.request_frame(move |_| {
            h.set(h.get() + 1);
            let h2 = h.clone();
            s.request_frame(move |_| h2.set(h2.get() + 10));
        });

        assert_eq!(sched.run_frame(frame(0)), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(sched.run_frame(frame(1)), 1);
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn cancelled_request_never_runs() {
        let sched = FrameScheduler::new();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        let id = sched.request_frame(move |_| r.set(true));
        assert!(sched.cancel_frame(id));
        assert!(!sched.cancel_frame(id));
        sched.run_frame(frame(0));
        assert!(!ran.get());
    }

    #[test]
    fn loop_runs_every_frame_until_cancelled() {
        let sched = FrameScheduler::new();
        let lp = FrameLoop::start(&sched, |_| ControlFlow::Continue(()));

        for i in 0..3 {
            sched.run_frame(frame(i));
        }
        assert_eq!(lp.frames_rendered(), 3);

        lp.cancel();
        lp.cancel();
        assert_eq!(sched.pending_count(), 0);
        sched.run_frame(frame(3));
        assert_eq!(lp.frames_rendered(), 3);
        assert!(!lp.is_running());
    }

    #[test]
    fn body_can_cancel_its_own_loop() {
        let sched = FrameScheduler::new();
        let handle: Rc<RefCell<Option<FrameLoop>>> = Rc::new(RefCell::new(None));
        let h = handle.clone();
        let lp = FrameLoop::start(&sched, move |time| {
            if time.frame_index == 1 {
                if let Some(lp) = h.borrow().as_ref() {
                    lp.cancel();
                }
            }
            ControlFlow::Continue(())
        });
        *handle.borrow_mut() = Some(lp.clone());

        sched.run_frame(frame(0));
        sched.run_frame(frame(1));
        assert_eq!(sched.pending_count(), 0);
        assert_eq!(lp.frames_rendered(), 2);
        *handle.borrow_mut() = None;
    }

    #[test]
    fn break_stops_the_loop() {
        let sched = FrameScheduler::new();
        let lp = FrameLoop::start(&sched, |_| ControlFlow::Break(()));
        sched.run_frame(frame(0));
        sched.run_frame(frame(1));
        assert_eq!(lp.frames_rendered(), 1);
        assert!(!lp.is_running());
    }
}
