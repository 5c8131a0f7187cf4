use std::cell::RefCell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::device::Disposer;

type CleanupFn = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()>>;

/// Teardown returned by a scene mount.
///
/// Clones share one underlying callback; whichever `run` comes first executes
/// it and every later call returns immediately.
#[derive(Clone)]
pub struct Cleanup {
    inner: Rc<RefCell<Option<CleanupFn>>>,
}

impl Cleanup {
    pub fn new(f: impl FnOnce() -> LocalBoxFuture<'static, ()> + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Some(Box::new(f)))),
        }
    }

    pub fn from_fn(f: impl FnOnce() + 'static) -> Self {
        Self::new(move || {
            f();
            Box::pin(async {})
        })
    }

    /// For scenes that allocate nothing cancelable.
    pub fn noop() -> Self {
        Self {
            inner: Rc::new(RefCell::new(None)),
        }
    }

    /// True once `run` has started (or for [`Cleanup::noop`]).
    pub fn is_done(&self) -> bool {
        self.inner.borrow().is_none()
    }

    pub async fn run(&self) {
        // Taken before awaiting so a reentrant call sees nothing left to do.
        let f = self.inner.borrow_mut().take();
        if let Some(f) = f {
            f().await;
        }
    }
}

/// Scoped acquisition list.
///
/// Push a disposer right after each successful allocation; `dispose` runs
/// them last-in first-out so dependents go before what they depend on.
/// Failures are logged and do not stop the unwind.
pub struct DisposeStack {
    label: String,
    entries: Vec<(String, Disposer)>,
}

impl DisposeStack {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Vec::new(),
        }
    }

    /// Pushes an async, fallible disposer.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        dispose: impl FnOnce() -> LocalBoxFuture<'static, anyhow::Result<()>> + 'static,
    ) {
        self.entries.push((name.into(), Box::new(dispose)));
    }

    /// Pushes a synchronous disposer that cannot fail.
    pub fn defer(&mut self, name: impl Into<String>, f: impl FnOnce() + 'static) {
        self.push(name, move || {
            f();
            Box::pin(async { Ok(()) })
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unwinds the stack. Returns the number of disposers that failed.
    pub async fn dispose(&mut self) -> usize {
        let mut failed = 0;
        while let Some((name, dispose)) = self.entries.pop() {
            if let Err(err) = dispose().await {
                failed += 1;
                log::warn!("{}: disposing {name} failed: {err:#}", self.label);
            }
        }
        log::debug!("{}: disposed ({failed} failures)", self.label);
        failed
    }

    pub fn into_cleanup(mut self) -> Cleanup {
        Cleanup::new(move || {
            Box::pin(async move {
                self.dispose().await;
            })
        })
    }

    /// Ends a mount: on success the stack becomes the scene's cleanup; on
    /// failure everything acquired so far is released before the error is
    /// returned.
    pub async fn finish(mut self, result: anyhow::Result<()>) -> anyhow::Result<Cleanup> {
        match result {
            Ok(()) => Ok(self.into_cleanup()),
            Err(err) => {
                log::warn!("{}: mount failed, unwinding {} resources", self.label, self.len());
                self.dispose().await;
                Err(err)
            }
        }
    }
}
