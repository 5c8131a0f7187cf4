use std::any::Any;
use std::fmt;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

/// Async-capable release callback of a tracked resource.
pub type Disposer = Box<dyn FnOnce() -> LocalBoxFuture<'static, anyhow::Result<()>>>;

/// An opaque handle plus its optional release callback.
pub struct TrackedResource {
    pub id: String,
    pub resource: Rc<dyn Any>,
    pub dispose: Option<Disposer>,
}

impl TrackedResource {
    pub fn new(id: impl Into<String>, resource: Rc<dyn Any>) -> Self {
        Self {
            id: id.into(),
            resource,
            dispose: None,
        }
    }

    /// Attaches a synchronous release callback.
    pub fn on_dispose(mut self, f: impl FnOnce() -> anyhow::Result<()> + 'static) -> Self {
        self.dispose = Some(Box::new(move || {
            let result = f();
            Box::pin(async move { result })
        }));
        self
    }

    /// Attaches an async release callback.
    pub fn on_dispose_async(mut self, f: Disposer) -> Self {
        self.dispose = Some(f);
        self
    }
}

impl fmt::Debug for TrackedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedResource")
            .field("id", &self.id)
            .field("has_disposer", &self.dispose.is_some())
            .finish()
    }
}

/// Snapshot row returned by [`ResourceRegistry::list`].
#[derive(Clone)]
pub struct TrackedEntry {
    pub id: String,
    pub resource: Rc<dyn Any>,
    pub has_disposer: bool,
}

/// Failures collected by [`ResourceRegistry::dispose_all`].
#[derive(Debug, thiserror::Error)]
#[error("{} of {attempted} disposers failed", .failures.len())]
pub struct DisposeError {
    pub attempted: usize,
    pub failures: Vec<(String, anyhow::Error)>,
}

/// Table of tracked resources keyed by id.
///
/// Entries keep insertion order. Overwriting an id keeps its original slot and
/// does not dispose the replaced entry; avoiding orphans is the caller's job.
#[derive(Default)]
pub struct ResourceRegistry {
    entries: Vec<TrackedResource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: TrackedResource) {
        match self.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(slot) => {
                log::debug!("registry: replacing `{}` without disposing it", entry.id);
                *slot = entry;
            }
            None => self.entries.push(entry),
        }
    }

    pub fn get(&self, id: &str) -> Option<Rc<dyn Any>> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.resource.clone())
    }

    /// Typed lookup; `None` when absent or of another type.
    pub fn get_as<T: Any>(&self, id: &str) -> Option<Rc<T>> {
        self.get(id)?.downcast::<T>().ok()
    }

    pub fn list(&self) -> Vec<TrackedEntry> {
        self.entries
            .iter()
            .map(|e| TrackedEntry {
                id: e.id.clone(),
                resource: e.resource.clone(),
                has_disposer: e.dispose.is_some(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every disposer in insertion order, awaiting each, then clears the
    /// table.
    ///
    /// A failing disposer does not stop the remaining ones; all failures are
    /// returned together.
    pub async fn dispose_all(&mut self) -> Result<(), DisposeError> {
        let entries = std::mem::take(&mut self.entries);
        let mut attempted = 0;
        let mut failures = Vec::new();

        for entry in entries {
            let Some(dispose) = entry.dispose else {
                continue;
            };
            attempted += 1;
            if let Err(err) = dispose().await {
                log::warn!("registry: disposing `{}` failed: {err:#}", entry.id);
                failures.push((entry.id, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DisposeError {
                attempted,
                failures,
            })
        }
    }
}
