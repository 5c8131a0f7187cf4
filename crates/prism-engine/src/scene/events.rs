use std::cell::RefCell;
use std::rc::Rc;

/// Window-level notifications scenes may subscribe to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Resize,
    Visibility,
    Unload,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WindowSignal {
    /// A canvas changed logical size or scale factor.
    Resized { canvas_id: u64 },
    VisibilityChanged { visible: bool },
    /// The window is about to close.
    Unload,
}

impl WindowSignal {
    pub fn kind(&self) -> EventKind {
        match self {
            WindowSignal::Resized { .. } => EventKind::Resize,
            WindowSignal::VisibilityChanged { .. } => EventKind::Visibility,
            WindowSignal::Unload => EventKind::Unload,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Rc<dyn Fn(&WindowSignal)>;

#[derive(Default)]
struct ListenerState {
    next_id: u64,
    entries: Vec<(ListenerId, EventKind, Listener)>,
}

/// Listener table fed by the runtime.
///
/// Everything a scene adds during mount must be removed by its cleanup;
/// [`count`](Self::count) makes that checkable.
#[derive(Clone, Default)]
pub struct EventListeners {
    inner: Rc<RefCell<ListenerState>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, kind: EventKind, f: impl Fn(&WindowSignal) + 'static) -> ListenerId {
        let mut st = self.inner.borrow_mut();
        st.next_id += 1;
        let id = ListenerId(st.next_id);
        st.entries.push((id, kind, Rc::new(f)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut st = self.inner.borrow_mut();
        let before = st.entries.len();
        st.entries.retain(|(entry, _, _)| *entry != id);
        st.entries.len() != before
    }

    pub fn count(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.inner
            .borrow()
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }

    /// Calls every listener of the signal's kind. Listeners may add or remove
    /// listeners; changes apply from the next dispatch.
    pub fn dispatch(&self, signal: WindowSignal) -> usize {
        let kind = signal.kind();
        let targets: Vec<Listener> = self
            .inner
            .borrow()
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, f)| f.clone())
            .collect();
        for listener in &targets {
            listener(&signal);
        }
        targets.len()
    }
}
