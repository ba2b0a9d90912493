//! Typed publish/subscribe bus used to decouple the transport from its consumers.
//!
//! Every event type names its own kind through [`Event::kind`], so listeners
//! register per kind and receive the full strongly-typed event.
//!
//! ```text
//! emit(&event)
//!     │
//!     ├── snapshot listeners for event.kind()   (lock held only here)
//!     │
//!     ├── listener 1 ── catch_unwind ── panic? log and continue
//!     ├── listener 2 ── catch_unwind
//!     └── listener N ── catch_unwind
//! ```
//!
//! Listeners may subscribe or unsubscribe (themselves or others) from inside
//! a callback. A listener removed during an `emit` is not invoked by the
//! remainder of that `emit`.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Soft ceiling on listeners per event kind before a leak warning is logged.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// An event that can travel over an [`EventBus`].
pub trait Event: Send + Sync + 'static {
    /// Discriminant listeners subscribe to.
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Identity of one registration on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E> {
    id: ListenerId,
    callback: Callback<E>,
    owner: Option<String>,
    once: bool,
    active: AtomicBool,
}

struct BusInner<E: Event> {
    listeners: Mutex<HashMap<E::Kind, Vec<Arc<Listener<E>>>>>,
    next_id: AtomicU64,
    max_listeners: usize,
}

impl<E: Event> BusInner<E> {
    /// Remove exactly one registration. Drops the kind's entry when it empties.
    fn remove(&self, kind: E::Kind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(set) = listeners.get_mut(&kind) else {
            return false;
        };
        let Some(pos) = set.iter().position(|l| l.id == id) else {
            return false;
        };
        let removed = set.remove(pos);
        removed.active.store(false, Ordering::Release);
        if set.is_empty() {
            listeners.remove(&kind);
        }
        true
    }
}

/// Handle returned by [`EventBus::on`] and [`EventBus::once`].
///
/// Clones share the same registration. Unsubscribing more than once is a
/// no-op. Dropping the handle does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    id: ListenerId,
    remove: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl Subscription {
    fn new(id: ListenerId, remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            remove: Arc::new(Mutex::new(Some(Box::new(remove)))),
        }
    }

    /// The registration this handle controls.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the registration from its bus.
    pub fn unsubscribe(&self) {
        let remove = self.remove.lock().take();
        if let Some(remove) = remove {
            remove();
        }
    }

    /// Whether `unsubscribe` has already been called through any clone.
    pub fn is_unsubscribed(&self) -> bool {
        self.remove.lock().is_none()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

/// Many-listener fan-out keyed by event kind.
pub struct EventBus<E: Event> {
    inner: Arc<BusInner<E>>,
}

impl<E: Event> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self::with_max_listeners(DEFAULT_MAX_LISTENERS)
    }

    /// Create a bus with a custom leak-warning ceiling.
    pub fn with_max_listeners(max_listeners: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                max_listeners,
            }),
        }
    }

    /// Subscribe to every event of `kind`.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(callback), None, false)
    }

    /// Subscribe and tag the registration with the component that owns it.
    pub fn on_with_owner<F>(&self, kind: E::Kind, owner: &str, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(callback), Some(owner.to_string()), false)
    }

    /// Subscribe to the next event of `kind` only.
    ///
    /// The registration counts toward the listener ceiling until it fires.
    pub fn once<F>(&self, kind: E::Kind, callback: F) -> Subscription
    where
        F: FnOnce(&E) + Send + 'static,
    {
        let slot = Mutex::new(Some(callback));
        self.register(
            kind,
            Arc::new(move |event: &E| {
                let callback = slot.lock().take();
                if let Some(callback) = callback {
                    callback(event);
                }
            }),
            None,
            true,
        )
    }

    fn register(
        &self,
        kind: E::Kind,
        callback: Callback<E>,
        owner: Option<String>,
        once: bool,
    ) -> Subscription {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let listener = Arc::new(Listener {
            id,
            callback,
            owner,
            once,
            active: AtomicBool::new(true),
        });

        let count = {
            let mut listeners = self.inner.listeners.lock();
            let set = listeners.entry(kind).or_default();
            set.push(listener);
            set.len()
        };

        if count > self.inner.max_listeners {
            log::warn!(
                "Possible listener leak: {count} listeners for {kind:?} (ceiling {})",
                self.inner.max_listeners
            );
        }

        let weak: Weak<BusInner<E>> = Arc::downgrade(&self.inner);
        Subscription::new(id, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(kind, id);
            }
        })
    }

    /// Remove one registration by id. Returns whether it was present.
    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        self.inner.remove(kind, id)
    }

    /// Deliver `event` to every listener registered for its kind, in
    /// registration order. Returns how many listeners were invoked.
    ///
    /// A panicking listener is logged and skipped; it never unwinds out of
    /// `emit` and never affects the other listeners.
    pub fn emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Arc<Listener<E>>> = match self.inner.listeners.lock().get(&kind) {
            Some(set) => set.clone(),
            None => return 0,
        };

        let mut invoked = 0;
        for listener in snapshot {
            if listener.once {
                // Claim the single delivery before running the callback.
                if !listener.active.swap(false, Ordering::AcqRel) {
                    continue;
                }
                self.inner.remove(kind, listener.id);
            } else if !listener.active.load(Ordering::Acquire) {
                continue;
            }

            let callback = &listener.callback;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                log::error!(
                    "Listener {:?} for {kind:?} panicked: {}",
                    listener.id,
                    panic_message(payload.as_ref())
                );
            }
            invoked += 1;
        }
        invoked
    }

    /// Drop every listener for `kind`, or every listener on the bus.
    pub fn remove_all_listeners(&self, kind: Option<E::Kind>) {
        let removed: Vec<Arc<Listener<E>>> = {
            let mut listeners = self.inner.listeners.lock();
            match kind {
                Some(kind) => listeners.remove(&kind).unwrap_or_default(),
                None => listeners.drain().flat_map(|(_, set)| set).collect(),
            }
        };
        for listener in removed {
            listener.active.store(false, Ordering::Release);
        }
    }

    /// Live registrations for `kind`.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.inner.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Live registrations across all kinds.
    pub fn total_listener_count(&self) -> usize {
        self.inner.listeners.lock().values().map(Vec::len).sum()
    }

    /// Kinds with at least one live registration.
    pub fn event_kinds(&self) -> Vec<E::Kind> {
        self.inner.listeners.lock().keys().copied().collect()
    }

    pub fn max_listeners(&self) -> usize {
        self.inner.max_listeners
    }

    fn owners_by_kind(&self) -> HashMap<E::Kind, (usize, Vec<String>)> {
        self.inner
            .listeners
            .lock()
            .iter()
            .map(|(kind, set)| {
                let owners = set.iter().filter_map(|l| l.owner.clone()).collect();
                (*kind, (set.len(), owners))
            })
            .collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ───────────────────────────────────────────────────────────────────
// Instrumented variant
// ───────────────────────────────────────────────────────────────────

/// Per-kind diagnostics captured by [`InstrumentedEventBus`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventDiagnostics {
    pub listeners: usize,
    pub owners: Vec<String>,
    pub emitted: u64,
}

/// Snapshot of an instrumented bus.
#[derive(Debug, Clone)]
pub struct BusDiagnostics<K> {
    pub events: HashMap<K, EventDiagnostics>,
    pub total_listeners: usize,
}

/// [`EventBus`] that also counts emits and reports owner tags.
///
/// Instrumentation is read-only with respect to delivery: listeners see
/// exactly what a plain bus would deliver.
pub struct InstrumentedEventBus<E: Event> {
    bus: EventBus<E>,
    emitted: Arc<Mutex<HashMap<E::Kind, u64>>>,
}

impl<E: Event> Clone for InstrumentedEventBus<E> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            emitted: self.emitted.clone(),
        }
    }
}

impl<E: Event> Default for InstrumentedEventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> InstrumentedEventBus<E> {
    pub fn new() -> Self {
        Self::with_max_listeners(DEFAULT_MAX_LISTENERS)
    }

    pub fn with_max_listeners(max_listeners: usize) -> Self {
        Self {
            bus: EventBus::with_max_listeners(max_listeners),
            emitted: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn on<F>(&self, kind: E::Kind, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.bus.on(kind, callback)
    }

    pub fn on_with_owner<F>(&self, kind: E::Kind, owner: &str, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.bus.on_with_owner(kind, owner, callback)
    }

    pub fn once<F>(&self, kind: E::Kind, callback: F) -> Subscription
    where
        F: FnOnce(&E) + Send + 'static,
    {
        self.bus.once(kind, callback)
    }

    pub fn off(&self, kind: E::Kind, id: ListenerId) -> bool {
        self.bus.off(kind, id)
    }

    pub fn emit(&self, event: &E) -> usize {
        *self.emitted.lock().entry(event.kind()).or_insert(0) += 1;
        self.bus.emit(event)
    }

    pub fn remove_all_listeners(&self, kind: Option<E::Kind>) {
        self.bus.remove_all_listeners(kind);
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.bus.listener_count(kind)
    }

    pub fn total_listener_count(&self) -> usize {
        self.bus.total_listener_count()
    }

    /// The underlying bus (shares registrations with this one).
    pub fn bus(&self) -> &EventBus<E> {
        &self.bus
    }

    /// Listener counts, owner tags and emit counts per kind.
    pub fn diagnostics(&self) -> BusDiagnostics<E::Kind> {
        let mut events: HashMap<E::Kind, EventDiagnostics> = self
            .bus
            .owners_by_kind()
            .into_iter()
            .map(|(kind, (listeners, owners))| {
                (
                    kind,
                    EventDiagnostics {
                        listeners,
                        owners,
                        emitted: 0,
                    },
                )
            })
            .collect();

        for (kind, count) in self.emitted.lock().iter() {
            events.entry(*kind).or_default().emitted = *count;
        }

        let total_listeners = events.values().map(|e| e.listeners).sum();
        BusDiagnostics {
            events,
            total_listeners,
        }
    }
}
