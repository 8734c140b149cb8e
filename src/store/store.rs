use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::error;

use crate::draft::{produce, try_produce, Draft};

type Listener<T> = Arc<dyn Fn(&Arc<T>, &Arc<T>) + Send + Sync>;
type Registry<T> = RwLock<Vec<(u64, Listener<T>)>>;

/// A thread-safe store for managing application state.
///
/// A store owns exactly one current state value, published as an `Arc` so
/// every reader holds the same immutable snapshot. Transitions go through
/// [`update`](Store::update) (draft-based) or [`apply`](Store::apply)
/// (raw updater); each committed transition notifies subscribers
/// synchronously, in registration order, with the new and previous values.
pub struct Store<T: Clone> {
    state: Arc<RwLock<Arc<T>>>,
    subscribers: Arc<Registry<T>>,
    next_id: Arc<AtomicU64>,
}

impl<T: Clone + 'static> Store<T> {
    /// Create a new store with the given initial state.
    pub fn new(initial: T) -> Self {
        Self {
            state: Arc::new(RwLock::new(Arc::new(initial))),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get the current state value.
    ///
    /// This is a pointer clone, not a copy of the state itself.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.state.read().unwrap())
    }

    /// Read state through a closure without cloning.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        let state = self.state.read().unwrap();
        f(&state)
    }

    /// Update the state by mutating a draft of the current value.
    ///
    /// Edits made to the draft are materialized into a new state value with
    /// untouched substructure shared with the previous one. A mutator that
    /// makes no edits produces the same value and no notification fires.
    pub fn update<F>(&self, mutator: F)
    where
        F: FnOnce(&mut Draft<T>),
    {
        self.apply(|current| produce(current, mutator));
    }

    /// Fallible variant of [`update`](Store::update).
    ///
    /// If the mutator fails, the state is left unchanged, no subscriber is
    /// notified, and the error is returned to the caller.
    pub fn try_update<F, E>(&self, mutator: F) -> Result<(), E>
    where
        F: FnOnce(&mut Draft<T>) -> Result<(), E>,
    {
        let mut outcome = Ok(());
        self.apply(|current| match try_produce(current, mutator) {
            Ok(next) => next,
            Err(e) => {
                outcome = Err(e);
                Arc::clone(current)
            }
        });
        outcome
    }

    /// Replace the state wholesale.
    pub fn set(&self, new_state: T) {
        self.apply(|_| Arc::new(new_state));
    }

    /// Compute and commit the next state value from the current one.
    ///
    /// If the updater returns a value pointer-equal to the current one, the
    /// call is a no-op and subscribers are not notified. Otherwise the new
    /// value is swapped in atomically and every subscriber is invoked with
    /// `(next, previous)` before `apply` returns.
    pub fn apply<F>(&self, updater: F)
    where
        F: FnOnce(&Arc<T>) -> Arc<T>,
    {
        let (next, previous) = {
            let mut state = self.state.write().unwrap();
            let next = updater(&state);
            if Arc::ptr_eq(&state, &next) {
                return;
            }
            let previous = std::mem::replace(&mut *state, Arc::clone(&next));
            (next, previous)
        };
        // The lock is released before notifying so listeners can read or
        // update the store re-entrantly.
        self.notify(&next, &previous);
    }

    /// Subscribe to state changes.
    ///
    /// The listener is called after every committed transition with the new
    /// and previous state values. Dropping the returned [`Subscription`]
    /// removes the listener.
    #[must_use = "dropping the subscription removes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<T>, &Arc<T>) + Send + Sync + 'static,
    {
        self.register(Arc::new(listener))
    }

    /// Subscribe to a slice of the state selected by `selector`.
    ///
    /// The callback fires immediately with the current slice, then again
    /// whenever a transition changes the selected value. Transitions that
    /// leave the slice equal are filtered out.
    #[must_use = "dropping the subscription removes the listener"]
    pub fn watch<S, Sel, F>(&self, selector: Sel, callback: F) -> Subscription
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&T) -> S + Send + Sync + 'static,
        F: Fn(&S) + Send + Sync + 'static,
    {
        let current = self.read(&selector);
        callback(&current);
        let last = Mutex::new(current);
        self.register(Arc::new(move |next: &Arc<T>, _previous: &Arc<T>| {
            let selected = selector(next);
            let mut last = last.lock().unwrap();
            if *last != selected {
                callback(&selected);
                *last = selected;
            }
        }))
    }

    fn register(&self, listener: Listener<T>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.write().unwrap().push((id, listener));

        let registry = Arc::downgrade(&self.subscribers);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(registry) = Weak::upgrade(&registry) {
                    registry.write().unwrap().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    /// Notify all subscribers of a committed transition.
    fn notify(&self, next: &Arc<T>, previous: &Arc<T>) {
        // Snapshot the registry: listeners added during this pass are not
        // invoked until the next transition.
        let snapshot: Vec<(u64, Listener<T>)> = self.subscribers.read().unwrap().clone();
        for (id, listener) in snapshot {
            // Honor unsubscribes that happened earlier in this same pass.
            let still_registered = self
                .subscribers
                .read()
                .unwrap()
                .iter()
                .any(|(sid, _)| *sid == id);
            if !still_registered {
                continue;
            }
            // A panicking listener must not stop the rest of the pass; the
            // transition has already committed.
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(next, previous))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(listener = id, %message, "store listener panicked");
            }
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap().len()
    }
}

impl<T: Clone> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            subscribers: Arc::clone(&self.subscribers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

/// RAII handle for a store subscription.
///
/// Dropping the handle removes the listener. A listener is never invoked
/// after its subscription is dropped, even when the drop happens inside a
/// notification pass for the same transition.
#[must_use = "dropping the subscription removes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the listener registered for the lifetime of the store.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
