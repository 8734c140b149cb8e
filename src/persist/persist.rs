use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::draft::Draft;
use crate::persist::adapter::StorageAdapter;
use crate::persist::envelope::Envelope;
use crate::persist::error::PersistError;
use crate::store::{Store, Subscription};

/// Default coalescing window for write-back, in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 25;

type Partialize<T> = Arc<dyn Fn(&T) -> Value + Send + Sync>;
type Migrate = Arc<dyn Fn(u32, Value) -> Option<Value> + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&PersistError) + Send + Sync>;

/// Configuration for a [`Persisted`] store.
pub struct PersistOptions<T> {
    name: String,
    version: u32,
    debounce: Duration,
    partialize: Option<Partialize<T>>,
    migrate: Option<Migrate>,
    on_error: Option<ErrorObserver>,
}

impl<T> PersistOptions<T> {
    /// Options for a store persisted under `name` at version 0.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 0,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            partialize: None,
            migrate: None,
            on_error: None,
        }
    }

    /// Set the schema version written into envelopes.
    ///
    /// A stored envelope whose version differs is discarded on rehydration
    /// unless a [`migrate`](PersistOptions::migrate) hook accepts it.
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the coalescing window for write-back.
    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    /// Select the subset of state included in the envelope.
    ///
    /// Defaults to the entire state. Fields left out of the subset are not
    /// restored across restarts and always come back as their initial
    /// values.
    pub fn partialize<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Value + Send + Sync + 'static,
    {
        self.partialize = Some(Arc::new(f));
        self
    }

    /// Transform an envelope written at an older version into the current
    /// shape. Returning `None` discards the envelope.
    pub fn migrate<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.migrate = Some(Arc::new(f));
        self
    }

    /// Observe persistence failures.
    ///
    /// Invoked for every failed write attempt, possibly from the write-back
    /// worker thread.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&PersistError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl<T> Clone for PersistOptions<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version,
            debounce: self.debounce,
            partialize: self.partialize.clone(),
            migrate: self.migrate.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

/// Latest not-yet-written envelope, shared with the write-back worker.
struct PendingWrite {
    payload: Option<String>,
    shutdown: bool,
}

struct WriteQueue {
    pending: Mutex<PendingWrite>,
    cvar: Condvar,
}

impl WriteQueue {
    fn new() -> Self {
        Self {
            pending: Mutex::new(PendingWrite {
                payload: None,
                shutdown: false,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Replace the pending payload. Last write wins.
    fn push(&self, payload: String) {
        self.pending.lock().unwrap().payload = Some(payload);
        self.cvar.notify_one();
    }

    fn take(&self) -> Option<String> {
        self.pending.lock().unwrap().payload.take()
    }

    fn shut_down(&self) {
        self.pending.lock().unwrap().shutdown = true;
        self.cvar.notify_all();
    }
}

/// A store wrapped with durable persistence.
///
/// On construction the store rehydrates from the adapter: a well-formed
/// envelope stored under the configured name is merged field-by-field over
/// the initial state before `new` returns. Absent, malformed, or
/// version-mismatched envelopes are discarded and the store starts from its
/// initial state; rehydration never fails the caller.
///
/// After every committed transition the configured subset of state is
/// serialized and handed to a write-back worker. Writes within one burst of
/// updates are coalesced: only the latest subset reaches the adapter.
/// Storage failures are reported to the error observer and never affect the
/// in-memory state.
pub struct Persisted<T: Clone> {
    store: Store<T>,
    adapter: Arc<dyn StorageAdapter>,
    options: PersistOptions<T>,
    queue: Arc<WriteQueue>,
    subscription: Option<Subscription>,
    worker: Option<JoinHandle<()>>,
}

impl<T> Persisted<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a persisted store, rehydrating any state previously written
    /// under the configured name.
    pub fn new(initial: T, adapter: Arc<dyn StorageAdapter>, options: PersistOptions<T>) -> Self {
        let store = Store::new(initial);
        rehydrate_into(&store, adapter.as_ref(), &options);

        let queue = Arc::new(WriteQueue::new());

        let subscription = {
            let queue = Arc::clone(&queue);
            let partialize = options.partialize.clone();
            let on_error = options.on_error.clone();
            let version = options.version;
            store.subscribe(move |next: &Arc<T>, _previous: &Arc<T>| {
                let subset = match &partialize {
                    Some(partialize) => partialize(next),
                    None => match serde_json::to_value(&**next) {
                        Ok(value) => value,
                        Err(e) => {
                            report(&on_error, &PersistError::Encode(e.to_string()));
                            return;
                        }
                    },
                };
                let envelope = Envelope {
                    state: subset,
                    version,
                };
                match envelope.encode() {
                    Ok(payload) => queue.push(payload),
                    Err(e) => report(&on_error, &PersistError::Encode(e.to_string())),
                }
            })
        };

        let worker = {
            let queue = Arc::clone(&queue);
            let adapter = Arc::clone(&adapter);
            let name = options.name.clone();
            let debounce = options.debounce;
            let on_error = options.on_error.clone();
            thread::Builder::new()
                .name(format!("satchel-persist-{}", options.name))
                .spawn(move || write_back_loop(&queue, adapter.as_ref(), &name, debounce, &on_error))
                .expect("failed to spawn persistence worker")
        };

        Self {
            store,
            adapter,
            options,
            queue,
            subscription: Some(subscription),
            worker: Some(worker),
        }
    }

    /// The name this store persists under.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// The wrapped store.
    pub fn store(&self) -> &Store<T> {
        &self.store
    }

    /// Get the current state value.
    pub fn get(&self) -> Arc<T> {
        self.store.get()
    }

    /// Read state through a closure without cloning.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        self.store.read(f)
    }

    /// Update the state by mutating a draft of the current value.
    pub fn update<F>(&self, mutator: F)
    where
        F: FnOnce(&mut Draft<T>),
    {
        self.store.update(mutator);
    }

    /// Fallible variant of [`update`](Persisted::update).
    pub fn try_update<F, E>(&self, mutator: F) -> Result<(), E>
    where
        F: FnOnce(&mut Draft<T>) -> Result<(), E>,
    {
        self.store.try_update(mutator)
    }

    /// Replace the state wholesale.
    pub fn set(&self, new_state: T) {
        self.store.set(new_state);
    }

    /// Subscribe to state changes. See [`Store::subscribe`].
    #[must_use = "dropping the subscription removes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<T>, &Arc<T>) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    /// Subscribe to a selected slice of the state. See [`Store::watch`].
    #[must_use = "dropping the subscription removes the listener"]
    pub fn watch<S, Sel, F>(&self, selector: Sel, callback: F) -> Subscription
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&T) -> S + Send + Sync + 'static,
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.store.watch(selector, callback)
    }

    /// Write any pending envelope to the adapter now.
    ///
    /// Failures are reported to the error observer and returned.
    pub fn flush(&self) -> Result<(), PersistError> {
        if let Some(payload) = self.queue.take() {
            if let Err(e) = self.adapter.write(&self.options.name, &payload) {
                let error = PersistError::Storage(e);
                report(&self.options.on_error, &error);
                return Err(error);
            }
        }
        Ok(())
    }

    /// Remove the persisted envelope and drop any pending write.
    ///
    /// The in-memory state is left untouched; the next committed transition
    /// persists again as usual.
    pub fn clear(&self) -> Result<(), PersistError> {
        self.queue.take();
        self.adapter.remove(&self.options.name)?;
        Ok(())
    }

    /// Re-run rehydration against the adapter's current contents.
    pub fn rehydrate(&self) {
        rehydrate_into(&self.store, self.adapter.as_ref(), &self.options);
    }
}

impl<T: Clone> Drop for Persisted<T> {
    fn drop(&mut self) {
        // Stop observing first so no new payloads arrive mid-shutdown,
        // then let the worker drain whatever is still pending.
        self.subscription.take();
        self.queue.shut_down();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Merge a stored envelope into the store, if one exists and is usable.
fn rehydrate_into<T>(store: &Store<T>, adapter: &dyn StorageAdapter, options: &PersistOptions<T>)
where
    T: Clone + Serialize + DeserializeOwned + 'static,
{
    let name = options.name.as_str();

    let raw = match adapter.read(name) {
        Ok(Some(raw)) => raw,
        Ok(None) => return,
        Err(e) => {
            warn!(name, error = %e, "skipping rehydration, storage read failed");
            return;
        }
    };

    let envelope = match Envelope::decode(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(name, error = %e, "discarding malformed envelope");
            return;
        }
    };

    let saved = if envelope.version == options.version {
        envelope.state
    } else if let Some(migrate) = &options.migrate {
        match migrate(envelope.version, envelope.state) {
            Some(state) => state,
            None => {
                warn!(
                    name,
                    stored = envelope.version,
                    expected = options.version,
                    "migration declined envelope"
                );
                return;
            }
        }
    } else {
        warn!(
            name,
            stored = envelope.version,
            expected = options.version,
            "discarding envelope with mismatched version"
        );
        return;
    };

    // Shallow merge: persisted fields overlay the initial state, everything
    // else keeps its default. A merge that no longer deserializes into T is
    // discarded whole, never applied partially.
    let current = store.get();
    let merged = match (serde_json::to_value(&*current), saved) {
        (Ok(Value::Object(mut base)), Value::Object(saved_fields)) => {
            for (key, value) in saved_fields {
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (Ok(_), saved) => saved,
        (Err(e), _) => {
            warn!(name, error = %e, "skipping rehydration, state is not serializable");
            return;
        }
    };

    match serde_json::from_value::<T>(merged) {
        Ok(state) => {
            debug!(name, "rehydrated persisted state");
            store.set(state);
        }
        Err(e) => {
            warn!(name, error = %e, "discarding persisted state that no longer deserializes");
        }
    }
}

/// Drain the write queue until shutdown, coalescing bursts.
fn write_back_loop(
    queue: &WriteQueue,
    adapter: &dyn StorageAdapter,
    name: &str,
    debounce: Duration,
    on_error: &Option<ErrorObserver>,
) {
    loop {
        let shutting_down = {
            let mut pending = queue.pending.lock().unwrap();
            while pending.payload.is_none() && !pending.shutdown {
                pending = queue.cvar.wait(pending).unwrap();
            }
            pending.shutdown
        };

        // Sleep through the burst so only the latest payload is written.
        if !shutting_down && !debounce.is_zero() {
            thread::sleep(debounce);
        }

        if let Some(payload) = queue.take() {
            match adapter.write(name, &payload) {
                Ok(()) => debug!(name, "persisted state written"),
                // The next committed transition queues a fresh snapshot,
                // which is the retry.
                Err(e) => report(on_error, &PersistError::Storage(e)),
            }
        }

        if shutting_down {
            break;
        }
    }
}

fn report(observer: &Option<ErrorObserver>, error: &PersistError) {
    warn!(%error, "persistence failure");
    if let Some(observer) = observer {
        observer(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::adapter::{MemoryStorage, StorageError, StorageResult};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct ShopState {
        cart: Vec<String>,
        wishlist: Vec<String>,
        banner_dismissed: bool,
    }

    impl Default for ShopState {
        fn default() -> Self {
            Self {
                cart: vec![],
                wishlist: vec![],
                banner_dismissed: false,
            }
        }
    }

    fn options(name: &str) -> PersistOptions<ShopState> {
        // A wide window keeps the worker out of the way; tests drive
        // physical writes through flush().
        PersistOptions::new(name).debounce(Duration::from_millis(500))
    }

    /// Adapter that records every write and can be switched to fail.
    struct RecordingStorage {
        inner: MemoryStorage,
        writes: Mutex<Vec<String>>,
        fail_writes: bool,
    }

    impl RecordingStorage {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                writes: Mutex::new(vec![]),
                fail_writes: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail_writes: true,
                ..Self::new()
            }
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    impl StorageAdapter for RecordingStorage {
        fn read(&self, key: &str) -> StorageResult<Option<String>> {
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &str) -> StorageResult<()> {
            if self.fail_writes {
                return Err(StorageError::Write("quota exceeded".to_string()));
            }
            self.writes.lock().unwrap().push(value.to_string());
            self.inner.write(key, value)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key)
        }
    }

    #[test]
    fn round_trip_restores_persisted_state() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());

        {
            let store = Persisted::new(ShopState::default(), Arc::clone(&adapter), options("shop"));
            store.update(|state| state.cart.push("p1".to_string()));
            store.flush().unwrap();
        }

        let restored = Persisted::new(ShopState::default(), adapter, options("shop"));
        assert_eq!(restored.get().cart, vec!["p1".to_string()]);
    }

    #[test]
    fn drop_flushes_pending_writes() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());

        {
            let store = Persisted::new(ShopState::default(), Arc::clone(&adapter), options("shop"));
            store.update(|state| state.cart.push("p1".to_string()));
            // No flush; Drop drains the queue.
        }

        let restored = Persisted::new(ShopState::default(), adapter, options("shop"));
        assert_eq!(restored.get().cart, vec!["p1".to_string()]);
    }

    #[test]
    fn partialized_fields_are_the_only_ones_restored() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        let partial_options = || {
            options("shop").partialize(|state: &ShopState| json!({ "cart": state.cart }))
        };

        {
            let store = Persisted::new(ShopState::default(), Arc::clone(&adapter), partial_options());
            store.update(|state| {
                state.cart.push("p1".to_string());
                state.banner_dismissed = true;
            });
            store.flush().unwrap();
        }

        let restored = Persisted::new(ShopState::default(), adapter, partial_options());
        assert_eq!(restored.get().cart, vec!["p1".to_string()]);
        // Excluded from the envelope, so back to its default.
        assert!(!restored.get().banner_dismissed);
    }

    #[test]
    fn version_mismatch_without_migration_is_discarded() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        adapter
            .write(
                "shop",
                &Envelope {
                    state: json!({"cart": ["stale"]}),
                    version: 0,
                }
                .encode()
                .unwrap(),
            )
            .unwrap();

        let store = Persisted::new(
            ShopState::default(),
            adapter,
            options("shop").version(1),
        );
        assert!(store.get().cart.is_empty());
    }

    #[test]
    fn migration_transforms_old_envelopes() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        adapter
            .write(
                "shop",
                &Envelope {
                    state: json!({"basket": ["p1"]}),
                    version: 0,
                }
                .encode()
                .unwrap(),
            )
            .unwrap();

        let store = Persisted::new(
            ShopState::default(),
            adapter,
            options("shop").version(1).migrate(|_from, old| {
                Some(json!({ "cart": old["basket"] }))
            }),
        );
        assert_eq!(store.get().cart, vec!["p1".to_string()]);
    }

    #[test]
    fn malformed_envelope_falls_back_to_initial_state() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        adapter.write("shop", "{ not an envelope").unwrap();

        let store = Persisted::new(ShopState::default(), adapter, options("shop"));
        assert_eq!(*store.get(), ShopState::default());
    }

    #[test]
    fn failed_writes_do_not_affect_in_memory_state() {
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = errors.clone();
        let adapter: Arc<dyn StorageAdapter> = Arc::new(RecordingStorage::failing());

        let store = Persisted::new(
            ShopState::default(),
            adapter,
            options("shop").on_error(move |_| {
                errors_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.update(|state| state.cart.push("p1".to_string()));
        assert_eq!(store.get().cart, vec!["p1".to_string()]);

        assert!(store.flush().is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rapid_updates_coalesce_into_one_write() {
        let recording = Arc::new(RecordingStorage::new());
        let adapter: Arc<dyn StorageAdapter> =
            Arc::clone(&recording) as Arc<dyn StorageAdapter>;

        let store = Persisted::new(ShopState::default(), adapter, options("shop"));
        store.update(|state| state.cart.push("p1".to_string()));
        store.update(|state| state.cart.push("p2".to_string()));
        store.flush().unwrap();

        assert_eq!(recording.write_count(), 1);
        let written = recording.writes.lock().unwrap()[0].clone();
        let envelope = Envelope::decode(&written).unwrap();
        assert_eq!(envelope.state["cart"], json!(["p1", "p2"]));
    }

    #[test]
    fn clear_removes_the_envelope() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());

        {
            let store = Persisted::new(ShopState::default(), Arc::clone(&adapter), options("shop"));
            store.update(|state| state.cart.push("p1".to_string()));
            store.flush().unwrap();
            store.clear().unwrap();
        }

        assert!(adapter.read("shop").unwrap().is_none());
        let restored = Persisted::new(ShopState::default(), adapter, options("shop"));
        assert!(restored.get().cart.is_empty());
    }

    #[test]
    fn rehydrate_picks_up_adapter_changes() {
        let adapter: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        let store = Persisted::new(ShopState::default(), Arc::clone(&adapter), options("shop"));
        assert!(store.get().cart.is_empty());

        adapter
            .write(
                "shop",
                &Envelope {
                    state: json!({"cart": ["p9"]}),
                    version: 0,
                }
                .encode()
                .unwrap(),
            )
            .unwrap();

        store.rehydrate();
        assert_eq!(store.get().cart, vec!["p9".to_string()]);
    }
}
