use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Shared substructure within a state value.
///
/// Fields wrapped in `Shared` are cloned by pointer when the surrounding
/// state is copied, so substructure the mutator never touches stays
/// reference-identical across versions. Mutate a shared field inside a
/// draft with [`Arc::make_mut`].
pub type Shared<T> = Arc<T>;

/// A single-use mutable view over an immutable state value.
///
/// A draft mirrors the base value it was created from. Reads go through
/// [`Deref`] and never copy; the first mutable access copies the base into
/// a private allocation, leaving the base untouched no matter what the
/// mutator does afterwards. Drafts only exist inside [`produce`] and
/// [`try_produce`] calls and are consumed when they return.
pub struct Draft<T: Clone> {
    next: Arc<T>,
}

impl<T: Clone> Draft<T> {
    fn new(base: &Arc<T>) -> Self {
        Self {
            next: Arc::clone(base),
        }
    }

    fn into_inner(self) -> Arc<T> {
        self.next
    }
}

impl<T: Clone> Deref for Draft<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.next
    }
}

impl<T: Clone> DerefMut for Draft<T> {
    fn deref_mut(&mut self) -> &mut T {
        // The base still holds a reference, so the first mutable access
        // copies; later accesses in the same draft are free.
        Arc::make_mut(&mut self.next)
    }
}

/// Produce a new state value by mutating a draft of `base`.
///
/// The mutator edits the draft as if it were the state itself; `produce`
/// returns a new value reflecting those edits. Substructure behind
/// [`Shared`] pointers that the mutator did not touch is reference-identical
/// to the corresponding substructure of `base`. A mutator that never takes
/// a mutable borrow yields `base` itself, so pointer equality downstream
/// can tell "nothing changed" apart from a real transition.
///
/// # Example
///
/// ```
/// use satchel::produce;
/// use std::sync::Arc;
///
/// #[derive(Clone)]
/// struct Cart {
///     items: Vec<String>,
/// }
///
/// let base = Arc::new(Cart { items: vec![] });
/// let next = produce(&base, |draft| {
///     draft.items.push("p1".to_string());
/// });
///
/// assert_eq!(next.items.len(), 1);
/// assert!(base.items.is_empty());
/// ```
pub fn produce<T, F>(base: &Arc<T>, mutator: F) -> Arc<T>
where
    T: Clone,
    F: FnOnce(&mut Draft<T>),
{
    let mut draft = Draft::new(base);
    mutator(&mut draft);
    draft.into_inner()
}

/// Fallible variant of [`produce`].
///
/// If the mutator returns an error, the draft is discarded, `base` is left
/// untouched, and the error is handed back to the caller.
pub fn try_produce<T, F, E>(base: &Arc<T>, mutator: F) -> Result<Arc<T>, E>
where
    T: Clone,
    F: FnOnce(&mut Draft<T>) -> Result<(), E>,
{
    let mut draft = Draft::new(base);
    mutator(&mut draft)?;
    Ok(draft.into_inner())
}
