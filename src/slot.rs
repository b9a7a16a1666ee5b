//! Shared typed cells for guard and action state.
//!
//! Guards are plain functions over the current event; anything else they
//! need to observe lives in a [`Slot`] they capture by clone. The same
//! cells work for actions and hooks that record or accumulate.

use std::sync::Arc;

use parking_lot::Mutex;

/// A cloneable, lock-guarded cell of user data.
///
/// ```
/// use gearwork::Slot;
///
/// let speed = Slot::new(0.0_f32);
/// let for_guard = speed.clone();
/// let guard = move |_event: &u32| Ok(for_guard.get() < 10.0);
/// # let _: &dyn Fn(&u32) -> Result<bool, gearwork::Error> = &guard;
/// speed.set(25.0);
/// ```
pub struct Slot<T> {
    cell: Arc<Mutex<T>>,
}

impl<T> Slot<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Arc::new(Mutex::new(value)),
        }
    }

    /// Replaces the value.
    pub fn set(&self, value: T) {
        *self.cell.lock() = value;
    }

    /// Runs `f` with exclusive access to the value.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.cell.lock())
    }
}

impl<T: Clone> Slot<T> {
    /// A copy of the current value.
    pub fn get(&self) -> T {
        self.cell.lock().clone()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Default> Default for Slot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
