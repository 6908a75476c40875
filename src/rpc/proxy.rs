use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::SyncMutex;

/// Wire encoding of a proxied callback position.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct CallbackSlot(pub u8);

impl CallbackSlot {
    /// Slot value encoding the absent callback.
    pub const NONE: Self = Self(0xFF);
}

impl From<CallbackSlot> for u8 {
    #[inline]
    fn from(s: CallbackSlot) -> Self {
        s.0
    }
}

/// Registry mapping callback identity to a small wire slot. One core
/// registers callbacks and sends their slots; the other resolves slots back
/// to whatever it registered under the same positions.
///
/// Entries are compared by `Arc` pointer identity, so registering the same
/// `Arc` twice yields the same slot. The pool is bounded; running out means
/// the build allocated too few slots, which is a configuration error rather
/// than a runtime condition, so it panics.
pub struct Proxy<T: ?Sized> {
    slots: SyncMutex<Vec<Arc<T>>>,
    cap: usize,
}

impl<T: ?Sized> Proxy<T> {
    /// Creates a registry with at most `cap` slots.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        assert!(cap < usize::from(CallbackSlot::NONE.0));
        Self {
            slots: SyncMutex::new(Vec::new()),
            cap,
        }
    }

    /// Returns the slot for `cb`, registering it on first sight.
    ///
    /// # Panics
    ///
    /// Panics if the slot pool is exhausted.
    pub fn slot_of(&self, cb: &Arc<T>) -> CallbackSlot {
        let mut slots = self.slots.lock();
        if let Some(i) = slots.iter().position(|s| Arc::ptr_eq(s, cb)) {
            #[allow(clippy::cast_possible_truncation)]
            return CallbackSlot(i as u8);
        }
        assert!(slots.len() < self.cap, "callback slot pool exhausted");
        slots.push(Arc::clone(cb));
        #[allow(clippy::cast_possible_truncation)]
        CallbackSlot(slots.len() as u8 - 1)
    }

    /// Resolves a received slot.
    #[must_use]
    pub fn resolve(&self, s: CallbackSlot) -> Option<Arc<T>> {
        self.slots.lock().get(usize::from(s.0)).map(Arc::clone)
    }
}

impl<T: ?Sized> Debug for Proxy<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("len", &self.slots.lock().len())
            .field("cap", &self.cap)
            .finish()
    }
}
