//! Signals: synchronous, many-listener notification.
//!
//! A [`Signal<T>`] keeps an ordered list of slots and calls each of them,
//! in binding order, every time it is emitted.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use apf_core::Signal;
//!
//! struct Console {
//!     lines: AtomicUsize,
//! }
//!
//! impl Console {
//!     fn on_log(&self, _line: &String) {
//!         self.lines.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let log_event = Signal::<String>::new();
//! let console = Arc::new(Console { lines: AtomicUsize::new(0) });
//! log_event.bind(&console, Console::on_log).unwrap();
//! log_event.emit(&"signal test".to_string());
//! assert_eq!(console.lines.load(Ordering::SeqCst), 1);
//! ```
//!
//! Emission holds the signal's lock while slots run. A slot that binds to,
//! unbinds from or emits the same signal deadlocks.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Identifies one binding; returned by [`Signal::bind`] and
/// [`Signal::bind_fn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotToken(u64);

/// Returns `false` once the receiver is gone.
type Slot<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Binding<T> {
    token: SlotToken,
    receiver: Option<Weak<dyn Any + Send + Sync>>,
    method: Option<usize>,
    slot: Slot<T>,
}

impl<T> Binding<T> {
    fn is_alive(&self) -> bool {
        self.receiver
            .as_ref()
            .map_or(true, |receiver| receiver.strong_count() > 0)
    }

    fn is_receiver(&self, receiver: *const ()) -> bool {
        self.is_alive()
            && self
                .receiver
                .as_ref()
                .is_some_and(|r| r.as_ptr() as *const () == receiver)
    }
}

/// A typed event channel.
pub struct Signal<T> {
    slots: Mutex<Vec<Binding<T>>>,
    next_token: AtomicU64,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn token(&self) -> SlotToken {
        SlotToken(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind `method` on `receiver`.
    ///
    /// The receiver is held weakly: once it is dropped its bindings are
    /// skipped and pruned. Binding the same `(receiver, method)` pair twice
    /// fails with [`Error::Duplicate`].
    ///
    /// Methods are identified by address. Optimized builds may merge two
    /// methods with identical bodies into one function, which then count as
    /// the same method here. When distinct bindings matter, keep the
    /// returned [`SlotToken`] (or use [`bind_fn`](Self::bind_fn)) and unbind
    /// by token.
    pub fn bind<R>(&self, receiver: &Arc<R>, method: fn(&R, &T)) -> Result<SlotToken>
    where
        R: Send + Sync + 'static,
    {
        let identity = receiver_identity(receiver);
        let method_id = method as usize;

        let mut slots = self.slots.lock();
        slots.retain(Binding::is_alive);
        if slots
            .iter()
            .any(|b| b.method == Some(method_id) && b.is_receiver(identity))
        {
            return Err(Error::Duplicate(format!(
                "slot already bound for receiver {:p}",
                identity
            )));
        }

        let weak = Arc::downgrade(receiver);
        let erased: Weak<dyn Any + Send + Sync> = weak.clone();
        let token = self.token();
        slots.push(Binding {
            token,
            receiver: Some(erased),
            method: Some(method_id),
            slot: Box::new(move |payload| match weak.upgrade() {
                Some(receiver) => {
                    method(&receiver, payload);
                    true
                }
                None => false,
            }),
        });
        Ok(token)
    }

    /// Bind an anonymous slot. Only its token identifies it.
    pub fn bind_fn<F>(&self, slot: F) -> SlotToken
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let token = self.token();
        self.slots.lock().push(Binding {
            token,
            receiver: None,
            method: None,
            slot: Box::new(move |payload| {
                slot(payload);
                true
            }),
        });
        token
    }

    /// Remove the binding with `token`.
    pub fn unbind(&self, token: SlotToken) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter().position(|b| b.token == token) {
            Some(index) => {
                slots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove the binding of `method` on `receiver`.
    ///
    /// Uses the same address identity as [`bind`](Self::bind).
    pub fn unbind_method<R>(&self, receiver: &Arc<R>, method: fn(&R, &T)) -> bool
    where
        R: Send + Sync + 'static,
    {
        let identity = receiver_identity(receiver);
        let method_id = method as usize;
        let mut slots = self.slots.lock();
        match slots
            .iter()
            .position(|b| b.method == Some(method_id) && b.is_receiver(identity))
        {
            Some(index) => {
                slots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove every binding of `receiver`. Returns how many were removed.
    pub fn unbind_receiver<R>(&self, receiver: &Arc<R>) -> usize
    where
        R: Send + Sync + 'static,
    {
        let identity = receiver_identity(receiver);
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|b| !b.is_receiver(identity));
        before - slots.len()
    }

    /// Call every bound slot in binding order. Returns how many ran.
    pub fn emit(&self, payload: &T) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|binding| (binding.slot)(payload));
        let delivered = slots.len();
        if delivered < before {
            tracing::trace!("Pruned {} slots with dropped receivers", before - delivered);
        }
        delivered
    }

    /// Number of bindings, including ones whose receiver was dropped but
    /// not yet pruned.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Remove every binding.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

fn receiver_identity<R>(receiver: &Arc<R>) -> *const () {
    Arc::as_ptr(receiver) as *const ()
}
