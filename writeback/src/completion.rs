//! Single-shot completions and the bridge from store-native completion tokens.
//!
//! Every stage of an operation owns the handle of the stage after it and consumes it exactly
//! once. Within the crate, stages are the variants of [Completion]. At the boundary with
//! collaborators (the object store, the journal, the dispatcher) they are erased into a
//! [Callback], and the store receives a [Bridge] that translates its native completion token
//! into a result code.

use crate::{journal::JournaledWrite, ordering::OrderedWrite, read::ReadCompletion};
use std::fmt;

/// Completion handed to the caller of a read or write.
///
/// It is invoked with the caller's cache state (the coordination lock is held for the duration
/// of the call) and the result code of the operation. It must not call back into the
/// [crate::Writeback] it was registered with.
pub type OnComplete<C> = Box<dyn FnOnce(&mut C, i32) + Send>;

/// A completion token produced by an object store.
pub trait AioCompletion {
    /// The result code of the operation the token belongs to.
    fn return_value(&self) -> i32;
}

impl AioCompletion for i32 {
    fn return_value(&self) -> i32 {
        *self
    }
}

/// A type-erased completion that is invoked exactly once with a result code.
pub struct Callback(Box<dyn FnOnce(i32) + Send>);

impl Callback {
    pub fn new(f: impl FnOnce(i32) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Consume the callback, delivering `r`.
    pub fn complete(self, r: i32) {
        (self.0)(r)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

/// Translates the completion of a store operation into the local completion it was
/// registered with.
///
/// This is the only place where the store's notification model meets local completions.
#[derive(Debug)]
pub struct Bridge(Callback);

impl Bridge {
    pub fn new(callback: Callback) -> Self {
        Self(callback)
    }

    /// Retrieve the result code from `token` and complete the local handle with it.
    pub fn complete<T: AioCompletion + ?Sized>(self, token: &T) {
        self.0.complete(token.return_value())
    }
}

/// Stages a result code can be delivered to.
pub(crate) enum Completion<C> {
    /// Deliver a read result under the ownership and coordination locks.
    Read(ReadCompletion<C>),
    /// Mark a write done and drain its object's queue.
    Ordered(OrderedWrite<C>),
    /// Gate a write on its journal transaction.
    Journaled(JournaledWrite<C>),
}

impl<C: Send + 'static> Completion<C> {
    pub(crate) fn complete(self, r: i32) {
        match self {
            Completion::Read(read) => read.complete(r),
            Completion::Ordered(write) => write.complete(r),
            Completion::Journaled(write) => write.complete(r),
        }
    }
}

impl<C: Send + 'static> From<Completion<C>> for Callback {
    fn from(completion: Completion<C>) -> Self {
        Callback::new(move |r| completion.complete(r))
    }
}

impl<C: Send + 'static> From<Completion<C>> for Bridge {
    fn from(completion: Completion<C>) -> Self {
        Bridge::new(completion.into())
    }
}
