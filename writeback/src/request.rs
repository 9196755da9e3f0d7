//! Out-of-band maintenance requests against an image.
//!
//! An [AsyncRequest] is a small state machine driven by [Request]: `send` issues the next step
//! (a store operation, or an immediate result via [Request::async_complete]), and every result
//! is passed to `should_complete`. When that returns true the request finishes with the result
//! passed through `filter_return_code`; otherwise the request is sent again (under a freshly
//! taken ownership lock) to issue its next step.

use crate::{
    completion::{Bridge, Callback},
    dispatcher::Mailbox,
    image::{Image, OwnerGuard},
};
use std::sync::Arc;

/// A multi-step request against an image.
pub trait AsyncRequest: Send + Sized + 'static {
    /// Issue the next step of `request`.
    fn send(request: Request<Self>, owner: &OwnerGuard<'_>);

    /// Consume the result of the last step, returning true if the request is done.
    fn should_complete(&mut self, r: i32) -> bool;

    /// Map the final result onto the code reported to the caller.
    fn filter_return_code(&self, r: i32) -> i32 {
        r
    }
}

/// Drives an [AsyncRequest] and owns the caller's completion.
pub struct Request<R> {
    inner: R,
    image: Arc<Image>,
    mailbox: Mailbox,
    on_finish: Callback,
}

impl<R: AsyncRequest> Request<R> {
    pub fn new(image: Arc<Image>, mailbox: Mailbox, inner: R, on_finish: Callback) -> Self {
        Self {
            inner,
            image,
            mailbox,
            on_finish,
        }
    }

    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Start the request. `owner` must hold the ownership lock of the request's image.
    pub fn send(self, owner: &OwnerGuard<'_>) {
        assert!(
            owner.is_for(&self.image),
            "request sent under another image's ownership lock"
        );
        R::send(self, owner);
    }

    /// Deliver the result of the current step.
    pub fn complete(mut self, r: i32) {
        if self.inner.should_complete(r) {
            let r = self.inner.filter_return_code(r);
            self.on_finish.complete(r);
            return;
        }
        let image = self.image.clone();
        let owner = image.owner_read();
        R::send(self, &owner);
    }

    /// Deliver `r` as the result of the current step from the dispatcher.
    pub fn async_complete(self, r: i32) {
        let mailbox = self.mailbox.clone();
        mailbox.queue(Callback::new(move |r| self.complete(r)), r);
    }

    /// Wrap the request so that a store operation's result completes the current step.
    pub fn callback(self) -> Bridge {
        Bridge::new(Callback::new(move |r| self.complete(r)))
    }
}
