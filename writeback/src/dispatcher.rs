//! Deliver completions off the submitting thread.
//!
//! [Dispatcher] owns a single worker thread that runs queued completions strictly in the order
//! they were queued, one at a time. It is used wherever a completion is known before any I/O
//! is issued (e.g. a read of an object that cannot exist) so that completions are never
//! delivered on the thread that submitted the operation.
//!
//! Dropping the [Dispatcher] closes its queue, runs every completion already queued, and joins
//! the worker.

use crate::{completion::Callback, Error};
use futures::{channel::mpsc, executor::block_on, StreamExt as _};
use std::thread::{self, JoinHandle};
use tracing::{trace, warn};

/// A completion waiting to be delivered.
struct Task {
    callback: Callback,
    r: i32,
}

/// Handle used to queue completions on a [Dispatcher].
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::UnboundedSender<Task>,
}

impl Mailbox {
    /// Queue `callback` to be completed with `r` on the dispatcher's worker.
    ///
    /// If the dispatcher has already stopped, the completion is delivered on the calling
    /// thread instead (it is never dropped).
    pub fn queue(&self, callback: Callback, r: i32) {
        if let Err(err) = self.sender.unbounded_send(Task { callback, r }) {
            warn!(r, "dispatcher stopped, completing inline");
            let task = err.into_inner();
            task.callback.complete(task.r);
        }
    }
}

/// A single-worker, strictly sequential completion queue.
pub struct Dispatcher {
    mailbox: Mailbox,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Start a dispatcher whose worker thread is called `name`.
    pub fn new(name: &str) -> Result<Self, Error> {
        let (sender, receiver) = mpsc::unbounded();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || block_on(run(receiver)))?;
        Ok(Self {
            mailbox: Mailbox { sender },
            worker: Some(worker),
        })
    }

    /// Get a [Mailbox] that queues onto this dispatcher.
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Queue `callback` to be completed with `r`.
    pub fn queue(&self, callback: Callback, r: i32) {
        self.mailbox.queue(callback, r);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.mailbox.sender.close_channel();
        let Some(worker) = self.worker.take() else {
            return;
        };

        // The last reference to the owning layer may be released by a queued completion
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!("dispatcher worker panicked");
        }
    }
}

/// Deliver queued completions until every [Mailbox] is dropped or the queue is closed.
async fn run(mut receiver: mpsc::UnboundedReceiver<Task>) {
    while let Some(Task { callback, r }) = receiver.next().await {
        trace!(r, "dispatching completion");
        callback.complete(r);
    }
    trace!("dispatcher drained");
}
