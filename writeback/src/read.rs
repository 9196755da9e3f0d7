use crate::{completion::OnComplete, image::Image, ordering::State};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Completion of a read: delivers the result with both the ownership lock (shared) and the
/// coordination lock held.
pub(crate) struct ReadCompletion<C> {
    image: Arc<Image>,
    state: Arc<Mutex<State<C>>>,
    on_finish: OnComplete<C>,
}

impl<C> ReadCompletion<C> {
    pub(crate) fn new(
        image: Arc<Image>,
        state: Arc<Mutex<State<C>>>,
        on_finish: OnComplete<C>,
    ) -> Self {
        Self {
            image,
            state,
            on_finish,
        }
    }

    pub(crate) fn complete(self, r: i32) {
        trace!(r, "read completing");
        {
            // Same order as every other path that takes both
            let _owner = self.image.owner_read();
            let mut state = self.state.lock().unwrap();
            (self.on_finish)(&mut state.cache, r);
        }
        trace!("read finished");
    }
}
