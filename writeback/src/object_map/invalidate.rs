use crate::{
    image::{features, image_flags, OwnerGuard},
    request::{AsyncRequest, Request},
    HEAD_SNAP,
};
use tracing::{debug, error};

/// Mark the object map of a revision invalid, in memory and (when permitted) on disk.
///
/// The on-disk flag is only updated by the exclusive-lock owner unless `force` is set (or the
/// image has no exclusive lock). Failures are logged but never reported to the caller: once
/// the in-memory flag is set the image already stops trusting the map.
pub struct InvalidateRequest {
    snap_id: u64,
    force: bool,
}

impl InvalidateRequest {
    pub fn new(snap_id: u64, force: bool) -> Self {
        Self { snap_id, force }
    }
}

impl AsyncRequest for InvalidateRequest {
    fn send(request: Request<Self>, owner: &OwnerGuard<'_>) {
        let image = request.image().clone();
        let snap_id = request.inner().snap_id;

        let mut snaps = image.snaps_mut();
        let current = match snaps.flags(snap_id) {
            Ok(current) => current,
            Err(err) => {
                drop(snaps);
                request.async_complete(err.errno());
                return;
            }
        };
        if current & image_flags::OBJECT_MAP_INVALID != 0 {
            drop(snaps);
            request.async_complete(0);
            return;
        }

        error!(snap_id, "invalidating object map in-memory");
        let mut flags = image_flags::OBJECT_MAP_INVALID;
        if image.test_features(features::FAST_DIFF) {
            flags |= image_flags::FAST_DIFF_INVALID;
        }
        let updated = snaps.update_flags(snap_id, flags, true);
        drop(snaps);
        if let Err(err) = updated {
            request.async_complete(err.errno());
            return;
        }

        // Only the lock owner may update the on-disk flags of the head revision
        if !request.inner().force
            && snap_id == HEAD_SNAP
            && image.test_features(features::EXCLUSIVE_LOCK)
            && !owner.is_lock_owner()
        {
            request.async_complete(-libc::EROFS);
            return;
        }

        error!(snap_id, "invalidating object map on-disk");
        let oid = image.header_oid();
        if let Err(err) = image
            .store()
            .aio_update_flags(&oid, snap_id, flags, flags, request.callback())
        {
            panic!("unable to submit object map invalidation: {err}");
        }
    }

    fn should_complete(&mut self, r: i32) -> bool {
        if r < 0 {
            error!(snap_id = self.snap_id, r, "failed to invalidate object map");
        } else {
            debug!(snap_id = self.snap_id, r, "invalidated object map");
        }
        true
    }

    fn filter_return_code(&self, _r: i32) -> i32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        completion::Callback,
        dispatcher::Dispatcher,
        image::{Image, SnapInfo},
        mocks::{self, Op},
    };
    use commonware_macros::test_traced;
    use futures::{channel::oneshot, executor::block_on};
    use std::sync::Arc;

    struct Harness {
        store: Arc<mocks::Store>,
        image: Arc<Image>,
        dispatcher: Dispatcher,
    }

    fn harness(features: u64) -> Harness {
        let store = Arc::new(mocks::Store::default());
        let mut cfg = mocks::config();
        cfg.features = features;
        let image = Arc::new(mocks::image_with_store(cfg, store.clone()));
        Harness {
            store,
            image,
            dispatcher: Dispatcher::new("test-invalidate").unwrap(),
        }
    }

    fn invalidate(
        harness: &Harness,
        snap_id: u64,
        force: bool,
    ) -> oneshot::Receiver<i32> {
        let (sender, receiver) = oneshot::channel();
        let request = Request::new(
            harness.image.clone(),
            harness.dispatcher.mailbox(),
            InvalidateRequest::new(snap_id, force),
            Callback::new(move |r| sender.send(r).unwrap()),
        );
        let owner = harness.image.owner_read();
        request.send(&owner);
        receiver
    }

    #[test_traced]
    fn test_invalidates_in_memory_and_on_disk() {
        let harness = harness(features::EXCLUSIVE_LOCK | features::FAST_DIFF);
        harness.image.acquire_lock();
        let receiver = invalidate(&harness, HEAD_SNAP, false);

        let expected = image_flags::OBJECT_MAP_INVALID | image_flags::FAST_DIFF_INVALID;
        assert_eq!(harness.image.snaps().flags(HEAD_SNAP).unwrap(), expected);
        let submitted = harness.store.submitted();
        assert_eq!(submitted.len(), 1);
        let Op::UpdateFlags {
            oid,
            snap_id,
            flags,
            mask,
        } = &submitted[0]
        else {
            panic!("unexpected op: {:?}", submitted[0]);
        };
        assert_eq!(oid, "rbd_header.test");
        assert_eq!(*snap_id, HEAD_SNAP);
        assert_eq!(*flags, expected);
        assert_eq!(*mask, expected);

        // Errors updating the header are swallowed
        harness.store.complete_next(-libc::EIO);
        assert_eq!(block_on(receiver).unwrap(), 0);
    }

    #[test_traced]
    fn test_already_invalid_skips_update() {
        let harness = harness(0);
        harness
            .image
            .snaps_mut()
            .update_flags(HEAD_SNAP, image_flags::OBJECT_MAP_INVALID, true)
            .unwrap();
        let receiver = invalidate(&harness, HEAD_SNAP, false);
        assert_eq!(block_on(receiver).unwrap(), 0);
        assert!(harness.store.submitted().is_empty());
    }

    #[test_traced]
    fn test_missing_snapshot_is_not_reported() {
        let harness = harness(0);
        let receiver = invalidate(&harness, 7, false);
        assert_eq!(block_on(receiver).unwrap(), 0);
        assert!(harness.store.submitted().is_empty());
    }

    #[test_traced]
    fn test_non_owner_only_invalidates_in_memory() {
        let harness = harness(features::EXCLUSIVE_LOCK);
        let receiver = invalidate(&harness, HEAD_SNAP, false);
        assert_eq!(block_on(receiver).unwrap(), 0);
        assert!(harness.store.submitted().is_empty());
        assert_eq!(
            harness.image.snaps().flags(HEAD_SNAP).unwrap(),
            image_flags::OBJECT_MAP_INVALID
        );
    }

    #[test_traced]
    fn test_force_updates_on_disk_without_ownership() {
        let harness = harness(features::EXCLUSIVE_LOCK);
        let receiver = invalidate(&harness, HEAD_SNAP, true);
        assert_eq!(harness.store.in_flight(), 1);
        harness.store.complete_next(0);
        assert_eq!(block_on(receiver).unwrap(), 0);
    }

    #[test_traced]
    fn test_snapshot_invalidation_ignores_ownership() {
        let harness = harness(features::EXCLUSIVE_LOCK);
        harness.image.snaps_mut().add(3, SnapInfo::default());
        let receiver = invalidate(&harness, 3, false);
        assert_eq!(
            harness.image.snaps().flags(3).unwrap(),
            image_flags::OBJECT_MAP_INVALID
        );
        assert_eq!(harness.image.snaps().flags(HEAD_SNAP).unwrap(), 0);
        harness.store.complete_next(0);
        assert_eq!(block_on(receiver).unwrap(), 0);
    }
}
