// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Caches whose value is a pure function of another cache's value.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{Activator, Epoch, Shared, Version};
use crate::{CancelHandle, ReactiveCache};

type Transform<U, W> = dyn Fn(&U) -> W + Send + Sync;

struct Derived<U, W> {
    source: ReactiveCache<U>,
    transform: Arc<Transform<U, W>>,
    // Newest source version already reflected in the derived value.
    applied: Arc<Mutex<Version>>,
}

impl<U, W> Activator<W> for Derived<U, W>
where
    U: Clone + Send + 'static,
    W: Clone + Send + 'static,
{
    fn activate(&self, cache: &Arc<Shared<W>>, epoch: Epoch) -> Option<Vec<CancelHandle>> {
        // After a reset the source's replay must be applied again.
        if cache.current_value().is_none() {
            *self.applied.lock() = 0;
        }

        let target = Arc::downgrade(cache);
        let transform = Arc::clone(&self.transform);
        let applied = Arc::clone(&self.applied);
        let handle = self.source.shared().subscribe_with(Box::new(move |_, value, version| {
            {
                let mut applied = applied.lock();
                if *applied >= version {
                    return;
                }
                *applied = version;
            }
            if let Some(target) = target.upgrade() {
                target.replace(epoch, transform(&value));
            }
        }));

        Some(vec![handle])
    }
}

pub(crate) fn derive<U, W>(source: &ReactiveCache<U>, transform: impl Fn(&U) -> W + Send + Sync + 'static) -> ReactiveCache<W>
where
    U: Clone + Send + 'static,
    W: Clone + Send + 'static,
{
    let snapshot = source.shared().snapshot();
    let applied = snapshot.as_ref().map_or(0, |(_, version)| *version);
    let initial = snapshot.map(|(value, _)| transform(&value));

    let derived = Derived {
        source: source.clone(),
        transform: Arc::new(transform),
        applied: Arc::new(Mutex::new(applied)),
    };

    let shared = Shared::new(source.name(), source.shared().queue().clone(), Some(Box::new(derived)), initial, false);
    ReactiveCache::from_shared(Arc::new(shared))
}
