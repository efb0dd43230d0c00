// The resource pool: generation-checked handles for buffers and
// images, reference counted, with destruction deferred until the
// frame that last could have touched the resource has retired.
//
// Grounded on the `Pool<D, K, T>` / `AliasedObject` shape in
// ennis-autograph-ng's backend_gl/src/pool.rs (the slot-map-backed
// aliasing pool), using the real `slotmap` crate for the generation
// bookkeeping rather than hand-rolling it — slotmap's key versioning
// is exactly the "slot, generation" pair this design needs. The deferred
// kill-list draining is grounded on thundr's `DeletionQueue`
// (deletion_queue.rs), adapted from timeline-semaphore points to the
// plain frame-index retire points the frame pacer here uses.

use slotmap::SlotMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{GraphError, Result};

slotmap::new_key_type! {
    /// Opaque handle to a pooled image: a (slot, generation) pair.
    pub struct ImageId;
    /// Opaque handle to a pooled buffer: a (slot, generation) pair.
    pub struct BufferId;
}

struct Slot<T> {
    resource: Arc<T>,
    refcount: usize,
}

struct PoolInner<K: slotmap::Key, T> {
    slots: SlotMap<K, Slot<T>>,
    /// `remap(a, b)` records here that lookups of `a` should resolve
    /// through to `b` instead. Chains are flattened on insert so a
    /// lookup is always a single hop.
    aliases: HashMap<K, K>,
    /// Resources whose last reference was dropped, bucketed by the
    /// frame index at which that happened. Drained by `collect` once
    /// that frame's fence has signalled N frames later.
    kill_list: VecDeque<(u64, Arc<T>)>,
    shutdown: bool,
}

impl<K: slotmap::Key, T> PoolInner<K, T> {
    fn resolve(&self, id: K) -> K {
        self.aliases.get(&id).copied().unwrap_or(id)
    }
}

/// A reference-counted, generation-checked store of GPU resources.
/// One instance backs all `ImageId`s, another all `BufferId`s (kept
/// separate rather than behind one generic map with a type tag --
/// the two id flavors are never interchangeable).
pub struct ResourcePool<K: slotmap::Key, T> {
    inner: Mutex<PoolInner<K, T>>,
    /// The frame index the orchestrator is currently recording.
    /// `ResourcePtr::drop` reads this to tag the kill-list entry, so
    /// `collect()` knows which fence to wait behind.
    current_frame: AtomicU64,
}

impl<K: slotmap::Key + Copy, T> ResourcePool<K, T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                slots: SlotMap::with_key(),
                aliases: HashMap::new(),
                kill_list: VecDeque::new(),
                shutdown: false,
            }),
            current_frame: AtomicU64::new(0),
        })
    }

    /// Called by the frame pacer once per `submit()` so that
    /// resources released during this frame are tagged with the
    /// frame that last could have referenced them.
    pub fn set_frame_index(&self, frame_index: u64) {
        self.current_frame.store(frame_index, Ordering::Relaxed);
    }

    /// Registers a newly created resource and returns the first
    /// `ResourcePtr` to it.
    pub fn register(self: &Arc<Self>, resource: T) -> ResourcePtr<K, T> {
        let resource = Arc::new(resource);
        let mut inner = self.inner.lock().unwrap();
        let id = inner.slots.insert(Slot {
            resource: resource.clone(),
            refcount: 1,
        });
        drop(inner);

        ResourcePtr {
            id,
            pool: self.clone(),
            resource,
        }
    }

    /// Validates `id`, bumps its refcount, and returns the backing
    /// resource. Fails with `StaleHandle` if the generation has moved
    /// on, or `PoolShutdown` after `clear_all`.
    pub fn acquire(self: &Arc<Self>, id: K) -> Result<ResourcePtr<K, T>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return Err(GraphError::PoolShutdown);
        }
        let resolved = inner.resolve(id);
        let slot = inner.slots.get_mut(resolved).ok_or(GraphError::StaleHandle)?;
        slot.refcount += 1;
        let resource = slot.resource.clone();
        drop(inner);

        Ok(ResourcePtr {
            id,
            pool: self.clone(),
            resource,
        })
    }

    /// Decrements `id`'s refcount; at zero the slot is freed (bumping
    /// its generation) and the resource moved to the kill-list tagged
    /// with the pool's current frame index for later `collect`.
    fn release(&self, id: K) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        let resolved = inner.resolve(id);
        let slot = match inner.slots.get_mut(resolved) {
            Some(s) => s,
            // already torn down by a racing clear_all; nothing to do
            None => return,
        };
        slot.refcount -= 1;
        if slot.refcount == 0 {
            let slot = inner.slots.remove(resolved).unwrap();
            let frame = self.current_frame.load(Ordering::Relaxed);
            inner.kill_list.push_back((frame, slot.resource));
        }
    }

    /// Resolves `id` to its backing resource without touching the
    /// refcount. Used by the record-time lookups in `RenderResources`
    /// (`get_image`/`get_buffer`/`get_view`), which are called many
    /// times per frame against resources the graph already owns a
    /// `ResourcePtr` for and so have no ownership stake of their own to
    /// take.
    pub fn get(&self, id: K) -> Result<Arc<T>> {
        let inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return Err(GraphError::PoolShutdown);
        }
        let resolved = inner.resolve(id);
        let slot = inner.slots.get(resolved).ok_or(GraphError::StaleHandle)?;
        Ok(slot.resource.clone())
    }

    /// Redirects lookups of `src` to `dst`'s backing resource.
    /// Outstanding ids derived from `src` (views, subresource ids)
    /// keep working, now against the aliased resource.
    pub fn remap(&self, src: K, dst: K) {
        let mut inner = self.inner.lock().unwrap();
        let resolved_dst = inner.resolve(dst);
        inner.aliases.insert(src, resolved_dst);
    }

    /// Removes a previously installed alias, restoring `src`'s own
    /// identity. Used by the orchestrator to undo the temporary
    /// backbuffer remap after a frame that called `prepare_backbuffer`.
    pub fn unmap(&self, src: K) {
        self.inner.lock().unwrap().aliases.remove(&src);
    }

    /// Drops every kill-list entry tagged with a frame index at or
    /// before `retired_frame`. Called once per `submit()`.
    pub fn collect(&self, retired_frame: u64) {
        let mut inner = self.inner.lock().unwrap();
        while matches!(inner.kill_list.front(), Some((f, _)) if *f <= retired_frame) {
            inner.kill_list.pop_front();
        }
    }

    /// Synchronous teardown: drops every resource regardless of
    /// refcount. Further pool operations fail with `PoolShutdown`.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        inner.slots.clear();
        inner.aliases.clear();
        inner.kill_list.clear();
    }

    fn resolved(&self, id: K) -> K {
        self.inner.lock().unwrap().resolve(id)
    }
}

/// An owning reference to a pooled resource. Cloning bumps the pool's
/// refcount for the id; dropping the last clone releases it, which
/// may push the resource onto the pool's kill-list rather than
/// dropping it immediately.
pub struct ResourcePtr<K: slotmap::Key + Copy, T> {
    id: K,
    pool: Arc<ResourcePool<K, T>>,
    resource: Arc<T>,
}

impl<K: slotmap::Key + Copy, T> ResourcePtr<K, T> {
    pub fn id(&self) -> K {
        self.id
    }

    /// Resolves through any `remap` alias chain currently installed
    /// for this id. Views keyed on the original id use this to find
    /// the resource they should actually address.
    pub fn resolved_id(&self) -> K {
        self.pool.resolved(self.id)
    }
}

impl<K: slotmap::Key + Copy, T> std::ops::Deref for ResourcePtr<K, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.resource
    }
}

impl<K: slotmap::Key + Copy, T> Clone for ResourcePtr<K, T> {
    fn clone(&self) -> Self {
        // acquire() re-validates and bumps the pool refcount; we
        // already hold a live Arc<T> so we can skip redoing the alias
        // lookup and just reuse it.
        let mut inner = self.pool.inner.lock().unwrap();
        let resolved = inner.resolve(self.id);
        if let Some(slot) = inner.slots.get_mut(resolved) {
            slot.refcount += 1;
        }
        drop(inner);

        Self {
            id: self.id,
            pool: self.pool.clone(),
            resource: self.resource.clone(),
        }
    }
}

impl<K: slotmap::Key + Copy, T> Drop for ResourcePtr<K, T> {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
