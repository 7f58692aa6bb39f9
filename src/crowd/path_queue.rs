//! Bounded pool of in-flight sliced path requests.
//!
//! Requests round-robin through a shared per-call iteration budget; the one
//! sliced search belongs to whichever slot the head points at, so a request
//! runs to completion before the head moves on. Completed slots stay parked
//! a couple of ticks for the requester to claim, then free themselves.

use bevy::prelude::Vec3;

use crate::mesh::{NavMesh, PolyRef};
use crate::query::{NavMeshQuery, PolyPath, SlicedState, StandardFilter};

pub const PATH_QUEUE_SLOTS: usize = 8;

/// Ticks a finished request stays claimable.
const MAX_KEEP_ALIVE: u32 = 2;

const MAX_SEARCH_NODES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathQueueHandle(pub u32);

/// Where a request currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRequestStatus {
    Pending,
    Succeeded,
    Failed,
}

enum SlotState {
    /// Waiting for its first slice.
    Queued,
    InProgress,
    Done(Result<PolyPath, ()>),
}

struct PathQuerySlot {
    handle: PathQueueHandle,
    start_ref: PolyRef,
    end_ref: PolyRef,
    start_pos: Vec3,
    end_pos: Vec3,
    filter: StandardFilter,
    state: SlotState,
    keep_alive: u32,
}

pub struct PathQueue {
    slots: Vec<Option<PathQuerySlot>>,
    queue_head: usize,
    next_handle: u32,
    query: NavMeshQuery,
    max_path_size: usize,
}

impl PathQueue {
    pub fn new(max_path_size: usize) -> Self {
        Self {
            slots: (0..PATH_QUEUE_SLOTS).map(|_| None).collect(),
            queue_head: 0,
            next_handle: 1,
            query: NavMeshQuery::new(MAX_SEARCH_NODES)
                .expect("search node budget is a positive constant"),
            max_path_size,
        }
    }

    /// Queues a request into the first free slot. `None` when saturated;
    /// callers simply retry next tick.
    pub fn request(
        &mut self,
        start_ref: PolyRef,
        end_ref: PolyRef,
        start_pos: Vec3,
        end_pos: Vec3,
        filter: StandardFilter,
    ) -> Option<PathQueueHandle> {
        let slot = self.slots.iter_mut().find(|slot| slot.is_none())?;

        let handle = PathQueueHandle(self.next_handle);
        // Handles are monotonic and never zero.
        self.next_handle = self.next_handle.checked_add(1).unwrap_or(1);

        *slot = Some(PathQuerySlot {
            handle,
            start_ref,
            end_ref,
            start_pos,
            end_pos,
            filter,
            state: SlotState::Queued,
            keep_alive: 0,
        });

        Some(handle)
    }

    /// Advances in-flight requests, spending at most `max_iters` search
    /// iterations across them.
    pub fn update(&mut self, mesh: &NavMesh, max_iters: usize) {
        let mut remaining = max_iters;

        for _ in 0..PATH_QUEUE_SLOTS {
            let index = self.queue_head % PATH_QUEUE_SLOTS;

            let Some(slot) = self.slots[index].as_mut() else {
                self.queue_head += 1;
                continue;
            };

            // Parked results age out.
            if let SlotState::Done(_) = slot.state {
                slot.keep_alive += 1;
                if slot.keep_alive > MAX_KEEP_ALIVE {
                    self.slots[index] = None;
                }
                self.queue_head += 1;
                continue;
            }

            if matches!(slot.state, SlotState::Queued) {
                match self.query.init_sliced_find_path(
                    mesh,
                    slot.start_ref,
                    slot.end_ref,
                    slot.start_pos,
                    slot.end_pos,
                ) {
                    Ok(_) => slot.state = SlotState::InProgress,
                    Err(_) => {
                        slot.state = SlotState::Done(Err(()));
                        self.queue_head += 1;
                        continue;
                    }
                }
            }

            let (state, iters) = self
                .query
                .update_sliced_find_path(mesh, &slot.filter, remaining);
            remaining = remaining.saturating_sub(iters);

            match state {
                SlicedState::Succeeded => {
                    let result = self
                        .query
                        .finalize_sliced_find_path()
                        .map(|mut path| {
                            path.polys.truncate(self.max_path_size);
                            path
                        })
                        .map_err(|_| ());
                    slot.state = SlotState::Done(result);
                }
                SlicedState::Failed | SlicedState::Idle => {
                    let _ = self.query.finalize_sliced_find_path();
                    slot.state = SlotState::Done(Err(()));
                }
                SlicedState::InProgress => {
                    // Budget ran out mid-search; resume this slot next call.
                    break;
                }
            }

            if remaining == 0 {
                break;
            }
            self.queue_head += 1;
        }
    }

    pub fn status(&self, handle: PathQueueHandle) -> Option<PathRequestStatus> {
        let slot = self.find_slot(handle)?;

        Some(match &slot.state {
            SlotState::Queued | SlotState::InProgress => PathRequestStatus::Pending,
            SlotState::Done(Ok(_)) => PathRequestStatus::Succeeded,
            SlotState::Done(Err(())) => PathRequestStatus::Failed,
        })
    }

    /// Claims a finished result, freeing the slot.
    pub fn take_result(&mut self, handle: PathQueueHandle) -> Option<PolyPath> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.handle == handle))?;

        match self.slots[index].take() {
            Some(PathQuerySlot {
                state: SlotState::Done(Ok(path)),
                ..
            }) => Some(path),
            other => {
                // Not done (or failed): put an unfinished slot back.
                if let Some(slot) = other {
                    if !matches!(slot.state, SlotState::Done(_)) {
                        self.slots[index] = Some(slot);
                    }
                }
                None
            }
        }
    }

    /// Drops a request outright; safe on unknown handles.
    pub fn cancel(&mut self, handle: PathQueueHandle) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|slot| slot.handle == handle) {
                *slot = None;
            }
        }
    }

    fn find_slot(&self, handle: PathQueueHandle) -> Option<&PathQuerySlot> {
        self.slots
            .iter()
            .flatten()
            .find(|slot| slot.handle == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::PolyFlags;

    #[test]
    fn handles_are_unique_and_nonzero() {
        let mut queue = PathQueue::new(256);

        let mut handles = Vec::new();
        for _ in 0..PATH_QUEUE_SLOTS {
            let handle = queue
                .request(
                    PolyRef(1),
                    PolyRef(2),
                    Vec3::ZERO,
                    Vec3::ONE,
                    StandardFilter::default(),
                )
                .expect("slots are free");
            assert_ne!(handle.0, 0);
            handles.push(handle);
        }

        handles.sort_by_key(|handle| handle.0);
        handles.dedup();
        assert_eq!(handles.len(), PATH_QUEUE_SLOTS);

        // Saturated.
        assert!(queue
            .request(
                PolyRef(1),
                PolyRef(2),
                Vec3::ZERO,
                Vec3::ONE,
                StandardFilter::default(),
            )
            .is_none());
    }

    #[test]
    fn cancel_frees_the_slot() {
        let mut queue = PathQueue::new(256);
        let filter = StandardFilter::with_flags(PolyFlags::ALL, PolyFlags::empty());

        let handle = queue
            .request(PolyRef(1), PolyRef(2), Vec3::ZERO, Vec3::ONE, filter)
            .unwrap();
        queue.cancel(handle);

        assert!(queue.status(handle).is_none());
        // All slots free again.
        for _ in 0..PATH_QUEUE_SLOTS {
            assert!(queue
                .request(
                    PolyRef(1),
                    PolyRef(2),
                    Vec3::ZERO,
                    Vec3::ONE,
                    StandardFilter::default(),
                )
                .is_some());
        }
    }
}
