// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use super::{CenterReduce, ReduceError};

static GROUPS: Lazy<Mutex<HashMap<String, Weak<GroupState>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct GroupState {
    inner: Mutex<GroupInner>,
    condvar: Condvar,
}

impl GroupState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(GroupInner::default()),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, GroupInner>, ReduceError> {
        self.inner.lock().map_err(|_| ReduceError::Poisoned)
    }
}

#[derive(Debug, Default)]
struct GroupInner {
    expected: usize,
    arrived: usize,
    generation: u64,
    // Only ever moves forward; a worker that starts the next round must not
    // hide a finished round from peers that have not woken up yet.
    ready_generation: u64,
    buffer: Vec<f32>,
    // Failure of the round that is still collecting arrivals.
    pending: Option<ReduceError>,
    // Outcome of the last closed round. The next round cannot close before
    // every waiter of this one has read it.
    result: Vec<f32>,
    failure: Option<ReduceError>,
    connected: HashSet<usize>,
}

/// In-process all-reduce group. Each worker joins under its own rank; every
/// reduce blocks until all `world_size` ranks have contributed.
#[derive(Debug)]
pub struct RendezvousReduce {
    group: Arc<GroupState>,
    group_id: String,
    rank: usize,
    world_size: usize,
}

impl RendezvousReduce {
    pub fn join(
        group: impl Into<String>,
        rank: usize,
        world_size: usize,
    ) -> Result<Self, ReduceError> {
        if world_size == 0 {
            return Err(ReduceError::EmptyWorldSize(world_size));
        }
        if rank >= world_size {
            return Err(ReduceError::RankOutOfBounds { rank, world_size });
        }
        let group_id = group.into();

        let shared = {
            let mut groups = GROUPS.lock().map_err(|_| ReduceError::Poisoned)?;
            let entry = groups.entry(group_id.clone()).or_insert_with(Weak::new);
            match entry.upgrade() {
                Some(existing) => existing,
                None => {
                    let created = Arc::new(GroupState::new());
                    *entry = Arc::downgrade(&created);
                    created
                }
            }
        };

        {
            let mut state = shared.lock()?;
            if state.expected == 0 {
                state.expected = world_size;
            } else if state.expected != world_size {
                return Err(ReduceError::WorldSizeMismatch {
                    expected: state.expected,
                    got: world_size,
                });
            }
            if !state.connected.insert(rank) {
                return Err(ReduceError::DuplicateRank { rank });
            }
        }

        Ok(Self {
            group: shared,
            group_id,
            rank,
            world_size,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

impl CenterReduce for RendezvousReduce {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buffer: &mut [f32]) -> Result<(), ReduceError> {
        let group = &self.group;
        let mut state = group.lock()?;

        if !state.connected.contains(&self.rank) {
            return Err(ReduceError::UnknownRank { rank: self.rank });
        }

        if state.arrived == 0 {
            state.generation = state.generation.wrapping_add(1);
            state.buffer.clear();
            state.buffer.resize(buffer.len(), 0.0);
            state.pending = None;
        } else if state.pending.is_none() && state.buffer.len() != buffer.len() {
            state.pending = Some(ReduceError::BufferLengthMismatch {
                expected: state.buffer.len(),
                got: buffer.len(),
            });
        }

        // A failed round keeps counting arrivals so late ranks land in it
        // instead of opening a round nobody else will join.
        if state.pending.is_none() {
            for (dst, value) in state.buffer.iter_mut().zip(buffer.iter()) {
                *dst += *value;
            }
        }
        state.arrived += 1;
        let generation = state.generation;

        if state.arrived == state.expected {
            state.failure = state.pending.take();
            if state.failure.is_none() {
                state.result = state.buffer.clone();
            }
            state.arrived = 0;
            state.ready_generation = generation;
            group.condvar.notify_all();
        } else {
            while state.ready_generation < generation {
                state = group
                    .condvar
                    .wait(state)
                    .map_err(|_| ReduceError::Poisoned)?;
            }
        }

        if let Some(error) = state.failure.clone() {
            return Err(error);
        }
        buffer.copy_from_slice(&state.result);
        Ok(())
    }
}

impl Drop for RendezvousReduce {
    fn drop(&mut self) {
        if let Ok(mut state) = self.group.inner.lock() {
            state.connected.remove(&self.rank);
            if state.connected.is_empty() {
                state.expected = 0;
                state.arrived = 0;
                state.buffer.clear();
                state.result.clear();
                state.pending = None;
                state.failure = None;
            }
        }

        // Joins upgrade under the registry lock, so the count is stable here.
        if let Ok(mut groups) = GROUPS.lock() {
            let last_member = Arc::strong_count(&self.group) == 1;
            let registered = groups
                .get(&self.group_id)
                .map(|weak| weak.ptr_eq(&Arc::downgrade(&self.group)))
                .unwrap_or(false);
            if last_member && registered {
                groups.remove(&self.group_id);
            }
        }
    }
}
