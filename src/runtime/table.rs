//! Shared runtime map.
//!
//! Both call-driven operations (spawn, terminate) and background
//! reconciliation write to the same map. All state changes go through
//! [`RuntimeTable::transition`], which enforces the state machine, so the two
//! writers can interleave freely without ever moving a runtime out of a
//! terminal state. Readers take a read lock and receive cloned, complete
//! entries.

use super::{AgentRuntime, EventBus, RuntimeEvent, RuntimeId, RuntimeState};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A runtime plus provider-private data.
#[derive(Debug, Clone)]
pub struct RuntimeEntry<T> {
    pub runtime: AgentRuntime,
    pub data: T,
}

/// Runtime id → entry map with state-machine-checked transitions.
#[derive(Debug)]
pub struct RuntimeTable<T> {
    entries: RwLock<HashMap<RuntimeId, RuntimeEntry<T>>>,
    events: EventBus,
}

impl<T: Clone> RuntimeTable<T> {
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RuntimeId, RuntimeEntry<T>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RuntimeId, RuntimeEntry<T>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a new entry. Fails if the id is already tracked.
    pub fn insert(&self, runtime: AgentRuntime, data: T) -> Result<()> {
        self.insert_bounded(runtime, data, None)
    }

    /// Inserts a new entry unless `limit` non-terminal runtimes are already
    /// tracked.
    ///
    /// The count and the insert happen under one write lock, so concurrent
    /// spawns cannot both take the last slot.
    pub fn insert_bounded(&self, runtime: AgentRuntime, data: T, limit: Option<u32>) -> Result<()> {
        let mut entries = self.write();
        if let Some(limit) = limit {
            let live = entries
                .values()
                .filter(|e| !e.runtime.state.is_terminal())
                .count();
            if live >= limit as usize {
                return Err(Error::ResourceExhausted(format!(
                    "{live} of {limit} allowed agents already running"
                )));
            }
        }
        if entries.contains_key(&runtime.id) {
            return Err(Error::Internal(format!("runtime {} already tracked", runtime.id)));
        }
        entries.insert(runtime.id.clone(), RuntimeEntry { runtime, data });
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &RuntimeId) -> Option<AgentRuntime> {
        self.read().get(id).map(|e| e.runtime.clone())
    }

    #[must_use]
    pub fn entry(&self, id: &RuntimeId) -> Option<RuntimeEntry<T>> {
        self.read().get(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &RuntimeId) -> bool {
        self.read().contains_key(id)
    }

    /// Returns the entry if the runtime exists and is running.
    ///
    /// Unknown ids are `NotFound`; any other state is an execution error.
    pub fn require_running(&self, id: &RuntimeId) -> Result<RuntimeEntry<T>> {
        let entry = self
            .entry(id)
            .ok_or_else(|| Error::NotFound(format!("runtime {id}")))?;
        if entry.runtime.state != RuntimeState::Running {
            return Err(Error::execution(
                id,
                format!("runtime is {}, expected running", entry.runtime.state),
            ));
        }
        Ok(entry)
    }

    /// Moves a runtime to `to`, emitting `StateChange` on success.
    ///
    /// Returns the previous state, or `None` when the runtime was already in
    /// `to`. Illegal moves (including any move out of a terminal state)
    /// return `InvalidState` and leave the entry untouched.
    pub fn transition(&self, id: &RuntimeId, to: RuntimeState) -> Result<Option<RuntimeState>> {
        let from = {
            let mut entries = self.write();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("runtime {id}")))?;
            let from = entry.runtime.state;
            if from == to {
                return Ok(None);
            }
            if !from.can_transition_to(to) {
                return Err(Error::InvalidState {
                    id: id.to_string(),
                    state: from.to_string(),
                    expected: format!("a state that may move to {to}"),
                });
            }
            entry.runtime.state = to;
            entry.runtime.touch();
            from
        };

        tracing::debug!(runtime = %id, %from, %to, "state change");
        self.events.emit(RuntimeEvent::StateChange {
            runtime_id: id.clone(),
            from,
            to,
        });
        Ok(Some(from))
    }

    /// Applies `f` to the runtime record in place.
    pub fn update<F>(&self, id: &RuntimeId, f: F) -> bool
    where
        F: FnOnce(&mut AgentRuntime),
    {
        match self.write().get_mut(id) {
            Some(entry) => {
                f(&mut entry.runtime);
                true
            }
            None => false,
        }
    }

    /// Removes an entry; terminated runtimes keep no tombstone.
    pub fn remove(&self, id: &RuntimeId) -> Option<RuntimeEntry<T>> {
        self.write().remove(id)
    }

    /// Snapshot of all tracked runtimes.
    #[must_use]
    pub fn list(&self) -> Vec<AgentRuntime> {
        let mut runtimes: Vec<AgentRuntime> =
            self.read().values().map(|e| e.runtime.clone()).collect();
        runtimes.sort_by(|a, b| a.id.cmp(&b.id));
        runtimes
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<RuntimeEntry<T>> {
        self.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
