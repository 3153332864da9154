// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Integer-keyed session registry.

use std::collections::HashMap;

/// Anything the registry can file under its session id.
pub trait Session {
    fn session_id(&self) -> u32;
}

/// Lookup table of application sessions. Not consumed by the scheduler
/// core; connection drivers use it to route replies to waiters.
pub struct SessionRegistry<S> {
    map: HashMap<u32, S>,
}

impl<S: Session> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a session, returning the displaced one if the id was
    /// already present.
    pub fn insert(&mut self, session: S) -> Option<S> {
        self.map.insert(session.session_id(), session)
    }

    pub fn get(&self, id: u32) -> Option<&S> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut S> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<S> {
        self.map.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<S: Session> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
