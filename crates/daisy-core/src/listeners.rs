//! Listener registry holding weak references
//!
//! Registering a listener never extends its lifetime. Once the last strong
//! reference is dropped the listener is skipped and pruned on the next call.

use std::sync::{Arc, Weak};

/// Handle returned on registration, used to remove the listener later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct ListenerRegistry<T: ?Sized> {
    next_id: u64,
    entries: Vec<(ListenerId, Weak<T>)>,
}

impl<T: ?Sized> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<T: ?Sized> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: &Arc<T>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, Arc::downgrade(listener)));
        id
    }

    /// Returns true if the listener was registered
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of listeners still alive
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|(_, w)| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upgraded copies of every live listener
    ///
    /// Dispatch goes through the snapshot so listeners may add or remove
    /// registrations while being called.
    pub fn snapshot(&mut self) -> Vec<Arc<T>> {
        self.entries.retain(|(_, w)| w.strong_count() > 0);
        self.entries.iter().filter_map(|(_, w)| w.upgrade()).collect()
    }

    pub fn for_each(&mut self, mut f: impl FnMut(&T)) {
        for listener in self.snapshot() {
            f(&listener);
        }
    }
}
