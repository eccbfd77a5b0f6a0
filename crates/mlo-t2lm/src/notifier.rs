//! Link update handler registry.
//!
//! Handlers are told the established per-TID link map whenever it changes.

use std::fmt;
use std::sync::Arc;

use tracing::debug;
use wlan_types::MAX_NUM_TIDS;

use crate::error::{Result, T2lmError};
use crate::store::MappingStore;

/// Callback receiving the vdev id and the established per-TID link bitmaps.
pub type LinkUpdateHandler = Arc<dyn Fn(u8, &[u16; MAX_NUM_TIDS]) + Send + Sync>;

/// Fixed-capacity registry; indices stay stable until unregistered.
pub struct HandlerRegistry {
    handlers: Vec<Option<LinkUpdateHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("capacity", &self.capacity())
            .field("registered", &self.len())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates a registry with `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            handlers: vec![None; capacity],
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.handlers.len()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.iter().filter(|h| h.is_some()).count()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `handler` in the first free slot and returns its index.
    pub fn register(&mut self, handler: LinkUpdateHandler) -> Result<usize> {
        let index = self
            .handlers
            .iter()
            .position(Option::is_none)
            .ok_or(T2lmError::RegistryFull(self.capacity()))?;
        self.handlers[index] = Some(handler);
        debug!(index, "Registered link update handler");
        Ok(index)
    }

    /// Clears the slot at `index`.
    pub fn unregister(&mut self, index: usize) -> Result<()> {
        let slot = self
            .handlers
            .get_mut(index)
            .ok_or(T2lmError::InvalidHandlerIndex(index))?;
        *slot = None;
        debug!(index, "Unregistered link update handler");
        Ok(())
    }

    /// Captures what [`HandlerRegistry::notify`] would deliver, so that the
    /// caller can run the handlers after dropping its lock.
    pub fn prepare(&self, store: &MappingStore) -> Option<LinkUpdate> {
        let established = store.established()?;
        Some(LinkUpdate {
            link_map: established.raw_link_map(),
            handlers: self.handlers.iter().flatten().cloned().collect(),
        })
    }

    /// Calls every registered handler, in index order, with the link map of
    /// slot 0. Nothing happens while the store is empty.
    pub fn notify(&self, vdev_id: u8, store: &MappingStore) {
        if let Some(update) = self.prepare(store) {
            update.deliver(vdev_id);
        }
    }
}

/// Link map and handlers captured for delivery.
pub struct LinkUpdate {
    link_map: [u16; MAX_NUM_TIDS],
    handlers: Vec<LinkUpdateHandler>,
}

impl fmt::Debug for LinkUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkUpdate")
            .field("link_map", &self.link_map)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl LinkUpdate {
    /// Link map to be delivered.
    pub fn link_map(&self) -> &[u16; MAX_NUM_TIDS] {
        &self.link_map
    }

    /// Runs the captured handlers.
    pub fn deliver(self, vdev_id: u8) {
        for handler in &self.handlers {
            handler(vdev_id, &self.link_map);
        }
    }
}
