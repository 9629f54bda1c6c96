//! Units of work.
//!
//! A unit of work is an atomic batch of map, message, enqueue, and dequeue
//! actions. The serial writer commits each batch with one pass over the
//! journal followed by one atomic index batch; on crash, recovery replays a
//! prefix of the journal, so either the whole unit is visible or none of it
//! is.

use longshore_types::{MapEntryRecord, MessageRecord, QueueEntryRecord};

/// Callback fired once a unit of work is committed (and, when the store is
/// configured `sync`, fsynced).
pub type CompletionListener = Box<dyn FnOnce() + Send>;

/// One message's worth of actions inside a unit of work.
#[derive(Debug, Default)]
pub struct MessageAction {
    /// Message to store, if this action introduces one.
    pub message: Option<MessageRecord>,
    /// Entries to place on queues. When an enqueue references the message
    /// added by this action, its locator is stamped at commit; an enqueue
    /// referencing an earlier message may carry a locator resolved from the
    /// message's shared cell, or none at all to fall back to an index
    /// lookup.
    pub enqueues: Vec<QueueEntryRecord>,
    /// Entries to remove from queues.
    pub dequeues: Vec<QueueEntryRecord>,
}

impl MessageAction {
    /// Action storing `message` with no placements yet.
    pub fn store(message: MessageRecord) -> Self {
        Self {
            message: Some(message),
            ..Self::default()
        }
    }
}

/// An atomic batch of actions presented to the store.
#[derive(Default)]
pub struct UnitOfWork {
    /// Ordered user-map mutations; an absent value deletes the key.
    pub map_actions: Vec<MapEntryRecord>,
    /// Per-message actions, committed in order after the map actions.
    pub actions: Vec<MessageAction>,
    /// Completion listener. Its presence marks the unit as needing
    /// durability: the commit fsyncs the journal before firing it.
    pub listener: Option<CompletionListener>,
}

impl UnitOfWork {
    /// Empty unit of work.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a user-map upsert.
    pub fn map_put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.map_actions.push(MapEntryRecord {
            key: key.into(),
            value: Some(value.into()),
        });
        self
    }

    /// Stage a user-map delete.
    pub fn map_remove(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.map_actions.push(MapEntryRecord {
            key: key.into(),
            value: None,
        });
        self
    }

    /// Stage a message action.
    pub fn push_action(&mut self, action: MessageAction) -> &mut Self {
        self.actions.push(action);
        self
    }

    /// Attach a completion listener, marking the unit as syncing.
    pub fn on_complete(&mut self, listener: impl FnOnce() + Send + 'static) -> &mut Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Whether committing this unit must fsync the journal.
    pub fn wants_sync(&self) -> bool {
        self.listener.is_some()
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("map_actions", &self.map_actions.len())
            .field("actions", &self.actions.len())
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_stages_in_order() {
        let mut uow = UnitOfWork::new();
        uow.map_put("a", "1").map_remove("b");
        assert_eq!(uow.map_actions.len(), 2);
        assert!(uow.map_actions[0].value.is_some());
        assert!(uow.map_actions[1].value.is_none());
        assert!(!uow.wants_sync());

        uow.on_complete(|| {});
        assert!(uow.wants_sync());
    }
}
