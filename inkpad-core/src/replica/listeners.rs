//! Update observers for a replicated document.
//!
//! Listeners are invoked synchronously, in registration order, after every
//! applied delta. The table is snapshotted before dispatch, so a listener
//! may subscribe or drop subscriptions (its own included) while an event is
//! being delivered. A listener dropped mid-dispatch may still see the event
//! in flight; one added mid-dispatch first sees the next event.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Where an applied delta came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by [`super::ReplicatedDocument::apply_local_edit`].
    Local,
    /// Merged from a peer or the server.
    Remote,
    /// Content rewrite from a restored version.
    Restore,
}

impl UpdateOrigin {
    /// Local and restore deltas must reach peers; remote ones already have.
    pub fn should_forward(self) -> bool {
        match self {
            UpdateOrigin::Local | UpdateOrigin::Restore => true,
            UpdateOrigin::Remote => false,
        }
    }
}

/// Payload handed to update listeners.
#[derive(Debug, Clone, Copy)]
pub struct UpdateEvent<'a> {
    pub origin: UpdateOrigin,
    /// v1-encoded delta exactly as applied.
    pub update: &'a [u8],
}

type Listener = Arc<dyn Fn(&UpdateEvent<'_>) + Send + Sync>;

#[derive(Default)]
struct ListenerTable {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

fn lock(table: &Mutex<ListenerTable>) -> MutexGuard<'_, ListenerTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    table: Arc<Mutex<ListenerTable>>,
}

impl ListenerRegistry {
    pub(crate) fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&UpdateEvent<'_>) + Send + Sync + 'static,
    {
        let mut table = lock(&self.table);
        let id = table.next_id;
        table.next_id += 1;
        table.entries.push((id, Arc::new(listener)));
        Subscription {
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    pub(crate) fn emit(&self, event: &UpdateEvent<'_>) {
        let snapshot: Vec<Listener> = lock(&self.table)
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }
}

/// Handle for a registered listener. Dropping it unregisters the listener.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    id: u64,
    table: Weak<Mutex<ListenerTable>>,
}

impl Subscription {
    /// Unregister now. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            lock(&table).entries.retain(|(id, _)| *id != self.id);
        }
    }
}
