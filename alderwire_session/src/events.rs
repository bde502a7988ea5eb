// Connection event callbacks.
//
// Subscribers are held in ordered lists with explicit subscribe/unsubscribe
// — the runtime walks them in registration order when an event fires. All
// callbacks run on the caller's thread, inside `execute_queue`; the worker
// thread never touches them, which is why they need no `Send` bound.

use alderwire_protocol::control::{ClientIdAssignment, PingRequest, SpawnNotice};
use alderwire_protocol::types::{ClientId, NetworkId};

/// Token returned by `subscribe`, used to unsubscribe later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// An ordered list of callbacks for one event type.
pub struct Callbacks<T> {
    next: u64,
    entries: Vec<(SubscriberId, Box<dyn FnMut(&T)>)>,
}

impl<T> Callbacks<T> {
    pub fn new() -> Callbacks<T> {
        Callbacks {
            next: 0,
            entries: Vec::new(),
        }
    }

    pub fn subscribe<F: FnMut(&T) + 'static>(&mut self, callback: F) -> SubscriberId {
        let id = SubscriberId(self.next);
        self.next += 1;
        self.entries.push((id, Box::new(callback)));
        id
    }

    /// Remove a subscriber. Returns whether it was present.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn emit(&mut self, value: &T) {
        for (_, callback) in &mut self.entries {
            callback(value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Callbacks<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Every event surface a connection exposes. Fields are public so user code
/// can subscribe directly: `connection.events.client_connected.subscribe(…)`.
#[derive(Default)]
pub struct ConnectionEvents {
    /// A peer joined the session.
    pub client_connected: Callbacks<ClientId>,
    /// A peer left the session.
    pub client_disconnected: Callbacks<ClientId>,
    /// This endpoint was admitted and received its identity.
    pub local_connected: Callbacks<ClientIdAssignment>,
    /// This endpoint lost its connection.
    pub local_disconnected: Callbacks<()>,
    /// The authority moved to a new client. The previous authority's
    /// objects are the integration layer's to transfer.
    pub host_migration: Callbacks<ClientId>,
    /// A ping finished, successfully or by timeout.
    pub ping_resolved: Callbacks<PingRequest>,
    /// A replicated object appeared.
    pub object_spawned: Callbacks<SpawnNotice>,
    /// A replicated object was removed.
    pub object_despawned: Callbacks<NetworkId>,
}
