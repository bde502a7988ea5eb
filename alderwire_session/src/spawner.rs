// Replicated-object spawner.
//
// The authority endpoint allocates object ids from a monotonic counter and
// announces spawns/despawns as control messages; every other endpoint
// mirrors the object table from those notices. A type registry maps the
// one-byte type tag to a proxy factory: tag 0 is reserved, tag 1 is the
// plain base object, user tags start at 2.
//
// Counter reconciliation: a client that observes a spawn with an id at or
// above its own counter advances to `id + 1`, so if it is later promoted
// to authority its allocations cannot collide with existing objects.
//
// The pending-lookup list holds callbacks keyed by object id that fire as
// soon as the object appears; it is drained once per dispatch pass.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use alderwire_protocol::control::SpawnNotice;
use alderwire_protocol::rpc::ArgValue;
use alderwire_protocol::types::{ClientId, NetworkId, RpcId};

use crate::error::{Result, SessionError};

/// Reserved type tag; never a valid object type.
pub const TAG_NONE: u8 = 0;
/// The plain base object type.
pub const TAG_BASE_OBJECT: u8 = 1;
/// First tag available to user types.
pub const TAG_USER_START: u8 = 2;

/// Shared state of one replicated object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkObject {
    pub id: NetworkId,
    pub type_tag: u8,
    /// The endpoint that spawned the object (the authority at spawn time).
    pub owner: ClientId,
    pub is_active: bool,
}

/// Capability set of an object proxy. Implementations hold the
/// application-side state of the object.
pub trait NetworkBehavior {
    fn on_spawn(&mut self, _object: &NetworkObject) {}

    fn on_despawn(&mut self, _object: &NetworkObject) {}

    /// An RPC addressed to this object. Errors are logged and swallowed by
    /// the dispatcher.
    fn on_rpc(&mut self, _object: &NetworkObject, _rpc_id: RpcId, _args: &[ArgValue]) -> Result<()> {
        Ok(())
    }
}

/// The no-op behavior behind [`TAG_BASE_OBJECT`].
struct BaseObject;

impl NetworkBehavior for BaseObject {}

pub type BehaviorFactory = Box<dyn Fn() -> Box<dyn NetworkBehavior>>;

/// Maps type tags to proxy factories.
pub struct TypeRegistry {
    factories: HashMap<u8, BehaviorFactory>,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        let mut factories: HashMap<u8, BehaviorFactory> = HashMap::new();
        factories.insert(TAG_BASE_OBJECT, Box::new(|| Box::new(BaseObject)));
        TypeRegistry { factories }
    }

    /// Register a user type. Tags below [`TAG_USER_START`] are reserved.
    pub fn register(&mut self, tag: u8, factory: BehaviorFactory) -> Result<()> {
        if tag < TAG_USER_START {
            return Err(SessionError::Config(format!(
                "type tag {tag} is reserved"
            )));
        }
        if self.factories.contains_key(&tag) {
            return Err(SessionError::Config(format!(
                "type tag {tag} already registered"
            )));
        }
        self.factories.insert(tag, factory);
        Ok(())
    }

    pub fn construct(&self, tag: u8) -> Option<Box<dyn NetworkBehavior>> {
        self.factories.get(&tag).map(|f| f())
    }

    pub fn knows(&self, tag: u8) -> bool {
        self.factories.contains_key(&tag)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct SpawnedObject {
    object: NetworkObject,
    behavior: Box<dyn NetworkBehavior>,
}

type LookupCallback = Box<dyn FnOnce(&NetworkObject)>;

/// Object table plus id allocation. Iteration order is id order, which is
/// also spawn-issue order thanks to the monotonic counter — late-join
/// replay depends on that.
pub struct Spawner {
    objects: BTreeMap<NetworkId, SpawnedObject>,
    next_id: u32,
    types: TypeRegistry,
    pending_lookups: Vec<(NetworkId, LookupCallback)>,
}

impl Spawner {
    pub fn new(types: TypeRegistry) -> Spawner {
        Spawner {
            objects: BTreeMap::new(),
            next_id: 1,
            types,
            pending_lookups: Vec::new(),
        }
    }

    /// Authority path: allocate an id, construct the proxy, produce the
    /// notice to broadcast.
    pub fn spawn_local(&mut self, type_tag: u8, owner: ClientId) -> Result<SpawnNotice> {
        let mut behavior = self
            .types
            .construct(type_tag)
            .ok_or_else(|| SessionError::Config(format!("unknown type tag {type_tag}")))?;
        let id = NetworkId(self.next_id);
        self.next_id += 1;
        let object = NetworkObject {
            id,
            type_tag,
            owner,
            is_active: true,
        };
        behavior.on_spawn(&object);
        self.objects.insert(id, SpawnedObject { object, behavior });
        debug!(id = id.0, tag = type_tag, "spawned object");
        Ok(SpawnNotice { type_tag, id })
    }

    /// Authority path: deactivate and remove an object.
    pub fn despawn_local(&mut self, id: NetworkId) -> Result<()> {
        let mut entry = self
            .objects
            .remove(&id)
            .ok_or(SessionError::UnknownObject(id.0))?;
        entry.object.is_active = false;
        entry.behavior.on_despawn(&entry.object);
        debug!(id = id.0, "despawned object");
        Ok(())
    }

    /// Mirror a spawn announced by the authority. Advances the local
    /// counter past the announced id.
    pub fn apply_remote_spawn(&mut self, notice: SpawnNotice, owner: ClientId) {
        if notice.id.0 >= self.next_id {
            self.next_id = notice.id.0 + 1;
        }
        if self.objects.contains_key(&notice.id) {
            debug!(id = notice.id.0, "duplicate spawn notice ignored");
            return;
        }
        let Some(mut behavior) = self.types.construct(notice.type_tag) else {
            warn!(tag = notice.type_tag, "spawn notice with unknown type tag");
            return;
        };
        let object = NetworkObject {
            id: notice.id,
            type_tag: notice.type_tag,
            owner,
            is_active: true,
        };
        behavior.on_spawn(&object);
        self.objects
            .insert(notice.id, SpawnedObject { object, behavior });
    }

    /// Mirror a despawn announced by the authority.
    pub fn apply_remote_despawn(&mut self, id: NetworkId) {
        match self.objects.remove(&id) {
            Some(mut entry) => {
                entry.object.is_active = false;
                entry.behavior.on_despawn(&entry.object);
            }
            None => debug!(id = id.0, "despawn notice for unknown object"),
        }
    }

    /// Spawn notices for every live object, in issue order — the late-join
    /// replay sent to a freshly admitted client.
    pub fn replay(&self) -> Vec<SpawnNotice> {
        self.objects
            .values()
            .map(|entry| SpawnNotice {
                type_tag: entry.object.type_tag,
                id: entry.object.id,
            })
            .collect()
    }

    /// Reassign ownership of every object held by `from` — the optional
    /// engine-layer policy after a host migration.
    pub fn transfer_ownership(&mut self, from: ClientId, to: ClientId) -> usize {
        let mut moved = 0;
        for entry in self.objects.values_mut() {
            if entry.object.owner == from {
                entry.object.owner = to;
                moved += 1;
            }
        }
        moved
    }

    /// Dispatch an RPC addressed to an object. Returns whether the object
    /// existed; handler errors are logged and swallowed.
    pub fn dispatch_rpc(&mut self, id: NetworkId, rpc_id: RpcId, args: &[ArgValue]) -> bool {
        match self.objects.get_mut(&id) {
            Some(entry) => {
                if let Err(error) = entry.behavior.on_rpc(&entry.object, rpc_id, args) {
                    warn!(rpc = rpc_id.0, object = id.0, %error, "object rpc handler failed");
                }
                true
            }
            None => false,
        }
    }

    pub fn object(&self, id: NetworkId) -> Option<&NetworkObject> {
        self.objects.get(&id).map(|entry| &entry.object)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn next_id(&self) -> u32 {
        self.next_id
    }

    /// Queue a callback that fires once the object with `id` exists.
    pub fn lookup(&mut self, id: NetworkId, callback: LookupCallback) {
        self.pending_lookups.push((id, callback));
    }

    /// Fire and remove every lookup whose object has appeared. Called once
    /// per dispatch pass.
    pub fn drain_lookups(&mut self) {
        let mut remaining = Vec::new();
        for (id, callback) in self.pending_lookups.drain(..) {
            match self.objects.get(&id) {
                Some(entry) => callback(&entry.object),
                None => remaining.push((id, callback)),
            }
        }
        self.pending_lookups = remaining;
    }
}
