// Queue types crossing between the I/O loop and the caller.
//
// `SessionEvent` flows worker → caller (decoded inbound traffic and
// lifecycle notices); `OutboundMessage` flows caller → worker (encoded RPC
// bytes plus routing intent). These two queues are the only crossing point
// between the threads in threaded mode, so everything here is `Send` and
// carries no sockets or callbacks.
//
// The dispatcher's ordering rule lives here too: client-event messages
// (connect / disconnect / host migration) are processed strictly before
// application RPCs received in the same batch.

use alderwire_protocol::control::{ClientIdAssignment, PingRequest, SpawnNotice};
use alderwire_protocol::rpc::RpcHeader;
use alderwire_protocol::types::{ClientId, NetworkId, Transport};

/// Routing intent for an outbound message on a server/relay endpoint.
/// Client endpoints have a single link and ignore this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipients {
    /// Every connected client.
    All,
    /// Every connected client except one (typically the original caller).
    AllExcept(ClientId),
    /// One specific client.
    One(ClientId),
}

/// An encoded message queued for transmission.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Full message bytes: RPC header plus encoded arguments or control
    /// payload.
    pub payload: Vec<u8>,
    pub transport: Transport,
    pub recipients: Recipients,
}

/// Decoded inbound traffic and lifecycle notices, in delivery order.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// A peer was admitted.
    ClientConnected(ClientId),
    /// This endpoint was admitted.
    LocalConnected(ClientIdAssignment),
    /// A peer left.
    ClientDisconnected(ClientId),
    /// The authority moved.
    HostMigrated(ClientId),
    /// This endpoint lost its connection (socket failure or shutdown).
    LocalDisconnected,
    /// A ping completed (`failed` set when it timed out).
    PingResolved(PingRequest),
    /// The authority spawned an object; `owner` is the authority's id.
    Spawned { notice: SpawnNotice, owner: ClientId },
    /// The authority despawned an object.
    Despawned(NetworkId),
    /// An application RPC. Arguments stay encoded until the caller-side
    /// dispatcher decodes them against the protocol registry.
    Rpc { header: RpcHeader, args: Vec<u8> },
}

impl SessionEvent {
    /// Client-event messages are dispatched before application RPCs of the
    /// same batch.
    pub fn is_client_event(&self) -> bool {
        !matches!(self, SessionEvent::Rpc { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alderwire_protocol::types::RpcId;

    fn rpc_event(id: u32) -> SessionEvent {
        SessionEvent::Rpc {
            header: RpcHeader {
                rpc_id: RpcId(id),
                caller: ClientId(1),
                callee: ClientId::NONE,
                target: NetworkId::NONE,
            },
            args: Vec::new(),
        }
    }

    #[test]
    fn rpcs_are_the_only_non_client_events() {
        assert!(!rpc_event(30).is_client_event());
        assert!(SessionEvent::ClientConnected(ClientId(2)).is_client_event());
        assert!(SessionEvent::ClientDisconnected(ClientId(3)).is_client_event());
        assert!(SessionEvent::HostMigrated(ClientId(2)).is_client_event());
        assert_eq!(
            match rpc_event(31) {
                SessionEvent::Rpc { header, .. } => header.rpc_id,
                _ => RpcId::NONE,
            },
            RpcId(31)
        );
    }
}
