// Control-message vocabulary for the reserved RPC id range.
//
// Two kinds of endpoint traffic exist: user RPCs (ids >= 30, table-driven
// argument lists) and control messages (ids < 30, fixed payload structs
// defined here). `ControlMessage` is the decoded form the session runtime
// works with; `encode`/`decode` map it onto the common RPC header plus a
// payload in `Encodable` form.
//
// Control messages always travel on the stream transport, except the
// admission request which is a datagram (the server learns the client's UDP
// port from it).

use crate::encode::{get_bool, get_i64, get_u32, get_u8, Encodable};
use crate::error::{Result, WireError};
use crate::rpc::RpcHeader;
use crate::types::{ClientId, NetworkId, RpcId, StringId};

/// Identity grant sent once to a freshly admitted client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIdAssignment {
    pub assigned_id: ClientId,
    /// The session authority: [`ClientId::NONE`] for server sessions, the
    /// host's id for relayed sessions.
    pub authority_id: ClientId,
    /// Random nonzero token the client must echo in every packet header.
    pub client_secret: u32,
    pub max_clients: u32,
}

impl Encodable for ClientIdAssignment {
    fn encoded_len(&self) -> usize {
        16
    }

    fn write(&self, out: &mut Vec<u8>) {
        self.assigned_id.write(out);
        self.authority_id.write(out);
        out.extend_from_slice(&self.client_secret.to_le_bytes());
        out.extend_from_slice(&self.max_clients.to_le_bytes());
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        Ok(ClientIdAssignment {
            assigned_id: ClientId::read(input)?,
            authority_id: ClientId::read(input)?,
            client_secret: get_u32(input)?,
            max_clients: get_u32(input)?,
        })
    }
}

/// Admission request datagram payload. Must exactly match the server's
/// configured identifiers to be admitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub app_id: StringId,
    pub session_id: StringId,
    pub as_host: bool,
}

impl Encodable for ConnectionRequest {
    fn encoded_len(&self) -> usize {
        self.app_id.encoded_len() + self.session_id.encoded_len() + 1
    }

    fn write(&self, out: &mut Vec<u8>) {
        self.app_id.write(out);
        self.session_id.write(out);
        self.as_host.write(out);
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        Ok(ConnectionRequest {
            app_id: StringId::read(input)?,
            session_id: StringId::read(input)?,
            as_host: get_bool(input)?,
        })
    }
}

/// Spawn notice for one replicated object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpawnNotice {
    pub type_tag: u8,
    pub id: NetworkId,
}

impl Encodable for SpawnNotice {
    fn encoded_len(&self) -> usize {
        5
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.type_tag);
        self.id.write(out);
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        Ok(SpawnNotice {
            type_tag: get_u8(input)?,
            id: NetworkId::read(input)?,
        })
    }
}

/// State of one latency probe. The source fills `send_time_ms`, the target
/// stamps `receive_time_ms` and echoes the request back, and the source
/// stamps `response_time_ms` on return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingRequest {
    pub source: ClientId,
    pub target: ClientId,
    pub send_time_ms: i64,
    pub receive_time_ms: i64,
    pub response_time_ms: i64,
    pub resolved: bool,
    pub failed: bool,
}

impl PingRequest {
    pub fn new(source: ClientId, target: ClientId, send_time_ms: i64) -> PingRequest {
        PingRequest {
            source,
            target,
            send_time_ms,
            receive_time_ms: 0,
            response_time_ms: 0,
            resolved: false,
            failed: false,
        }
    }

    /// Round-trip time in milliseconds; meaningful once resolved without
    /// failure.
    pub fn ping_ms(&self) -> i64 {
        self.response_time_ms - self.send_time_ms
    }
}

impl Encodable for PingRequest {
    fn encoded_len(&self) -> usize {
        4 + 4 + 8 + 8 + 8 + 1 + 1
    }

    fn write(&self, out: &mut Vec<u8>) {
        self.source.write(out);
        self.target.write(out);
        out.extend_from_slice(&self.send_time_ms.to_le_bytes());
        out.extend_from_slice(&self.receive_time_ms.to_le_bytes());
        out.extend_from_slice(&self.response_time_ms.to_le_bytes());
        self.resolved.write(out);
        self.failed.write(out);
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        Ok(PingRequest {
            source: ClientId::read(input)?,
            target: ClientId::read(input)?,
            send_time_ms: get_i64(input)?,
            receive_time_ms: get_i64(input)?,
            response_time_ms: get_i64(input)?,
            resolved: get_bool(input)?,
            failed: get_bool(input)?,
        })
    }
}

/// Decoded control message.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    /// A client joined the session.
    ClientConnected(ClientId),
    /// Identity grant for the receiving client.
    LocalClientConnected(ClientIdAssignment),
    /// A client left the session.
    ClientDisconnected(ClientId),
    /// A replicated object was spawned by the authority.
    Spawn(SpawnNotice),
    /// A replicated object was despawned by the authority.
    Despawn(NetworkId),
    /// Admission request (datagram only).
    ConnectionRequest(ConnectionRequest),
    /// The authority moved; also sent point-to-point to correct a caller
    /// whose RPC failed the permission check.
    HostMigration(ClientId),
    /// Latency probe, request or echo leg depending on `resolved`.
    Ping(PingRequest),
}

impl ControlMessage {
    pub fn rpc_id(&self) -> RpcId {
        match self {
            ControlMessage::ClientConnected(_) => RpcId::CLIENT_CONNECTED,
            ControlMessage::LocalClientConnected(_) => RpcId::LOCAL_CLIENT_CONNECTED,
            ControlMessage::ClientDisconnected(_) => RpcId::CLIENT_DISCONNECTED,
            ControlMessage::Spawn(_) => RpcId::OBJECT_SPAWN,
            ControlMessage::Despawn(_) => RpcId::OBJECT_DESPAWN,
            ControlMessage::ConnectionRequest(_) => RpcId::CONNECTION_REQUEST,
            ControlMessage::HostMigration(_) => RpcId::HOST_MIGRATION,
            ControlMessage::Ping(_) => RpcId::PING,
        }
    }

    /// Encode the full message: control RPC header plus payload.
    pub fn encode(&self, caller: ClientId, callee: ClientId) -> Vec<u8> {
        let header = RpcHeader::control(self.rpc_id(), caller, callee);
        let mut out = Vec::with_capacity(header.encoded_len() + 24);
        header.write(&mut out);
        match self {
            ControlMessage::ClientConnected(id) => id.write(&mut out),
            ControlMessage::LocalClientConnected(assignment) => assignment.write(&mut out),
            ControlMessage::ClientDisconnected(id) => id.write(&mut out),
            ControlMessage::Spawn(notice) => notice.write(&mut out),
            ControlMessage::Despawn(id) => id.write(&mut out),
            ControlMessage::ConnectionRequest(request) => request.write(&mut out),
            ControlMessage::HostMigration(id) => id.write(&mut out),
            ControlMessage::Ping(request) => request.write(&mut out),
        }
        out
    }

    /// Decode the payload of a control message whose header has already
    /// been read.
    pub fn decode(header: &RpcHeader, input: &mut &[u8]) -> Result<ControlMessage> {
        match header.rpc_id {
            RpcId::CLIENT_CONNECTED => Ok(ControlMessage::ClientConnected(ClientId::read(input)?)),
            RpcId::LOCAL_CLIENT_CONNECTED => Ok(ControlMessage::LocalClientConnected(
                ClientIdAssignment::read(input)?,
            )),
            RpcId::CLIENT_DISCONNECTED => {
                Ok(ControlMessage::ClientDisconnected(ClientId::read(input)?))
            }
            RpcId::OBJECT_SPAWN => Ok(ControlMessage::Spawn(SpawnNotice::read(input)?)),
            RpcId::OBJECT_DESPAWN => Ok(ControlMessage::Despawn(NetworkId::read(input)?)),
            RpcId::CONNECTION_REQUEST => Ok(ControlMessage::ConnectionRequest(
                ConnectionRequest::read(input)?,
            )),
            RpcId::HOST_MIGRATION => Ok(ControlMessage::HostMigration(ClientId::read(input)?)),
            RpcId::PING => Ok(ControlMessage::Ping(PingRequest::read(input)?)),
            other => Err(WireError::BadHeader(if other == RpcId::NONE {
                "control rpc id 0"
            } else {
                "unknown control rpc id"
            })),
        }
    }
}
