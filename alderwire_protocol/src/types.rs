// Core identifier types for the session protocol.
//
// These are lightweight newtypes shared by the wire codec and the session
// runtime. They are session-scoped identifiers, not application entity ids —
// the server or relay assigns compact integer ids to clients, and the
// authority assigns compact ids to replicated objects, for efficient wire
// representation.
//
// The zero value of each id type is reserved as "none": a `ClientId` of 0
// denotes the server/relay endpoint itself, and a `NetworkId` of 0 denotes
// the absence of a target object.

use std::fmt;

use crate::encode::{get_u32, get_u8, Encodable};
use crate::error::{Result, WireError};

/// Session-scoped client identifier. 0 is reserved for "none" (the
/// server/relay endpoint); the first minted id is 1. Ids are unique within a
/// single session run and never reused after a disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl ClientId {
    /// The reserved "no client" value, also used to address the server/relay.
    pub const NONE: ClientId = ClientId(0);

    /// First id a server or relay hands out.
    pub const FIRST: ClientId = ClientId(1);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "client(none)")
        } else {
            write!(f, "client({})", self.0)
        }
    }
}

impl Encodable for ClientId {
    fn encoded_len(&self) -> usize {
        4
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_le_bytes());
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        Ok(ClientId(get_u32(input)?))
    }
}

/// Identifier of a replicated object. 0 is reserved for "none". Allocation is
/// monotonic and owned by the authority endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u32);

impl NetworkId {
    pub const NONE: NetworkId = NetworkId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object({})", self.0)
    }
}

impl Encodable for NetworkId {
    fn encoded_len(&self) -> usize {
        4
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_le_bytes());
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        Ok(NetworkId(get_u32(input)?))
    }
}

/// RPC identifier. Ids below [`RpcId::USER_START`] are reserved for control
/// messages with fixed meanings; user-declared RPCs start at 30.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcId(pub u32);

impl RpcId {
    pub const NONE: RpcId = RpcId(0);
    /// A client joined the session (id payload).
    pub const CLIENT_CONNECTED: RpcId = RpcId(1);
    /// Sent once to a newly admitted client (assignment payload).
    pub const LOCAL_CLIENT_CONNECTED: RpcId = RpcId(2);
    /// A client left the session (id payload).
    pub const CLIENT_DISCONNECTED: RpcId = RpcId(3);
    /// A replicated object was spawned (type tag + object id payload).
    pub const OBJECT_SPAWN: RpcId = RpcId(4);
    /// A replicated object was despawned (object id payload).
    pub const OBJECT_DESPAWN: RpcId = RpcId(5);
    /// Admission request datagram (app id, session id, host flag payload).
    pub const CONNECTION_REQUEST: RpcId = RpcId(6);
    /// Authority moved to a new client (new authority id payload).
    pub const HOST_MIGRATION: RpcId = RpcId(7);
    /// Latency probe, also used for the echo leg (ping payload).
    pub const PING: RpcId = RpcId(8);
    /// First id available to user-declared RPCs.
    pub const USER_START: RpcId = RpcId(30);

    /// Control ids carry fixed meanings and are never relayed as user RPCs.
    pub fn is_control(self) -> bool {
        self.0 < Self::USER_START.0
    }
}

impl Encodable for RpcId {
    fn encoded_len(&self) -> usize {
        4
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_le_bytes());
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        Ok(RpcId(get_u32(input)?))
    }
}

/// Maximum byte length of an app or session identifier.
pub const STRING_ID_MAX: usize = 64;

/// An app or session identifier: at most 64 ASCII bytes, immutable after
/// construction, u8 length-prefixed on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StringId(String);

impl StringId {
    pub fn new(s: &str) -> Result<StringId> {
        if s.len() > STRING_ID_MAX {
            return Err(WireError::StringTooLong {
                len: s.len(),
                limit: STRING_ID_MAX,
            });
        }
        if !s.is_ascii() {
            return Err(WireError::NonAsciiIdentifier);
        }
        Ok(StringId(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Encodable for StringId {
    fn encoded_len(&self) -> usize {
        1 + self.0.len()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.0.len() as u8);
        out.extend_from_slice(self.0.as_bytes());
    }

    fn read(input: &mut &[u8]) -> Result<Self> {
        let len = get_u8(input)? as usize;
        if len > STRING_ID_MAX {
            return Err(WireError::StringTooLong {
                len,
                limit: STRING_ID_MAX,
            });
        }
        if input.len() < len {
            return Err(WireError::UnexpectedEof {
                needed: len - input.len(),
            });
        }
        let (head, rest) = input.split_at(len);
        *input = rest;
        let s = std::str::from_utf8(head).map_err(|_| WireError::InvalidUtf8)?;
        StringId::new(s)
    }
}

/// Outcome of an admission request, sent back as a 4-byte datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectionResponseCode {
    Accepted = 0,
    ServerFull = 1,
    IncorrectAppId = 2,
    HostAlreadyAssigned = 3,
    Rejected = 4,
}

impl ConnectionResponseCode {
    pub fn to_bytes(self) -> [u8; 4] {
        (self as u32).to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Result<ConnectionResponseCode> {
        match u32::from_le_bytes(bytes) {
            0 => Ok(ConnectionResponseCode::Accepted),
            1 => Ok(ConnectionResponseCode::ServerFull),
            2 => Ok(ConnectionResponseCode::IncorrectAppId),
            3 => Ok(ConnectionResponseCode::HostAlreadyAssigned),
            4 => Ok(ConnectionResponseCode::Rejected),
            other => Err(WireError::BadResponseCode(other)),
        }
    }
}

/// Which transport a message travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Reliable, ordered stream. All control messages use this.
    Stream,
    /// Best-effort datagram. May drop or reorder; never fragments.
    Datagram,
}

/// Who may call an RPC and who may be addressed by it. Enforced at send time
/// from the local view, and again on the server/relay before forwarding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcPermission {
    /// Only the authority calls; any non-authority may be addressed.
    AuthorityToClients,
    /// Any non-authority calls; only the authority is addressed.
    ClientsToAuthority,
    /// Any non-authority calls; any *other* non-authority is addressed.
    ClientsToClients,
    /// Any non-authority calls; anyone may be addressed.
    ClientsToAll,
    /// No restriction on either end.
    AnyToAll,
}

impl RpcPermission {
    /// Whether `caller` may invoke an RPC with this permission toward
    /// `callee`, given the current `authority`.
    ///
    /// A `callee` of [`ClientId::NONE`] denotes a broadcast, which is always
    /// a valid target set (the routing layer excludes the disallowed
    /// endpoints). On server sessions the authority is [`ClientId::NONE`]
    /// itself, so the authority comparison for callees only applies to
    /// concrete ids.
    pub fn allows(self, caller: ClientId, callee: ClientId, authority: ClientId) -> bool {
        let caller_is_authority = caller == authority;
        let broadcast = callee.is_none();
        let callee_is_authority = !broadcast && callee == authority;
        match self {
            RpcPermission::AuthorityToClients => {
                caller_is_authority && (broadcast || !callee_is_authority)
            }
            RpcPermission::ClientsToAuthority => {
                !caller_is_authority && (broadcast || callee_is_authority)
            }
            RpcPermission::ClientsToClients => {
                !caller_is_authority
                    && callee != caller
                    && (broadcast || !callee_is_authority)
            }
            RpcPermission::ClientsToAll => !caller_is_authority,
            RpcPermission::AnyToAll => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_id_limits() {
        assert!(StringId::new("APP").is_ok());
        assert!(StringId::new(&"x".repeat(64)).is_ok());
        assert!(StringId::new(&"x".repeat(65)).is_err());
        assert!(StringId::new("héllo").is_err());
    }

    #[test]
    fn string_id_roundtrip() {
        let id = StringId::new("session-7").unwrap();
        let mut out = Vec::new();
        id.write(&mut out);
        assert_eq!(out.len(), id.encoded_len());
        let mut input = out.as_slice();
        let back = StringId::read(&mut input).unwrap();
        assert_eq!(back, id);
        assert!(input.is_empty());
    }

    #[test]
    fn response_code_roundtrip() {
        for code in [
            ConnectionResponseCode::Accepted,
            ConnectionResponseCode::ServerFull,
            ConnectionResponseCode::IncorrectAppId,
            ConnectionResponseCode::HostAlreadyAssigned,
            ConnectionResponseCode::Rejected,
        ] {
            assert_eq!(ConnectionResponseCode::from_bytes(code.to_bytes()).unwrap(), code);
        }
        assert!(ConnectionResponseCode::from_bytes(99u32.to_le_bytes()).is_err());
    }

    #[test]
    fn permission_table() {
        let authority = ClientId(1);
        let a = ClientId(2);
        let b = ClientId(3);

        // AuthorityToClients: authority only, toward non-authority.
        assert!(RpcPermission::AuthorityToClients.allows(authority, a, authority));
        assert!(RpcPermission::AuthorityToClients.allows(authority, ClientId::NONE, authority));
        assert!(!RpcPermission::AuthorityToClients.allows(a, b, authority));
        assert!(!RpcPermission::AuthorityToClients.allows(authority, authority, authority));

        // ClientsToAuthority: non-authority toward authority (or broadcast).
        assert!(RpcPermission::ClientsToAuthority.allows(a, authority, authority));
        assert!(RpcPermission::ClientsToAuthority.allows(a, ClientId::NONE, authority));
        assert!(!RpcPermission::ClientsToAuthority.allows(authority, a, authority));
        assert!(!RpcPermission::ClientsToAuthority.allows(a, b, authority));

        // ClientsToClients: between distinct non-authorities.
        assert!(RpcPermission::ClientsToClients.allows(a, b, authority));
        assert!(RpcPermission::ClientsToClients.allows(a, ClientId::NONE, authority));
        assert!(!RpcPermission::ClientsToClients.allows(a, a, authority));
        assert!(!RpcPermission::ClientsToClients.allows(a, authority, authority));
        assert!(!RpcPermission::ClientsToClients.allows(authority, a, authority));

        // Server session: the authority is the server (ClientId::NONE).
        let server = ClientId::NONE;
        assert!(RpcPermission::ClientsToAuthority.allows(a, ClientId::NONE, server));
        assert!(RpcPermission::ClientsToClients.allows(a, b, server));
        assert!(RpcPermission::AuthorityToClients.allows(server, a, server));
        assert!(!RpcPermission::AuthorityToClients.allows(a, b, server));

        // ClientsToAll: any non-authority caller.
        assert!(RpcPermission::ClientsToAll.allows(a, authority, authority));
        assert!(RpcPermission::ClientsToAll.allows(a, b, authority));
        assert!(!RpcPermission::ClientsToAll.allows(authority, a, authority));

        // AnyToAll: unrestricted.
        assert!(RpcPermission::AnyToAll.allows(authority, a, authority));
        assert!(RpcPermission::AnyToAll.allows(a, b, authority));
    }

    #[test]
    fn reserved_rpc_ids() {
        assert!(RpcId::PING.is_control());
        assert!(RpcId(29).is_control());
        assert!(!RpcId::USER_START.is_control());
        assert!(!RpcId(31).is_control());
    }
}
