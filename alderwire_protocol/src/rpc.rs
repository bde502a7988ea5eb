// RPC message codec.
//
// Wire layout: `[u32 rpc_id][u32 caller][u32 callee]`, then — for user RPCs
// only (`rpc_id >= 30`) — `[u32 target_network_id]`, then the encoded
// arguments. Control messages omit the target field; their payloads are
// fixed structs (see `control.rs`).
//
// Argument encoding is table-driven: each RPC declares an ordered `ArgKind`
// list, and the decoder reads exactly those kinds back. There is no runtime
// type inspection — dispatch is a table lookup plus an indexed decode. The
// caller and callee parameters of an RPC are not sent at all: the sender
// skips the declared injection indices and the receiver re-injects the
// values recovered from the packet header (caller) and its own identity
// (callee).

use crate::encode::{
    get_bool, get_f32, get_f64, get_i16, get_i32, get_i64, get_u16, get_u32, get_u64, get_u8,
    get_i8, get_bytes, Encodable,
};
use crate::error::{Result, WireError};
use crate::types::{ClientId, NetworkId, RpcId};

/// Decoded RPC message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpcHeader {
    pub rpc_id: RpcId,
    pub caller: ClientId,
    pub callee: ClientId,
    /// Addressed replicated object; [`NetworkId::NONE`] for RPCs that do not
    /// target one. Absent on the wire for control messages.
    pub target: NetworkId,
}

impl RpcHeader {
    pub fn control(rpc_id: RpcId, caller: ClientId, callee: ClientId) -> RpcHeader {
        debug_assert!(rpc_id.is_control());
        RpcHeader {
            rpc_id,
            caller,
            callee,
            target: NetworkId::NONE,
        }
    }

    pub fn encoded_len(&self) -> usize {
        if self.rpc_id.is_control() {
            12
        } else {
            16
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        self.rpc_id.write(out);
        self.caller.write(out);
        self.callee.write(out);
        if !self.rpc_id.is_control() {
            self.target.write(out);
        }
    }

    pub fn read(input: &mut &[u8]) -> Result<RpcHeader> {
        let rpc_id = RpcId::read(input)?;
        let caller = ClientId::read(input)?;
        let callee = ClientId::read(input)?;
        let target = if rpc_id.is_control() {
            NetworkId::NONE
        } else {
            NetworkId::read(input)?
        };
        Ok(RpcHeader {
            rpc_id,
            caller,
            callee,
            target,
        })
    }
}

/// Declared kind of one RPC parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    /// UTF-8 string, u8 length prefix, at most 255 bytes.
    Str,
    /// A client identifier. Required kind at injection indices.
    Client,
    /// A replicated-object identifier.
    Object,
    /// An opaque user encodable, sent behind a 4-byte length prefix.
    Encoded,
}

impl ArgKind {
    pub fn name(self) -> &'static str {
        match self {
            ArgKind::Bool => "bool",
            ArgKind::U8 => "u8",
            ArgKind::I8 => "i8",
            ArgKind::U16 => "u16",
            ArgKind::I16 => "i16",
            ArgKind::U32 => "u32",
            ArgKind::I32 => "i32",
            ArgKind::U64 => "u64",
            ArgKind::I64 => "i64",
            ArgKind::F32 => "f32",
            ArgKind::F64 => "f64",
            ArgKind::Str => "string",
            ArgKind::Client => "client id",
            ArgKind::Object => "object id",
            ArgKind::Encoded => "encoded",
        }
    }
}

/// One RPC argument value.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Client(ClientId),
    Object(NetworkId),
    /// Pre-encoded bytes of a user encodable; decode with
    /// [`ArgValue::decode_as`].
    Encoded(Vec<u8>),
}

impl ArgValue {
    pub fn kind(&self) -> ArgKind {
        match self {
            ArgValue::Bool(_) => ArgKind::Bool,
            ArgValue::U8(_) => ArgKind::U8,
            ArgValue::I8(_) => ArgKind::I8,
            ArgValue::U16(_) => ArgKind::U16,
            ArgValue::I16(_) => ArgKind::I16,
            ArgValue::U32(_) => ArgKind::U32,
            ArgValue::I32(_) => ArgKind::I32,
            ArgValue::U64(_) => ArgKind::U64,
            ArgValue::I64(_) => ArgKind::I64,
            ArgValue::F32(_) => ArgKind::F32,
            ArgValue::F64(_) => ArgKind::F64,
            ArgValue::Str(_) => ArgKind::Str,
            ArgValue::Client(_) => ArgKind::Client,
            ArgValue::Object(_) => ArgKind::Object,
            ArgValue::Encoded(_) => ArgKind::Encoded,
        }
    }

    /// Wrap a user encodable for transport.
    pub fn encoded<T: Encodable>(value: &T) -> ArgValue {
        let mut bytes = Vec::with_capacity(value.encoded_len());
        value.write(&mut bytes);
        ArgValue::Encoded(bytes)
    }

    /// Decode an [`ArgValue::Encoded`] back into its user type.
    pub fn decode_as<T: Encodable>(&self) -> Result<T> {
        match self {
            ArgValue::Encoded(bytes) => {
                let mut input = bytes.as_slice();
                T::read(&mut input)
            }
            other => Err(WireError::ArgKindMismatch {
                index: 0,
                expected: "encoded",
                got: other.kind().name(),
            }),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            ArgValue::Bool(_) | ArgValue::U8(_) | ArgValue::I8(_) => 1,
            ArgValue::U16(_) | ArgValue::I16(_) => 2,
            ArgValue::U32(_)
            | ArgValue::I32(_)
            | ArgValue::F32(_)
            | ArgValue::Client(_)
            | ArgValue::Object(_) => 4,
            ArgValue::U64(_) | ArgValue::I64(_) | ArgValue::F64(_) => 8,
            ArgValue::Str(s) => 1 + s.len(),
            ArgValue::Encoded(bytes) => 4 + bytes.len(),
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            ArgValue::Bool(v) => v.write(out),
            ArgValue::U8(v) => v.write(out),
            ArgValue::I8(v) => v.write(out),
            ArgValue::U16(v) => v.write(out),
            ArgValue::I16(v) => v.write(out),
            ArgValue::U32(v) => v.write(out),
            ArgValue::I32(v) => v.write(out),
            ArgValue::U64(v) => v.write(out),
            ArgValue::I64(v) => v.write(out),
            ArgValue::F32(v) => v.write(out),
            ArgValue::F64(v) => v.write(out),
            ArgValue::Str(v) => v.write(out),
            ArgValue::Client(v) => v.write(out),
            ArgValue::Object(v) => v.write(out),
            ArgValue::Encoded(bytes) => {
                out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
        }
    }

    pub fn read(kind: ArgKind, input: &mut &[u8]) -> Result<ArgValue> {
        Ok(match kind {
            ArgKind::Bool => ArgValue::Bool(get_bool(input)?),
            ArgKind::U8 => ArgValue::U8(get_u8(input)?),
            ArgKind::I8 => ArgValue::I8(get_i8(input)?),
            ArgKind::U16 => ArgValue::U16(get_u16(input)?),
            ArgKind::I16 => ArgValue::I16(get_i16(input)?),
            ArgKind::U32 => ArgValue::U32(get_u32(input)?),
            ArgKind::I32 => ArgValue::I32(get_i32(input)?),
            ArgKind::U64 => ArgValue::U64(get_u64(input)?),
            ArgKind::I64 => ArgValue::I64(get_i64(input)?),
            ArgKind::F32 => ArgValue::F32(get_f32(input)?),
            ArgKind::F64 => ArgValue::F64(get_f64(input)?),
            ArgKind::Str => ArgValue::Str(String::read(input)?),
            ArgKind::Client => ArgValue::Client(ClientId::read(input)?),
            ArgKind::Object => ArgValue::Object(NetworkId::read(input)?),
            ArgKind::Encoded => {
                let len = get_i32(input)?;
                if len < 0 {
                    return Err(WireError::BadLengthPrefix {
                        len: 0,
                        remaining: input.len(),
                    });
                }
                ArgValue::Encoded(get_bytes(input, len as usize)?)
            }
        })
    }
}

fn check_injection(
    index: Option<usize>,
    args_len: usize,
    kinds: impl Fn(usize) -> ArgKind,
) -> Result<()> {
    if let Some(i) = index {
        if i >= args_len {
            return Err(WireError::BadInjectionIndex {
                index: i,
                params: args_len,
            });
        }
        let kind = kinds(i);
        if kind != ArgKind::Client {
            return Err(WireError::ArgKindMismatch {
                index: i,
                expected: ArgKind::Client.name(),
                got: kind.name(),
            });
        }
    }
    Ok(())
}

/// Encode a full RPC message: header, then each argument, skipping the
/// caller/callee injection positions (those are recovered on the receiving
/// side from the packet header and the local identity).
pub fn encode_rpc(
    header: &RpcHeader,
    args: &[ArgValue],
    caller_index: Option<usize>,
    callee_index: Option<usize>,
    out: &mut Vec<u8>,
) -> Result<()> {
    check_injection(caller_index, args.len(), |i| args[i].kind())?;
    check_injection(callee_index, args.len(), |i| args[i].kind())?;
    header.write(out);
    for (i, arg) in args.iter().enumerate() {
        if caller_index == Some(i) || callee_index == Some(i) {
            continue;
        }
        arg.write(out);
    }
    Ok(())
}

/// Decode the argument list of an RPC whose header has already been read.
/// `params` is the declared kind list; the injection positions are filled
/// from the header instead of the wire.
pub fn decode_args(
    params: &[ArgKind],
    caller_index: Option<usize>,
    callee_index: Option<usize>,
    header: &RpcHeader,
    input: &mut &[u8],
) -> Result<Vec<ArgValue>> {
    check_injection(caller_index, params.len(), |i| params[i])?;
    check_injection(callee_index, params.len(), |i| params[i])?;
    let mut args = Vec::with_capacity(params.len());
    for (i, &kind) in params.iter().enumerate() {
        if caller_index == Some(i) {
            args.push(ArgValue::Client(header.caller));
        } else if callee_index == Some(i) {
            args.push(ArgValue::Client(header.callee));
        } else {
            args.push(ArgValue::read(kind, input)?);
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_user_rpc() {
        let header = RpcHeader {
            rpc_id: RpcId(31),
            caller: ClientId(2),
            callee: ClientId(3),
            target: NetworkId(9),
        };
        let mut out = Vec::new();
        header.write(&mut out);
        assert_eq!(out.len(), 16);
        let mut input = out.as_slice();
        assert_eq!(RpcHeader::read(&mut input).unwrap(), header);
    }

    #[test]
    fn control_header_omits_target() {
        let header = RpcHeader::control(RpcId::PING, ClientId(2), ClientId(3));
        let mut out = Vec::new();
        header.write(&mut out);
        assert_eq!(out.len(), 12);
        let mut input = out.as_slice();
        let back = RpcHeader::read(&mut input).unwrap();
        assert_eq!(back.target, NetworkId::NONE);
        assert_eq!(back.rpc_id, RpcId::PING);
    }

    #[test]
    fn args_roundtrip_without_injection() {
        let header = RpcHeader {
            rpc_id: RpcId(40),
            caller: ClientId(1),
            callee: ClientId(2),
            target: NetworkId::NONE,
        };
        let args = vec![
            ArgValue::U32(77),
            ArgValue::Str("move".into()),
            ArgValue::F32(1.25),
            ArgValue::Bool(true),
        ];
        let mut out = Vec::new();
        encode_rpc(&header, &args, None, None, &mut out).unwrap();

        let mut input = out.as_slice();
        let back_header = RpcHeader::read(&mut input).unwrap();
        assert_eq!(back_header, header);
        let params = [ArgKind::U32, ArgKind::Str, ArgKind::F32, ArgKind::Bool];
        let back = decode_args(&params, None, None, &back_header, &mut input).unwrap();
        assert_eq!(back, args);
        assert!(input.is_empty());
    }

    #[test]
    fn injected_args_are_not_on_the_wire() {
        let header = RpcHeader {
            rpc_id: RpcId(41),
            caller: ClientId(5),
            callee: ClientId(6),
            target: NetworkId(3),
        };
        // Declared signature: (caller, value, callee).
        let args = vec![
            ArgValue::Client(ClientId(5)),
            ArgValue::U64(123_456),
            ArgValue::Client(ClientId(6)),
        ];
        let mut out = Vec::new();
        encode_rpc(&header, &args, Some(0), Some(2), &mut out).unwrap();
        // Header (16) + only the u64 argument.
        assert_eq!(out.len(), 16 + 8);

        let mut input = out.as_slice();
        let back_header = RpcHeader::read(&mut input).unwrap();
        let params = [ArgKind::Client, ArgKind::U64, ArgKind::Client];
        let back = decode_args(&params, Some(0), Some(2), &back_header, &mut input).unwrap();
        assert_eq!(back[0], ArgValue::Client(ClientId(5)));
        assert_eq!(back[1], ArgValue::U64(123_456));
        assert_eq!(back[2], ArgValue::Client(ClientId(6)));
    }

    #[test]
    fn injection_index_must_be_a_client_parameter() {
        let header = RpcHeader {
            rpc_id: RpcId(42),
            caller: ClientId(1),
            callee: ClientId::NONE,
            target: NetworkId::NONE,
        };
        let args = vec![ArgValue::U8(1)];
        let mut out = Vec::new();
        assert!(encode_rpc(&header, &args, Some(0), None, &mut out).is_err());
        assert!(encode_rpc(&header, &args, Some(3), None, &mut out).is_err());
    }

    #[test]
    fn encoded_arg_roundtrip() {
        // A user type: two fields, hand-encoded.
        struct Waypoint {
            x: i32,
            y: i32,
        }
        impl Encodable for Waypoint {
            fn encoded_len(&self) -> usize {
                8
            }
            fn write(&self, out: &mut Vec<u8>) {
                self.x.write(out);
                self.y.write(out);
            }
            fn read(input: &mut &[u8]) -> Result<Self> {
                Ok(Waypoint {
                    x: i32::read(input)?,
                    y: i32::read(input)?,
                })
            }
        }

        let arg = ArgValue::encoded(&Waypoint { x: -4, y: 11 });
        let mut out = Vec::new();
        arg.write(&mut out);
        let mut input = out.as_slice();
        let back = ArgValue::read(ArgKind::Encoded, &mut input).unwrap();
        let waypoint: Waypoint = back.decode_as().unwrap();
        assert_eq!(waypoint.x, -4);
        assert_eq!(waypoint.y, 11);
    }

    #[test]
    fn truncated_args_fail() {
        let header = RpcHeader {
            rpc_id: RpcId(43),
            caller: ClientId(1),
            callee: ClientId(2),
            target: NetworkId::NONE,
        };
        let args = vec![ArgValue::U64(1)];
        let mut out = Vec::new();
        encode_rpc(&header, &args, None, None, &mut out).unwrap();
        out.truncate(out.len() - 3);

        let mut input = out.as_slice();
        let back_header = RpcHeader::read(&mut input).unwrap();
        assert!(decode_args(&[ArgKind::U64], None, None, &back_header, &mut input).is_err());
    }
}
