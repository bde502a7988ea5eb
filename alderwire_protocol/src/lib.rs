// alderwire_protocol — wire protocol for multiplayer session endpoints.
//
// This crate defines everything that crosses the network between the
// server/client/relay endpoints of `alderwire_session`: the packet container
// with its fixed header and fragmentation, the binary `Encodable` contract,
// the RPC codec, the control-message vocabulary, the canonical Huffman
// compressor, and the transform pipeline packets pass through on either side
// of the socket. It is shared by all endpoint roles and has no dependency on
// the session runtime.
//
// Module overview:
// - `types.rs`:     Core id newtypes — `ClientId`, `NetworkId`, `RpcId`,
//                   `StringId` — plus response codes and the permission table.
// - `encode.rs`:    The `Encodable` trait and little-endian primitives.
// - `compound.rs`:  Capacity-bounded containers (`BoundedList` et al).
// - `packet.rs`:    Packet builder/assembler with message framing and
//                   fragmentation.
// - `rpc.rs`:       RPC header layout and table-driven argument codec.
// - `control.rs`:   Fixed payloads of the reserved RPC id range.
// - `huffman.rs`:   Canonical Huffman codec for packet message regions.
// - `transform.rs`: Ordered send/receive transform steps (compression,
//                   bandwidth accounting).
//
// Design decisions:
// - **Little-endian everywhere.** The wire format fixes byte order instead
//   of inheriting it from the host.
// - **Hand-written encoding.** The byte layout is part of the protocol
//   contract, so values encode through `Encodable` rather than a serde
//   format; serde stays at the configuration edges of the session crate.
// - **Bounded everything.** Frames, strings and compound containers all
//   carry explicit limits checked on both the write and the read path.

pub mod compound;
pub mod control;
pub mod encode;
pub mod error;
pub mod huffman;
pub mod packet;
pub mod rpc;
pub mod transform;
pub mod types;

pub use compound::{BoundedBitSet, BoundedList, BoundedMap, BoundedString};
pub use control::{
    ClientIdAssignment, ConnectionRequest, ControlMessage, PingRequest, SpawnNotice,
};
pub use encode::Encodable;
pub use error::WireError;
pub use packet::{
    iter_messages, Packet, PacketAssembler, PacketHeader, FLAG_COMPRESSED, HEADER_LEN,
};
pub use rpc::{decode_args, encode_rpc, ArgKind, ArgValue, RpcHeader};
pub use transform::{
    BandwidthMeter, BandwidthSnapshot, BandwidthStep, CompressionStep, Direction,
    TransformPipeline, TransformStep, PRIORITY_COMPRESSION, PRIORITY_INCOMING_BANDWIDTH,
    PRIORITY_OUTGOING_BANDWIDTH,
};
pub use types::{
    ClientId, ConnectionResponseCode, NetworkId, RpcId, RpcPermission, StringId, Transport,
};
