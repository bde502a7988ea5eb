// alderwire_session — connection runtime for real-time multiplayer sessions.
//
// Three interoperable endpoint roles — authoritative server, client, and
// relay — exchange typed RPCs and spawn/despawn notifications over one TCP
// stream plus one UDP flow per connection. The runtime handles admission
// control, identity assignment, latency measurement, late-join
// reconciliation, and (in relayed sessions) host migration.
//
// Module overview:
// - `config.rs`:     `Config`/`Role` — JSON-loadable endpoint settings.
// - `error.rs`:      `SessionError` — the API-boundary error type.
// - `logging.rs`:    Verbosity rules + thread-safe writer for `tracing`.
// - `events.rs`:     Ordered subscriber lists per connection event.
// - `message.rs`:    The two queue types crossing the worker boundary.
// - `clients.rs`:    Per-client records and the admission-ordered table.
// - `pending.rs`:    Accepted-but-not-handshaken admissions with expiry.
// - `ping.rs`:       Outstanding latency probes with timeout sweep.
// - `registry.rs`:   Explicit per-RPC definitions + handlers.
// - `spawner.rs`:    Replicated-object table, type registry, id counter.
// - `buffer.rs`:     The common role contract and shared socket plumbing.
// - `server.rs` / `client.rs` / `relay.rs`: the three role endpoints.
// - `connection.rs`: The public façade and the optional I/O worker.
//
// Dependencies: `alderwire_protocol` (wire format), `serde`/`serde_json`
// (configuration), `rand` (client secrets), `tracing` (+`tracing-subscriber`
// for the built-in logging setup), `thiserror`.

mod buffer;
mod client;
mod clients;
pub mod config;
mod connection;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
mod pending;
mod ping;
pub mod registry;
mod relay;
mod server;
pub mod spawner;

pub use buffer::Buffer;
pub use config::{Config, Role};
pub use connection::Connection;
pub use error::SessionError;
pub use events::{Callbacks, ConnectionEvents, SubscriberId};
pub use logging::{init_logging, try_init_logging, LogSettings, SharedWriter, Verbosity};
pub use message::{OutboundMessage, Recipients, SessionEvent};
pub use ping::PING_TIMEOUT;
pub use registry::{ProtocolRegistry, RpcContext, RpcDef, RpcHandler, RpcTable};
pub use spawner::{
    NetworkBehavior, NetworkObject, Spawner, TypeRegistry, TAG_BASE_OBJECT, TAG_NONE,
    TAG_USER_START,
};

// Re-export the wire-level types user code touches directly.
pub use alderwire_protocol::control::{ClientIdAssignment, PingRequest, SpawnNotice};
pub use alderwire_protocol::error::WireError;
pub use alderwire_protocol::packet::HEADER_LEN;
pub use alderwire_protocol::rpc::{ArgKind, ArgValue};
pub use alderwire_protocol::transform::{BandwidthSnapshot, TransformStep};
pub use alderwire_protocol::types::{
    ClientId, ConnectionResponseCode, NetworkId, RpcId, RpcPermission, Transport,
};
