// Test harness for end-to-end session tests.
//
// Each test starts a real server or relay endpoint (threaded mode, its
// worker owns the sockets) and connects real client endpoints driven
// synchronously from the test thread: `receive` / `execute_queue` / `send`
// once per tick. Everything runs on loopback with OS-assigned ports, so
// tests can run concurrently.
//
// The only test-specific machinery is the polling helpers (bounded tick
// loops) and the event recorder, which subscribes to every connection
// event and appends a compact record the assertions can match on.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use alderwire_session::{
    try_init_logging, Config, Connection, LogSettings, ProtocolRegistry, Role, SharedWriter,
    TypeRegistry,
};

/// App/session identifiers every test endpoint agrees on.
pub const TEST_APP: &str = "APP";
pub const TEST_SESSION: &str = "S1";

/// Bounded wait for cross-endpoint effects.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tick pacing for the synchronous client loops.
pub const TICK_INTERVAL: Duration = Duration::from_millis(5);

/// Base configuration for a threaded server on OS-assigned loopback ports.
pub fn server_config(max_clients: u32) -> Config {
    let mut config = Config::default();
    config.role = Role::Server;
    config.tcp_port = 0;
    config.udp_port = 0;
    config.max_clients = max_clients;
    config.app_id = TEST_APP.into();
    config.session_id = TEST_SESSION.into();
    config.threaded = true;
    config.thread_update_delta = 2;
    config
}

/// Base configuration for a threaded relay.
pub fn relay_config(max_clients: u32, migratable: bool) -> Config {
    let mut config = server_config(max_clients);
    config.role = Role::Relay;
    config.migratable = migratable;
    config
}

/// Base configuration for a synchronous client pointed at `addrs`
/// (a server's bound TCP/UDP listen addresses).
pub fn client_config(addrs: (SocketAddr, SocketAddr)) -> Config {
    let mut config = Config::default();
    config.role = Role::Client;
    config.server_addr = addrs.0.ip();
    config.tcp_port = addrs.0.port();
    config.udp_port = addrs.1.port();
    config.app_id = TEST_APP.into();
    config.session_id = TEST_SESSION.into();
    config.threaded = false;
    config.connection_request_rate = 250;
    config.measure_bandwidth = true;
    config
}

/// Start an endpoint with an empty protocol registry and default types.
pub fn start(config: Config) -> Connection {
    try_init_logging(&LogSettings::default(), SharedWriter::stderr());
    Connection::start(config, ProtocolRegistry::new(), TypeRegistry::new())
        .expect("endpoint start failed")
}

/// One synchronous tick: drain sockets, run callbacks, flush packets.
pub fn tick_client(client: &mut Connection) {
    client.receive().expect("client receive failed");
    client.execute_queue();
    client.send().expect("client send failed");
}

/// Threaded endpoints only need their event queue drained.
pub fn tick_threaded(endpoint: &mut Connection) {
    endpoint.execute_queue();
}

/// Tick the named endpoints until the condition holds or the settle
/// timeout hits; yields `true` when the condition was reached. A macro so
/// the condition can inspect the same connections that are being ticked.
#[macro_export]
macro_rules! settle {
    (clients: [$($client:expr),* $(,)?], threaded: [$($endpoint:expr),* $(,)?], until: $cond:expr) => {{
        let deadline = std::time::Instant::now() + $crate::SETTLE_TIMEOUT;
        let mut reached = false;
        while std::time::Instant::now() < deadline {
            $( $crate::tick_client($client); )*
            $( $crate::tick_threaded($endpoint); )*
            if $cond {
                reached = true;
                break;
            }
            std::thread::sleep($crate::TICK_INTERVAL);
        }
        reached
    }};
}

/// Compact record of one connection event, for order-sensitive assertions.
#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    Connected(u32),
    Disconnected(u32),
    LocalConnected {
        assigned: u32,
        authority: u32,
        max_clients: u32,
    },
    LocalDisconnected,
    Migrated(u32),
    Spawned {
        tag: u8,
        id: u32,
    },
    Despawned(u32),
    Ping {
        ping_ms: i64,
        receive_time_ms: i64,
        failed: bool,
    },
}

pub type EventLog = Rc<RefCell<Vec<Recorded>>>;

/// Subscribe to every event surface of `connection`; the log fills as its
/// `execute_queue` runs.
pub fn record_events(connection: &mut Connection) -> EventLog {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));

    let sink = log.clone();
    connection
        .events
        .client_connected
        .subscribe(move |id| sink.borrow_mut().push(Recorded::Connected(id.0)));

    let sink = log.clone();
    connection
        .events
        .client_disconnected
        .subscribe(move |id| sink.borrow_mut().push(Recorded::Disconnected(id.0)));

    let sink = log.clone();
    connection.events.local_connected.subscribe(move |a| {
        sink.borrow_mut().push(Recorded::LocalConnected {
            assigned: a.assigned_id.0,
            authority: a.authority_id.0,
            max_clients: a.max_clients,
        })
    });

    let sink = log.clone();
    connection
        .events
        .local_disconnected
        .subscribe(move |_| sink.borrow_mut().push(Recorded::LocalDisconnected));

    let sink = log.clone();
    connection
        .events
        .host_migration
        .subscribe(move |id| sink.borrow_mut().push(Recorded::Migrated(id.0)));

    let sink = log.clone();
    connection.events.object_spawned.subscribe(move |notice| {
        sink.borrow_mut().push(Recorded::Spawned {
            tag: notice.type_tag,
            id: notice.id.0,
        })
    });

    let sink = log.clone();
    connection
        .events
        .object_despawned
        .subscribe(move |id| sink.borrow_mut().push(Recorded::Despawned(id.0)));

    let sink = log.clone();
    connection.events.ping_resolved.subscribe(move |request| {
        sink.borrow_mut().push(Recorded::Ping {
            ping_ms: request.ping_ms(),
            receive_time_ms: request.receive_time_ms,
            failed: request.failed,
        })
    });

    log
}

/// Pull one kind of record out of a log.
pub fn filter_log(log: &EventLog, keep: impl Fn(&Recorded) -> bool) -> Vec<Recorded> {
    log.borrow().iter().filter(|r| keep(r)).cloned().collect()
}
