// RPC routing end-to-end: broadcast with local execution, point-to-point
// callee routing, relay forwarding between clients, permission enforcement,
// and the datagram transport.

use std::cell::RefCell;
use std::rc::Rc;

use alderwire_session::{
    ArgKind, ArgValue, ClientId, Config, Connection, NetworkId, ProtocolRegistry, Role, RpcDef,
    RpcId, RpcPermission, Transport, TypeRegistry,
};
use session_tests::*;

/// One record per handled invocation: (rpc id, caller id, arguments).
type CallLog = Rc<RefCell<Vec<(u32, u32, Vec<ArgValue>)>>>;

const RPC_SHOUT: RpcId = RpcId(30);
const RPC_WHISPER: RpcId = RpcId(31);
const RPC_DECREE: RpcId = RpcId(32);
const RPC_STATE: RpcId = RpcId(33);

/// The test protocol: a broadcast, a callee-routed message, an
/// authority-only announcement, and a datagram update.
fn test_registry(log: &CallLog) -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();
    let defs = [
        RpcDef {
            id: RPC_SHOUT,
            permission: RpcPermission::AnyToAll,
            transport: Transport::Stream,
            params: vec![ArgKind::Client, ArgKind::U32, ArgKind::Str],
            caller_index: Some(0),
            callee_index: None,
        },
        RpcDef {
            id: RPC_WHISPER,
            permission: RpcPermission::ClientsToClients,
            transport: Transport::Stream,
            params: vec![ArgKind::Client, ArgKind::Client, ArgKind::Str],
            caller_index: Some(0),
            callee_index: Some(1),
        },
        RpcDef {
            id: RPC_DECREE,
            permission: RpcPermission::AuthorityToClients,
            transport: Transport::Stream,
            params: vec![ArgKind::Str],
            caller_index: None,
            callee_index: None,
        },
        RpcDef {
            id: RPC_STATE,
            permission: RpcPermission::AnyToAll,
            transport: Transport::Datagram,
            params: vec![ArgKind::U32],
            caller_index: None,
            callee_index: None,
        },
    ];
    for def in defs {
        let sink = log.clone();
        let id = def.id;
        registry
            .define_rpc(
                def,
                Box::new(move |ctx, args| {
                    sink.borrow_mut().push((id.0, ctx.caller.0, args.to_vec()));
                    Ok(())
                }),
            )
            .expect("rpc definition");
    }
    registry
}

fn start_with_registry(config: Config) -> (Connection, CallLog) {
    let log: CallLog = Rc::new(RefCell::new(Vec::new()));
    let connection = Connection::start(config, test_registry(&log), TypeRegistry::new())
        .expect("endpoint start failed");
    (connection, log)
}

fn connect(config: Config) -> (Connection, CallLog) {
    let (mut connection, log) = start_with_registry(config);
    connection.await_connection().expect("admission failed");
    connection.execute_queue();
    (connection, log)
}

#[test]
fn broadcast_executes_on_server_and_other_clients() {
    let (mut server, server_calls) = start_with_registry(server_config(4));
    let addrs = server.listen_addrs().expect("server addresses");
    let (mut a, a_calls) = connect(client_config(addrs));
    let (mut b, b_calls) = connect(client_config(addrs));

    a.send_rpc(
        RPC_SHOUT,
        ClientId::NONE,
        NetworkId::NONE,
        &[
            ArgValue::Client(a.local_id()),
            ArgValue::U32(7),
            ArgValue::Str("hello".into()),
        ],
    )
    .expect("send failed");

    let arrived = settle!(
        clients: [&mut a, &mut b],
        threaded: [&mut server],
        until: server_calls.borrow().len() == 1 && b_calls.borrow().len() == 1
    );
    assert!(arrived, "broadcast never arrived");

    // The caller is re-injected from the packet header on both receivers.
    let expected_args = vec![
        ArgValue::Client(ClientId(1)),
        ArgValue::U32(7),
        ArgValue::Str("hello".into()),
    ];
    assert_eq!(
        server_calls.borrow()[0],
        (RPC_SHOUT.0, 1, expected_args.clone())
    );
    assert_eq!(b_calls.borrow()[0], (RPC_SHOUT.0, 1, expected_args));

    // The original caller does not hear its own broadcast.
    assert!(a_calls.borrow().is_empty());
}

#[test]
fn callee_routed_rpc_reaches_only_the_callee() {
    let (mut server, server_calls) = start_with_registry(server_config(4));
    let addrs = server.listen_addrs().expect("server addresses");
    let (mut a, _a_calls) = connect(client_config(addrs));
    let (mut b, b_calls) = connect(client_config(addrs));
    let (mut c, c_calls) = connect(client_config(addrs));

    let b_id = b.local_id();
    a.send_rpc(
        RPC_WHISPER,
        b_id,
        NetworkId::NONE,
        &[
            ArgValue::Client(a.local_id()),
            ArgValue::Client(b_id),
            ArgValue::Str("psst".into()),
        ],
    )
    .expect("send failed");

    let arrived = settle!(
        clients: [&mut a, &mut b, &mut c],
        threaded: [&mut server],
        until: b_calls.borrow().len() == 1
    );
    assert!(arrived, "whisper never arrived");

    assert_eq!(
        b_calls.borrow()[0],
        (
            RPC_WHISPER.0,
            1,
            vec![
                ArgValue::Client(ClientId(1)),
                ArgValue::Client(b_id),
                ArgValue::Str("psst".into()),
            ]
        )
    );
    // Nobody else executes a client-to-client message — the server included.
    assert!(c_calls.borrow().is_empty());
    assert!(server_calls.borrow().is_empty());
}

#[test]
fn relay_forwards_without_executing() {
    let (mut relay, relay_calls) = start_with_registry(relay_config(4, true));
    let addrs = relay.listen_addrs().expect("relay addresses");

    let mut host_config = client_config(addrs);
    host_config.role = Role::Host;
    let (mut host, host_calls) = connect(host_config);
    assert!(host.is_host());

    let (mut a, _a_calls) = connect(client_config(addrs));
    let (mut b, b_calls) = connect(client_config(addrs));

    // Client-to-client broadcast: the relay forwards to the other
    // non-authority only.
    a.send_rpc(
        RPC_WHISPER,
        ClientId::NONE,
        NetworkId::NONE,
        &[
            ArgValue::Client(a.local_id()),
            ArgValue::Client(ClientId::NONE),
            ArgValue::Str("between clients".into()),
        ],
    )
    .expect("send failed");

    let arrived = settle!(
        clients: [&mut host, &mut a, &mut b],
        threaded: [&mut relay],
        until: b_calls.borrow().len() == 1
    );
    assert!(arrived, "forwarded rpc never arrived");

    assert!(relay_calls.borrow().is_empty(), "relays never execute");
    assert!(host_calls.borrow().is_empty(), "the authority is excluded");
}

#[test]
fn authority_rpcs_are_refused_from_clients() {
    let (mut server, _server_calls) = start_with_registry(server_config(4));
    let addrs = server.listen_addrs().expect("server addresses");
    let (mut a, a_calls) = connect(client_config(addrs));

    // The local permission table rejects the call before encoding.
    assert!(a
        .send_rpc(
            RPC_DECREE,
            ClientId::NONE,
            NetworkId::NONE,
            &[ArgValue::Str("i am the authority".into())],
        )
        .is_err());

    // The server, as authority, may broadcast it.
    server
        .send_rpc(
            RPC_DECREE,
            ClientId::NONE,
            NetworkId::NONE,
            &[ArgValue::Str("announcement".into())],
        )
        .expect("authority send failed");

    let arrived = settle!(
        clients: [&mut a],
        threaded: [&mut server],
        until: a_calls.borrow().len() == 1
    );
    assert!(arrived, "announcement never arrived");
    assert_eq!(
        a_calls.borrow()[0],
        (RPC_DECREE.0, 0, vec![ArgValue::Str("announcement".into())])
    );
}

#[test]
fn datagram_rpcs_travel_over_udp() {
    let (mut server, server_calls) = start_with_registry(server_config(4));
    let addrs = server.listen_addrs().expect("server addresses");
    let (mut a, _a_calls) = connect(client_config(addrs));
    let (mut b, b_calls) = connect(client_config(addrs));

    a.send_rpc(
        RPC_STATE,
        ClientId::NONE,
        NetworkId::NONE,
        &[ArgValue::U32(99)],
    )
    .expect("send failed");

    let arrived = settle!(
        clients: [&mut a, &mut b],
        threaded: [&mut server],
        until: server_calls.borrow().len() == 1 && b_calls.borrow().len() == 1
    );
    assert!(arrived, "datagram rpc never arrived");
    assert_eq!(server_calls.borrow()[0], (RPC_STATE.0, 1, vec![ArgValue::U32(99)]));
}

#[test]
fn mismatched_arguments_are_rejected_before_sending() {
    let (mut server, _calls) = start_with_registry(server_config(4));
    let addrs = server.listen_addrs().expect("server addresses");
    let (mut a, _a_calls) = connect(client_config(addrs));

    // Wrong arity.
    assert!(a
        .send_rpc(RPC_STATE, ClientId::NONE, NetworkId::NONE, &[])
        .is_err());
    // Wrong kind.
    assert!(a
        .send_rpc(
            RPC_STATE,
            ClientId::NONE,
            NetworkId::NONE,
            &[ArgValue::Str("not a u32".into())],
        )
        .is_err());
    // Unknown id.
    assert!(a
        .send_rpc(RpcId(99), ClientId::NONE, NetworkId::NONE, &[])
        .is_err());
}
