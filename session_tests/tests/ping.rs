// Latency probes: the relayed round trip, the local short-circuit, and the
// timeout path.

use alderwire_session::{ClientId, Role, PING_TIMEOUT};
use session_tests::*;

fn relay_with_three_clients() -> (
    alderwire_session::Connection,
    alderwire_session::Connection,
    alderwire_session::Connection,
    alderwire_session::Connection,
) {
    let mut relay = start(relay_config(4, true));
    let addrs = relay.listen_addrs().expect("relay addresses");

    let mut host_config = client_config(addrs);
    host_config.role = Role::Host;
    let mut host = start(host_config);
    host.await_connection().expect("host admission failed");
    host.execute_queue();

    let mut a = start(client_config(addrs));
    a.await_connection().expect("admission failed");
    a.execute_queue();
    assert_eq!(a.local_id(), ClientId(2));

    let mut b = start(client_config(addrs));
    b.await_connection().expect("admission failed");
    b.execute_queue();
    assert_eq!(b.local_id(), ClientId(3));

    (relay, host, a, b)
}

#[test]
fn ping_round_trip_through_relay() {
    let (mut relay, mut host, mut a, mut b) = relay_with_three_clients();
    let a_log = record_events(&mut a);

    let request = a.ping(ClientId(3)).expect("ping failed");
    assert!(!request.resolved);
    let sent_at = request.send_time_ms;

    let resolved = settle!(
        clients: [&mut host, &mut a, &mut b],
        threaded: [&mut relay],
        until: !filter_log(&a_log, |r| matches!(r, Recorded::Ping { .. })).is_empty()
    );
    assert!(resolved, "ping never resolved");

    let pings = filter_log(&a_log, |r| matches!(r, Recorded::Ping { .. }));
    match pings[0].clone() {
        Recorded::Ping {
            ping_ms,
            receive_time_ms,
            failed,
        } => {
            assert!(!failed, "round trip must succeed");
            assert!(ping_ms >= 0);
            assert!(ping_ms < PING_TIMEOUT.as_millis() as i64);
            // The receive stamp was written by client 3 between our send
            // and our resolution.
            assert!(receive_time_ms >= sent_at);
            assert!(receive_time_ms <= sent_at + ping_ms);
        }
        other => panic!("expected a ping record, got {other:?}"),
    }
}

#[test]
fn self_ping_resolves_without_the_network() {
    let mut server = start(server_config(2));
    let addrs = server.listen_addrs().expect("server addresses");

    let mut client = start(client_config(addrs));
    let log = record_events(&mut client);
    client.await_connection().expect("admission failed");
    client.execute_queue();

    let before = client.bandwidth();
    let request = client.ping(client.local_id()).expect("self ping failed");

    // Resolved synchronously, all three stamps collapsed.
    assert!(request.resolved);
    assert!(!request.failed);
    assert_eq!(request.ping_ms(), 0);
    assert_eq!(request.send_time_ms, request.receive_time_ms);
    assert_eq!(request.receive_time_ms, request.response_time_ms);
    assert_eq!(
        filter_log(&log, |r| matches!(r, Recorded::Ping { .. })),
        vec![Recorded::Ping {
            ping_ms: 0,
            receive_time_ms: request.receive_time_ms,
            failed: false,
        }]
    );
    // No socket was touched.
    assert_eq!(client.bandwidth(), before);

    let _ = server;
}

#[test]
fn unanswerable_ping_times_out_as_failed() {
    let (mut relay, mut host, mut a, mut b) = relay_with_three_clients();
    let a_log = record_events(&mut a);

    // Client 99 does not exist; the relay drops the request leg and the
    // source expires it locally.
    let request = a.ping(ClientId(99)).expect("ping failed");
    assert!(!request.resolved);

    let resolved = settle!(
        clients: [&mut host, &mut a, &mut b],
        threaded: [&mut relay],
        until: !filter_log(&a_log, |r| matches!(r, Recorded::Ping { .. })).is_empty()
    );
    assert!(resolved, "timeout never fired");

    let pings = filter_log(&a_log, |r| matches!(r, Recorded::Ping { .. }));
    assert!(
        matches!(pings[0], Recorded::Ping { failed: true, .. }),
        "expired probe must come back failed"
    );
}

#[test]
fn server_can_ping_a_client() {
    let mut server = start(server_config(2));
    let server_log = record_events(&mut server);
    let addrs = server.listen_addrs().expect("server addresses");

    let mut client = start(client_config(addrs));
    client.await_connection().expect("admission failed");
    client.execute_queue();

    server.ping(ClientId(1)).expect("server ping failed");

    let resolved = settle!(
        clients: [&mut client],
        threaded: [&mut server],
        until: !filter_log(&server_log, |r| matches!(r, Recorded::Ping { .. })).is_empty()
    );
    assert!(resolved, "server ping never resolved");
    assert!(matches!(
        filter_log(&server_log, |r| matches!(r, Recorded::Ping { .. }))[0],
        Recorded::Ping { failed: false, .. }
    ));
}
