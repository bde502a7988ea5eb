// Host migration in relayed sessions: explicit handoff, handoff on
// disconnect, and the non-migratable shutdown path.

use alderwire_session::{ClientId, Role};
use session_tests::*;

/// Relay plus a host and two regular clients, fully admitted.
fn relay_session(
    migratable: bool,
) -> (
    alderwire_session::Connection,
    alderwire_session::Connection,
    alderwire_session::Connection,
    alderwire_session::Connection,
) {
    let mut relay = start(relay_config(4, migratable));
    let addrs = relay.listen_addrs().expect("relay addresses");

    let mut host_config = client_config(addrs);
    host_config.role = Role::Host;
    let mut host = start(host_config);
    host.await_connection().expect("host admission failed");
    host.execute_queue();
    assert!(host.is_host());
    assert_eq!(host.local_id(), ClientId(1));
    assert_eq!(host.authority(), ClientId(1));

    let mut a = start(client_config(addrs));
    a.await_connection().expect("client admission failed");
    a.execute_queue();
    assert_eq!(a.local_id(), ClientId(2));
    assert_eq!(a.authority(), ClientId(1));

    let mut b = start(client_config(addrs));
    b.await_connection().expect("client admission failed");
    b.execute_queue();
    assert_eq!(b.local_id(), ClientId(3));

    // Everyone hears about everyone before the scenario starts.
    let ready = settle!(
        clients: [&mut host, &mut a, &mut b],
        threaded: [&mut relay],
        until: host.peers().len() == 2 && a.peers().len() == 2 && b.peers().len() == 2
    );
    assert!(ready, "roster never settled");

    (relay, host, a, b)
}

#[test]
fn authority_disconnect_migrates_to_first_survivor() {
    let (mut relay, host, mut a, mut b) = relay_session(true);
    let a_log = record_events(&mut a);
    let b_log = record_events(&mut b);

    // The host's sockets close when it is dropped.
    drop(host);

    let migrated = settle!(
        clients: [&mut a, &mut b],
        threaded: [&mut relay],
        until: a.authority() == ClientId(2) && b.authority() == ClientId(2)
    );
    assert!(migrated, "migration never completed");

    // Deterministic fallback: first surviving record in admission order.
    assert_eq!(relay.authority(), ClientId(2));
    assert!(a.is_host(), "client 2 must promote itself");
    assert!(!b.is_host());

    // Survivors hear the departure before the migration notice.
    for log in [&a_log, &b_log] {
        let entries = filter_log(log, |r| {
            matches!(r, Recorded::Disconnected(1) | Recorded::Migrated(2))
        });
        assert_eq!(
            entries,
            vec![Recorded::Disconnected(1), Recorded::Migrated(2)],
            "departure must precede migration"
        );
    }
}

#[test]
fn explicit_migration_by_the_host() {
    let (mut relay, mut host, mut a, mut b) = relay_session(true);

    host.migrate_host(ClientId(3)).expect("migration request failed");

    let migrated = settle!(
        clients: [&mut host, &mut a, &mut b],
        threaded: [&mut relay],
        until: host.authority() == ClientId(3)
            && a.authority() == ClientId(3)
            && b.authority() == ClientId(3)
    );
    assert!(migrated, "migration never completed");

    assert!(!host.is_host(), "previous host must demote itself");
    assert!(b.is_host(), "client 3 must promote itself");
    assert_eq!(relay.authority(), ClientId(3));
}

#[test]
fn migration_requests_from_non_hosts_are_refused() {
    let (_relay, _host, mut a, _b) = relay_session(true);
    assert!(a.migrate_host(ClientId(3)).is_err());
}

#[test]
fn fixed_session_shuts_down_when_the_host_leaves() {
    let (mut relay, host, mut a, mut b) = relay_session(false);

    drop(host);

    let torn_down = settle!(
        clients: [&mut a, &mut b],
        threaded: [&mut relay],
        until: !relay.is_active() && !a.is_active() && !b.is_active()
    );
    assert!(torn_down, "relay should shut down with its host");
}
