// Admission scenarios: the two-phase handshake against a real server.

use alderwire_session::{ClientId, Config, ConnectionResponseCode, Role, SessionError};
use session_tests::*;

#[test]
fn happy_path_admission() {
    let mut server = start(server_config(2));
    let server_log = record_events(&mut server);
    let addrs = server.listen_addrs().expect("server addresses");

    let mut client = start(client_config(addrs));
    let client_log = record_events(&mut client);
    client.await_connection().expect("admission failed");
    client.execute_queue();

    assert_eq!(client.local_id(), ClientId(1));
    assert_eq!(client.authority(), ClientId::NONE);
    assert!(!client.is_host());
    assert!(client.is_active());
    assert_eq!(
        &*client_log.borrow(),
        &[Recorded::LocalConnected {
            assigned: 1,
            authority: 0,
            max_clients: 2,
        }]
    );

    // A few more rounds: the identity grant must stay the only message.
    for _ in 0..20 {
        tick_client(&mut client);
        tick_threaded(&mut server);
        std::thread::sleep(TICK_INTERVAL);
    }
    assert_eq!(client_log.borrow().len(), 1);
    assert_eq!(
        filter_log(&server_log, |r| matches!(r, Recorded::Connected(_))),
        vec![Recorded::Connected(1)]
    );
}

#[test]
fn wrong_app_id_is_rejected() {
    let mut server = start(server_config(2));
    let addrs = server.listen_addrs().expect("server addresses");

    let mut config = client_config(addrs);
    config.app_id = "WRONG".into();
    let mut client = start(config);

    match client.await_connection() {
        Err(SessionError::Rejected(code)) => {
            assert_eq!(code, ConnectionResponseCode::IncorrectAppId)
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(!client.is_active());

    server.execute_queue();
    assert!(server.peers().is_empty(), "no client record may exist");
}

#[test]
fn wrong_session_id_is_rejected() {
    let mut server = start(server_config(2));
    let addrs = server.listen_addrs().expect("server addresses");

    let mut config = client_config(addrs);
    config.session_id = "OTHER".into();
    let mut client = start(config);

    match client.await_connection() {
        Err(SessionError::Rejected(code)) => {
            assert_eq!(code, ConnectionResponseCode::Rejected)
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn full_server_rejects_late_client() {
    let mut server = start(server_config(1));
    let addrs = server.listen_addrs().expect("server addresses");

    let mut first = start(client_config(addrs));
    first.await_connection().expect("first admission failed");
    first.execute_queue();

    let mut second = start(client_config(addrs));
    match second.await_connection() {
        Err(SessionError::Rejected(code)) => {
            assert_eq!(code, ConnectionResponseCode::ServerFull)
        }
        other => panic!("expected ServerFull, got {other:?}"),
    }

    server.execute_queue();
    assert_eq!(server.peers(), &[ClientId(1)]);
}

#[test]
fn host_request_against_server_downgrades() {
    let mut server = start(server_config(2));
    let addrs = server.listen_addrs().expect("server addresses");

    let mut config = client_config(addrs);
    config.role = Role::Host;
    let mut client = start(config);
    client.await_connection().expect("downgraded admission failed");
    client.execute_queue();

    // The server kept the authority role; the client joined as a regular
    // client on its second attempt.
    assert_eq!(client.local_id(), ClientId(1));
    assert!(!client.is_host());
    assert_eq!(client.authority(), ClientId::NONE);
}

#[test]
fn client_ids_are_never_reused() {
    let mut server = start(server_config(4));
    let addrs = server.listen_addrs().expect("server addresses");

    let mut first = start(client_config(addrs));
    first.await_connection().expect("first admission failed");
    assert_eq!(first.local_id(), ClientId(1));
    drop(first);

    // Wait until the server noticed the disconnect.
    let mut second_ready = false;
    for _ in 0..200 {
        server.execute_queue();
        if server.peers().is_empty() {
            second_ready = true;
            break;
        }
        std::thread::sleep(TICK_INTERVAL);
    }
    assert!(second_ready, "server never observed the disconnect");

    let mut second = start(client_config(addrs));
    second.await_connection().expect("second admission failed");
    assert_eq!(second.local_id(), ClientId(2), "ids must not be recycled");
}

#[test]
fn threaded_client_connects_and_rejects_manual_driving() {
    let mut server = start(server_config(2));
    let addrs = server.listen_addrs().expect("server addresses");

    let mut config = client_config(addrs);
    config.threaded = true;
    config.thread_update_delta = 2;
    let mut client = start(config);

    // The worker owns the sockets; manual driving is a state error.
    assert!(matches!(
        client.receive(),
        Err(SessionError::InvalidState(_))
    ));
    assert!(matches!(client.send(), Err(SessionError::InvalidState(_))));
    assert!(matches!(
        client.await_connection(),
        Err(SessionError::InvalidState(_))
    ));

    // Admission still completes, driven by the worker.
    let admitted = settle!(
        clients: [],
        threaded: [&mut client, &mut server],
        until: client.is_active() && client.local_id() == ClientId(1)
    );
    assert!(admitted, "threaded admission never completed");
    client.stop();
}

#[test]
fn whitelist_blocks_unlisted_addresses() {
    let mut allowed = server_config(2);
    allowed.whitelist = Some(vec!["127.0.0.1".parse().unwrap()]);
    let server = start(allowed);
    let addrs = server.listen_addrs().expect("server addresses");
    let mut client = start(client_config(addrs));
    client
        .await_connection()
        .expect("whitelisted address must be admitted");

    let mut blocked = server_config(2);
    blocked.whitelist = Some(vec!["10.1.2.3".parse().unwrap()]);
    let server = start(blocked);
    let addrs = server.listen_addrs().expect("server addresses");
    let mut client = start(client_config(addrs));
    match client.await_connection() {
        Err(SessionError::Rejected(code)) => {
            assert_eq!(code, ConnectionResponseCode::Rejected)
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn invalid_config_is_refused_up_front() {
    let mut config = Config::default();
    config.max_clients = 0;
    assert!(matches!(
        alderwire_session::Connection::start(
            config,
            alderwire_session::ProtocolRegistry::new(),
            alderwire_session::TypeRegistry::new(),
        ),
        Err(SessionError::Config(_))
    ));
}
