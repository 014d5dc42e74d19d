use pontoon::{
    BridgedConnection, ConnectOptions, Error, Reactor,
    mock::{MockClient, MockServer, MockSession, MockStats, stats_for},
};
use std::{
    env,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

fn init_logs() {
    let mut logger = env_logger::builder();
    logger.is_test(true);
    if env::var("RUST_LOG").is_err() {
        logger.filter_level(log::LevelFilter::Warn);
    }
    let _ = logger.try_init();
}

/// Accept one client session on a thread and script its responses.
fn serve(
    server: &MockServer,
    respond: impl FnOnce(&mut MockSession) + Send + 'static,
) -> thread::JoinHandle<()> {
    let server = server.clone();
    thread::spawn(move || {
        let mut session = server.accept().expect("mock server accept failed");
        respond(&mut session);
    })
}

fn connect(
    server: &MockServer,
    reactor: Option<Reactor>,
) -> (BridgedConnection<MockClient>, MockStats) {
    let connection =
        BridgedConnection::connect(&server.url(), reactor, ConnectOptions::default())
            .expect("mock connect failed");
    (connection, stats_for(server.path()))
}

fn wait_until(what: &str, mut ready: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !ready() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn no_reactor_takes_the_direct_path() {
    init_logs();
    let server = MockServer::start().unwrap();
    let responder = serve(&server, |session| {
        assert_eq!(session.recv_query().unwrap(), "SELECT 1");
        session.respond_rows(&[&["1"]]).unwrap();
    });
    let (connection, stats) = connect(&server, None);

    let rows = connection.execute("SELECT 1", &[]).await.unwrap();
    assert_eq!(rows, vec![vec!["1".to_string()]]);
    assert_eq!(stats.direct_execs(), 1);
    assert_eq!(stats.sent_queries(), 0);
    responder.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bridged_rows_match_the_direct_call() {
    init_logs();
    let rows: &[&[&str]] = &[&["1", "ada"], &["2", "grace"], &["3", "edsger"]];
    let server = MockServer::start().unwrap();
    let reactor = Reactor::start().unwrap();

    let respond = {
        let rows = rows.to_vec();
        move |session: &mut MockSession| {
            session.recv_query().unwrap();
            session.respond_rows(&rows).unwrap();
        }
    };
    let responder = serve(&server, respond.clone());
    let (connection, _) = connect(&server, Some(reactor.clone()));
    let bridged = connection.execute("SELECT id, name FROM people", &[]).await;
    responder.join().unwrap();

    let responder = serve(&server, respond);
    let (direct, _) = connect(&server, None);
    let blocking = direct.execute("SELECT id, name FROM people", &[]).await;
    responder.join().unwrap();

    let bridged = bridged.unwrap();
    assert_eq!(bridged.len(), 3);
    assert_eq!(bridged, blocking.unwrap());
    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_responses_are_drained_until_complete() {
    init_logs();
    let server = MockServer::start().unwrap();
    let reactor = Reactor::start().unwrap();
    let responder = serve(&server, |session| {
        session.recv_query().unwrap();
        session.respond_rows_partial(&[&["first"]]).unwrap();
        thread::sleep(Duration::from_millis(50));
        session.finish_rows().unwrap();
    });
    let (connection, _) = connect(&server, Some(reactor.clone()));

    let rows = connection.execute("SELECT part", &[]).await.unwrap();
    assert_eq!(rows, vec![vec!["first".to_string()]]);
    responder.join().unwrap();
    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_errors_reach_the_caller_and_spare_the_connection() {
    init_logs();
    let server = MockServer::start().unwrap();
    let reactor = Reactor::start().unwrap();
    let responder = serve(&server, |session| {
        session.recv_query().unwrap();
        session.respond_garbage().unwrap();
        session.recv_query().unwrap();
        session.respond_rows(&[&["fine"]]).unwrap();
    });
    let (connection, _) = connect(&server, Some(reactor.clone()));

    let error = connection.execute("SELECT boom", &[]).await.unwrap_err();
    assert!(matches!(error, Error::Driver(_)), "got {:?}", error);

    // The socket survived the malformed response, the next query runs.
    let rows = connection.execute("SELECT after", &[]).await.unwrap();
    assert_eq!(rows, vec![vec!["fine".to_string()]]);
    responder.join().unwrap();
    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn bypass_forces_the_direct_path_while_the_reactor_runs() {
    init_logs();
    let server = MockServer::start().unwrap();
    let reactor = Reactor::start().unwrap();
    let responder = serve(&server, |session| {
        for _ in 0..2 {
            session.recv_query().unwrap();
            session.respond_rows(&[&["ok"]]).unwrap();
        }
    });
    let (connection, stats) = connect(&server, Some(reactor.clone()));
    let direct_before = stats.direct_execs();
    let sent_before = stats.sent_queries();

    {
        let _bypass = connection.bypass().unwrap();
        connection.execute("SELECT guarded", &[]).await.unwrap();
    }
    assert_eq!(stats.direct_execs(), direct_before + 1);
    assert_eq!(stats.sent_queries(), sent_before);

    // After the guard drops, dispatch goes back through the bridge.
    connection.execute("SELECT open", &[]).await.unwrap();
    assert_eq!(stats.sent_queries(), sent_before + 1);
    responder.join().unwrap();
    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn url_parameter_disables_the_bridge() {
    init_logs();
    let server = MockServer::start().unwrap();
    let reactor = Reactor::start().unwrap();
    let responder = serve(&server, |session| {
        session.recv_query().unwrap();
        session.respond_rows(&[&["ok"]]).unwrap();
    });
    let url = format!("{}?async=false", server.url());
    let connection: BridgedConnection<MockClient> =
        BridgedConnection::connect(&url, Some(reactor.clone()), ConnectOptions::default())
            .unwrap();
    let stats = stats_for(server.path());
    assert!(!connection.async_enabled());

    let direct_before = stats.direct_execs();
    connection.execute("SELECT plain", &[]).await.unwrap();
    assert_eq!(stats.direct_execs(), direct_before + 1);
    responder.join().unwrap();
    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn second_dispatch_while_pending_is_rejected() {
    init_logs();
    let server = MockServer::start().unwrap();
    let reactor = Reactor::start().unwrap();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (seen_tx, seen_rx) = mpsc::channel::<()>();
    let responder = serve(&server, move |session| {
        session.recv_query().unwrap();
        seen_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        session.respond_rows(&[&["late"]]).unwrap();
    });
    let (connection, stats) = connect(&server, Some(reactor.clone()));
    let connection = std::sync::Arc::new(connection);

    let racing = std::sync::Arc::clone(&connection);
    let in_flight =
        tokio::spawn(async move { racing.execute("SELECT slow", &[]).await });

    // The first query is on the wire, a second dispatch must be refused
    // without creating another registration.
    seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    let error = connection.execute("SELECT eager", &[]).await.unwrap_err();
    assert!(matches!(error, Error::QueryPending), "got {:?}", error);
    assert_eq!(stats.sent_queries(), 1);

    release_tx.send(()).unwrap();
    let rows = in_flight.await.unwrap().unwrap();
    assert_eq!(rows, vec![vec!["late".to_string()]]);
    responder.join().unwrap();
    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_socket_fails_fast_until_reconnect() {
    init_logs();
    let server = MockServer::start().unwrap();
    let reactor = Reactor::start().unwrap();
    let responder = serve(&server, |session| {
        session.recv_query().unwrap();
        // Hang up instead of answering.
        drop(session);
    });
    let (connection, _) = connect(&server, Some(reactor.clone()));

    let error = connection.execute("SELECT doomed", &[]).await.unwrap_err();
    assert!(matches!(error, Error::Driver(_)), "got {:?}", error);
    responder.join().unwrap();

    // The socket died with the error: no further I/O, just a fast failure.
    assert!(!connection.is_connected());
    let error = connection.execute("SELECT still", &[]).await.unwrap_err();
    assert!(matches!(error, Error::Connection(_)), "got {:?}", error);

    let responder = serve(&server, |session| {
        session.recv_query().unwrap();
        session.respond_rows(&[&["back"]]).unwrap();
    });
    connection.reconnect().unwrap();
    let rows = connection.execute("SELECT revived", &[]).await.unwrap();
    assert_eq!(rows, vec![vec!["back".to_string()]]);
    responder.join().unwrap();
    reactor.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn shut_down_reactor_falls_back_to_direct_dispatch() {
    init_logs();
    let server = MockServer::start().unwrap();
    let reactor = Reactor::start().unwrap();
    let responder = serve(&server, |session| {
        session.recv_query().unwrap();
        session.respond_rows(&[&["ok"]]).unwrap();
    });
    let (connection, stats) = connect(&server, Some(reactor.clone()));

    reactor.shutdown();
    wait_until("the reactor to stop", || !reactor.is_running());
    let direct_before = stats.direct_execs();
    connection.execute("SELECT fallback", &[]).await.unwrap();
    assert_eq!(stats.direct_execs(), direct_before + 1);
    responder.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn adapter_identity_names_the_client() {
    init_logs();
    let server = MockServer::start().unwrap();
    let responder = serve(&server, |_| {});
    let (connection, _) = connect(&server, None);
    assert_eq!(connection.adapter_name(), "pontoon-mock");
    responder.join().unwrap();
}
