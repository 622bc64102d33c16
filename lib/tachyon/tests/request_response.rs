//! Request/response scenarios: correlation with user context, and timeout
//! expiry when the peer never answers.

mod common;

use common::{client_opts, pump_until, server_opts, Ask, Reply};
use ion::reqid::Reqid;
use ion::shared::ErrorCode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tachyon::client::Client;
use tachyon::fabric::mem::MemFabric;
use tachyon::server::Server;

fn connected_pair(port: u16) -> (Arc<Client>, Arc<Server>) {
    let fabric = MemFabric::new();
    let log = ion::logging::build(
        r#"
type = "terminal"
level = "error"
destination = "stderr"
"#,
    );

    let server = Arc::new(Server::new(server_opts(port), Box::new(fabric.clone()), &log));
    server.start().unwrap();

    let client = Arc::new(Client::new(client_opts(port), Box::new(fabric), &log));

    let connected = Arc::new(AtomicBool::new(false));
    let flag = connected.clone();
    client.set_handle_connect(Box::new(move |code| {
        assert_eq!(code, ErrorCode::Ok);
        flag.store(true, Ordering::Relaxed);
    }));

    client.start().unwrap();
    assert!(pump_until(&client, &server, 100, || connected
        .load(Ordering::Relaxed)));

    (client, server)
}

#[test]
fn test_request_response_roundtrip() {
    let (client, server) = connected_pair(9200);

    // the server collects requests; the test drains and answers them, so
    // no handler has to capture the server itself
    let asks: Arc<Mutex<Vec<(u64, Reqid, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = asks.clone();
    server
        .dispatcher()
        .install_request_handler::<Ask, _>(move |source, rid, ask| {
            sink.lock().push((source, rid, ask.0));
        });

    let outcome: Arc<Mutex<Option<(Option<String>, Option<String>, ErrorCode)>>> =
        Arc::new(Mutex::new(None));
    let sink = outcome.clone();
    client
        .dispatcher()
        .install_response_handler::<Ask, Reply, _>(move |ctx, reply, code| {
            let ctx = ctx
                .and_then(|any| any.downcast::<String>().ok())
                .map(|boxed| *boxed);
            *sink.lock() = Some((ctx, reply.map(|r| r.0), code));
        });

    client
        .send_request(
            &Ask("ping".to_string()),
            Some(Box::new("the-context".to_string())),
            None,
        )
        .unwrap();

    assert!(pump_until(&client, &server, 1000, || !asks.lock().is_empty()));

    let (source, rid, body) = asks.lock().pop().unwrap();
    assert_eq!(body, "ping");
    server
        .send_response(source, &rid, &Reply("pong".to_string()))
        .unwrap();

    assert!(pump_until(&client, &server, 1000, || outcome.lock().is_some()));
    assert_eq!(
        outcome.lock().take().unwrap(),
        (
            Some("the-context".to_string()),
            Some("pong".to_string()),
            ErrorCode::Ok
        )
    );
    assert_eq!(client.dispatcher().pending_count(), 0);
}

#[test]
fn test_request_timeout_fires_once() {
    let (client, server) = connected_pair(9201);

    // the server installs no handler for "ask": the request is dropped
    let outcome: Arc<Mutex<Vec<(bool, ErrorCode)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = outcome.clone();
    client
        .dispatcher()
        .install_response_handler::<Ask, Reply, _>(move |_ctx, reply, code| {
            sink.lock().push((reply.is_none(), code));
        });

    client
        .send_request(
            &Ask("ping".to_string()),
            None,
            Some(Duration::from_millis(100)),
        )
        .unwrap();
    assert_eq!(client.dispatcher().pending_count(), 1);

    std::thread::sleep(Duration::from_millis(150));
    assert!(pump_until(&client, &server, 1000, || !outcome.lock().is_empty()));

    assert_eq!(*outcome.lock(), vec![(true, ErrorCode::Timeout)]);
    assert_eq!(client.dispatcher().pending_count(), 0);
}

#[test]
fn test_server_originated_request() {
    let (client, server) = connected_pair(9202);

    // role reversal: the client answers, the server asks
    let asks: Arc<Mutex<Vec<(Reqid, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = asks.clone();
    client
        .dispatcher()
        .install_request_handler::<Ask, _>(move |_source, rid, ask| {
            sink.lock().push((rid, ask.0));
        });

    let outcome: Arc<Mutex<Option<(Option<String>, ErrorCode)>>> = Arc::new(Mutex::new(None));
    let sink = outcome.clone();
    server
        .dispatcher()
        .install_response_handler::<Ask, Reply, _>(move |_ctx, reply, code| {
            *sink.lock() = Some((reply.map(|r| r.0), code));
        });

    let id = server.active_connections()[0];
    server
        .send_request(id, &Ask("who".to_string()), None, None)
        .unwrap();

    assert!(pump_until(&client, &server, 1000, || !asks.lock().is_empty()));

    let (rid, body) = asks.lock().pop().unwrap();
    assert_eq!(body, "who");
    client
        .send_response(&rid, &Reply("me".to_string()))
        .unwrap();

    assert!(pump_until(&client, &server, 1000, || outcome.lock().is_some()));
    assert_eq!(
        outcome.lock().take().unwrap(),
        (Some("me".to_string()), ErrorCode::Ok)
    );
}
