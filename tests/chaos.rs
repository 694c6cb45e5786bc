//! Chaos tests
//!
//! Peers vanishing, servers restarting and connections dropped mid-request.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use reactor_rpc::protocol::{ErrorCode, Method, Request};
use reactor_rpc::transport::ConnectionState;
use reactor_rpc::Spec;

#[test]
fn server_shutdown_fails_requests_in_flight() {
    let server = plain_supervisor();
    server.add_method(Method::new("hang", "", "", |req: &mut Request| {
        std::mem::forget(req.detach());
    }));
    let acceptor = listen_local(&server);
    let client = plain_supervisor();
    let target = client.get_target(&local_spec(&acceptor)).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    for _ in 0..10 {
        let tx = tx.clone();
        target.invoke_async(Request::new("hang"), Duration::from_secs(30), move |req| {
            let _ = tx.send(req.error_code());
        });
    }
    assert!(wait_for(Duration::from_secs(5), || {
        server.metrics().packets_received >= 10
    }));

    drop(acceptor);
    server.shutdown(true);
    for _ in 0..10 {
        let code = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(code, ErrorCode::CONNECTION);
    }
    assert!(wait_for(Duration::from_secs(5), || {
        target.state() == ConnectionState::Closed
    }));
}

#[test]
fn peer_resetting_mid_handshake_closes_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let client = plain_supervisor();
    let target = client
        .get_target(&Spec::from_host_port("127.0.0.1", port))
        .unwrap();
    drop(listener.accept().unwrap());

    let req = target.invoke_sync(Request::new("frt.rpc.ping"), CALL_TIMEOUT);
    assert_eq!(req.error_code(), ErrorCode::CONNECTION);
    assert!(!target.is_valid());
}

#[test]
fn new_target_after_server_restart() {
    let first = plain_supervisor();
    first.add_method(echo_method());
    let acceptor = listen_local(&first);
    let port = acceptor.local_port();
    let client = plain_supervisor();
    let spec = Spec::from_host_port("127.0.0.1", port);

    let old = client.get_target(&spec).unwrap();
    assert!(!old.invoke_sync(Request::new("echo"), CALL_TIMEOUT).is_error());

    drop(acceptor);
    first.shutdown(true);
    assert!(wait_for(Duration::from_secs(5), || !old.is_valid()));

    let second = plain_supervisor();
    second.add_method(echo_method());
    let _acceptor = second
        .listen(&Spec::from_host_port("127.0.0.1", port))
        .unwrap();
    let fresh = client.get_target(&spec).unwrap();
    assert!(!fresh.invoke_sync(Request::new("echo"), CALL_TIMEOUT).is_error());
    assert_eq!(
        old.invoke_sync(Request::new("echo"), CALL_TIMEOUT).error_code(),
        ErrorCode::CONNECTION
    );
}

#[test]
fn listen_on_taken_port_fails() {
    let server = plain_supervisor();
    let acceptor = listen_local(&server);
    let other = plain_supervisor();
    let err = other.listen(&local_spec(&acceptor)).unwrap_err();
    assert!(matches!(err, reactor_rpc::ProtocolError::Listen { .. }));
}

#[test]
fn dropping_client_mid_request_is_harmless() {
    let server = plain_supervisor();
    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    {
        let hits = hits.clone();
        server.add_method(Method::new("slow", "", "", move |req: &mut Request| {
            hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let detached = req.detach();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                detached.done();
            });
        }));
    }
    let acceptor = listen_local(&server);
    {
        let client = plain_supervisor();
        let target = client.get_target(&local_spec(&acceptor)).unwrap();
        target.invoke_async(Request::new("slow"), CALL_TIMEOUT, |_| {});
        assert!(wait_for(Duration::from_secs(5), || {
            hits.load(std::sync::atomic::Ordering::SeqCst) == 1
        }));
    }
    std::thread::sleep(Duration::from_millis(200));
    assert!(wait_for(Duration::from_secs(5), || {
        server.metrics().connections_active == 0
    }));

    // server still serves new clients
    let client = plain_supervisor();
    let target = client.get_target(&local_spec(&acceptor)).unwrap();
    assert!(!target
        .invoke_sync(Request::new("frt.rpc.ping"), CALL_TIMEOUT)
        .is_error());
}
