//! Many threads sharing one connection, in both directions at once.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use reactor_rpc::core::value::Value;
use reactor_rpc::protocol::{Method, Request, Target};

#[test]
fn concurrent_sync_callers_get_their_own_answers() {
    let server = plain_supervisor();
    server.add_method(echo_method());
    let acceptor = listen_local(&server);
    let client = plain_supervisor();
    let target = client.get_target(&local_spec(&acceptor)).unwrap();

    let handles: Vec<_> = (0..16i32)
        .map(|t| {
            let target = target.clone();
            std::thread::spawn(move || {
                for i in 0..100i32 {
                    let tag = t * 10_000 + i;
                    let mut req = Request::new("echo");
                    req.params_mut().add(tag);
                    let done = target.invoke_sync(req, CALL_TIMEOUT);
                    assert_eq!(
                        done.returns().get(0).and_then(Value::as_i32),
                        Some(tag),
                        "{}",
                        done.error_message()
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(target.connection().pending_replies(), 0);
}

#[test]
fn both_peers_invoke_at_once() {
    // each side serves "twice" and hammers the other side with it
    let twice = || {
        Method::new("twice", "i", "i", |req: &mut Request| {
            let n = req.params().get(0).and_then(Value::as_i32).unwrap_or(0);
            req.returns_mut().add(n * 2);
        })
    };
    let server = plain_supervisor();
    server.add_method(twice());
    let server_saw = Arc::new(parking_lot::Mutex::new(None::<Target>));
    {
        let server_saw = server_saw.clone();
        server.add_method(Method::new("hello", "", "", move |req: &mut Request| {
            if let Some(conn) = req.connection() {
                *server_saw.lock() = Some(Target::new(conn.clone()));
            }
        }));
    }
    let acceptor = listen_local(&server);
    let client = plain_supervisor();
    client.add_method(twice());
    let to_server = client.get_target(&local_spec(&acceptor)).unwrap();
    assert!(!to_server
        .invoke_sync(Request::new("hello"), CALL_TIMEOUT)
        .is_error());
    let to_client = server_saw.lock().clone().unwrap();

    let ok = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = [to_server, to_client]
        .into_iter()
        .flat_map(|target| {
            let ok = ok.clone();
            (0..4i32).map(move |t| {
                let target = target.clone();
                let ok = ok.clone();
                std::thread::spawn(move || {
                    for i in 0..200i32 {
                        let n = t * 1000 + i;
                        let mut req = Request::new("twice");
                        req.params_mut().add(n);
                        let done = target.invoke_sync(req, CALL_TIMEOUT);
                        if done.returns().get(0).and_then(Value::as_i32) == Some(n * 2) {
                            ok.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(ok.load(Ordering::SeqCst), 2 * 4 * 200);
}

#[test]
fn request_ids_never_collide_across_sides() {
    let server = plain_supervisor();
    let acceptor = listen_local(&server);
    let client = plain_supervisor();
    let target = client.get_target(&local_spec(&acceptor)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        server.metrics().connections_active == 1
    }));

    let client_conn = target.connection();
    assert!(!client_conn.is_server());
    let ids: Vec<u32> = (0..1000).map(|_| client_conn.allocate_request_id()).collect();
    assert!(ids.iter().all(|id| id & 1 == 0));
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
}
