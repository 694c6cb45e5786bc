//! Sustained load: large payloads, tight write budgets, many callers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use parking_lot::Mutex;
use reactor_rpc::config::TransportConfig;
use reactor_rpc::core::value::Value;
use reactor_rpc::protocol::{Method, Request};

/// Budget far below the payload sizes, so every connection keeps landing on
/// the backlog and writes go out in many partial chunks.
fn tight_config() -> TransportConfig {
    TransportConfig {
        write_budget: 4096,
        max_input_buffer_size: 1024,
        max_output_buffer_size: 1024,
        drop_empty_buffers: true,
        ..fast_config()
    }
}

fn blob(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn megabyte_payloads_survive_partial_writes() {
    let server = supervisor(tight_config(), None);
    server.add_method(echo_method());
    server.add_method(Method::new("make", "i", "x", |req: &mut Request| {
        let len = req.params().get(0).and_then(Value::as_i32).unwrap_or(0) as usize;
        req.returns_mut().add(Value::Data(blob(len, 7)));
    }));
    let acceptor = listen_local(&server);
    let client = supervisor(tight_config(), None);
    let target = client.get_target(&local_spec(&acceptor)).unwrap();

    let payload = blob(3 * 1024 * 1024, 1);
    let mut req = Request::new("echo");
    req.params_mut().add(Value::Data(payload.clone()));
    let req = target.invoke_sync(req, Duration::from_secs(30));
    assert!(!req.is_error(), "{}", req.error_message());
    assert_eq!(req.returns().get(0).and_then(Value::as_data), Some(&payload[..]));

    let mut req = Request::new("make");
    req.params_mut().add(2 * 1024 * 1024i32);
    let req = target.invoke_sync(req, Duration::from_secs(30));
    assert_eq!(
        req.returns().get(0).and_then(Value::as_data),
        Some(&blob(2 * 1024 * 1024, 7)[..])
    );
}

#[test]
fn many_requests_in_flight_all_complete() {
    let server = supervisor(tight_config(), None);
    server.add_method(echo_method());
    let acceptor = listen_local(&server);
    let client = supervisor(tight_config(), None);
    let target = client.get_target(&local_spec(&acceptor)).unwrap();

    let total = 500;
    let ok = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let mut pending = Vec::with_capacity(total);
    for i in 0..total {
        let expected = blob(16 * 1024, i as u8);
        let mut req = Request::new("echo");
        req.params_mut().add(i as i32).add(Value::Data(expected.clone()));
        let ok = ok.clone();
        let failures = failures.clone();
        pending.push(target.invoke_async(req, Duration::from_secs(30), move |done| {
            let matches = done.returns().get(0).and_then(Value::as_i32) == Some(i as i32)
                && done.returns().get(1).and_then(Value::as_data) == Some(&expected[..]);
            if matches {
                ok.fetch_add(1, Ordering::SeqCst);
            } else {
                failures.lock().push((i, done.error_code()));
            }
        }));
    }

    assert!(wait_for(Duration::from_secs(30), || {
        ok.load(Ordering::SeqCst) + failures.lock().len() == total
    }));
    assert!(failures.lock().is_empty(), "{:?}", failures.lock());
    assert!(pending.iter().all(|p| p.is_done()));
    assert_eq!(target.connection().pending_replies(), 0);
}

#[test]
fn many_clients_share_few_reactors() {
    let server = supervisor(tight_config(), None);
    server.add_method(echo_method());
    let acceptor = listen_local(&server);
    let spec = local_spec(&acceptor);

    let handles: Vec<_> = (0..8i32)
        .map(|c| {
            let spec = spec.clone();
            std::thread::spawn(move || {
                let client = supervisor(tight_config(), None);
                let target = client.get_target(&spec).unwrap();
                for i in 0..50i32 {
                    let mut req = Request::new("echo");
                    req.params_mut()
                        .add(c * 1000 + i)
                        .add(Value::Data(blob(8 * 1024, i as u8)));
                    let done = target.invoke_sync(req, Duration::from_secs(30));
                    assert_eq!(
                        done.returns().get(0).and_then(Value::as_i32),
                        Some(c * 1000 + i),
                        "client {c} request {i}: {}",
                        done.error_message()
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(server.metrics().connections_total, 8);
}

#[test]
fn oversized_packet_closes_connection() {
    let small = TransportConfig {
        max_packet_size: 64 * 1024,
        ..fast_config()
    };
    let server = supervisor(small.clone(), None);
    server.add_method(echo_method());
    let acceptor = listen_local(&server);
    let client = plain_supervisor();
    let target = client.get_target(&local_spec(&acceptor)).unwrap();

    let mut req = Request::new("echo");
    req.params_mut().add(Value::Data(vec![0u8; 128 * 1024]));
    let req = target.invoke_sync(req, Duration::from_secs(10));
    assert_eq!(req.error_code(), reactor_rpc::ErrorCode::CONNECTION);
    assert!(wait_for(Duration::from_secs(5), || {
        server.metrics().protocol_errors >= 1
    }));
}
