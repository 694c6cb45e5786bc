//! Edge case tests for framing, the method registry and request lifecycles

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::time::{Duration, Instant};

use common::*;
use reactor_rpc::core::packet::{decode_frame, Packet, PacketBody, HEADER_LENGTH};
use reactor_rpc::core::value::{Value, Values};
use reactor_rpc::error::ProtocolError;
use reactor_rpc::protocol::{ErrorCode, Method, MethodRegistry, Request};

const MAX: usize = 16 * 1024 * 1024;

fn header(declared: u32, code: u16, id: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LENGTH);
    bytes.extend_from_slice(&declared.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.extend_from_slice(&code.to_be_bytes());
    bytes.extend_from_slice(&id.to_be_bytes());
    bytes
}

// ============================================================================
// FRAMING
// ============================================================================

#[test]
fn test_empty_reply_is_header_plus_count() {
    let bytes = Packet::reply(3, Values::new()).to_bytes();
    assert_eq!(bytes.len(), HEADER_LENGTH + 4);
    let (_, packet) = decode_frame(&bytes, MAX).unwrap().unwrap();
    assert_eq!(packet.body, PacketBody::Reply { values: Values::new() });
}

#[test]
fn test_empty_buffer_needs_more() {
    assert!(decode_frame(&[], MAX).unwrap().is_none());
    assert!(decode_frame(&[0, 0, 0], MAX).unwrap().is_none());
}

#[test]
fn test_unknown_packet_code_rejected_from_header_alone() {
    // body never arrives, the header is already enough to fail
    let bytes = header(100, 55, 1);
    assert!(matches!(
        decode_frame(&bytes, MAX),
        Err(ProtocolError::InvalidPacket(_))
    ));
}

#[test]
fn test_oversized_declared_length_rejected_early() {
    let bytes = header(u32::MAX - 4, 101, 1);
    assert!(matches!(
        decode_frame(&bytes, 1024 * 1024),
        Err(ProtocolError::OversizedPacket(_))
    ));
}

#[test]
fn test_packet_exactly_at_limit_accepted() {
    let mut values = Values::new();
    values.add(Value::Data(vec![1u8; 1000]));
    let packet = Packet::reply(9, values);
    let limit = packet.packet_length();
    let bytes = packet.to_bytes();
    assert!(decode_frame(&bytes, limit).unwrap().is_some());
    assert!(decode_frame(&bytes, limit - 1).is_err());
}

#[test]
fn test_trailing_bytes_inside_frame_rejected() {
    let mut bytes = Packet::reply(1, Values::new()).to_bytes();
    bytes.extend_from_slice(&[0, 0]);
    let declared = (bytes.len() - 4) as u32;
    bytes[..4].copy_from_slice(&declared.to_be_bytes());
    assert!(decode_frame(&bytes, MAX).is_err());
}

#[test]
fn test_invalid_utf8_method_name_rejected() {
    let mut body = Vec::new();
    body.extend_from_slice(&2u32.to_be_bytes());
    body.extend_from_slice(&[0xff, 0xfe]);
    body.extend_from_slice(&0u32.to_be_bytes());
    let mut bytes = header((HEADER_LENGTH - 4 + body.len()) as u32, 100, 1);
    bytes.extend_from_slice(&body);
    assert!(decode_frame(&bytes, MAX).is_err());
}

#[test]
fn test_unknown_value_tag_rejected() {
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_be_bytes());
    body.push(b'?');
    let mut bytes = header((HEADER_LENGTH - 4 + body.len()) as u32, 101, 1);
    bytes.extend_from_slice(&body);
    assert!(decode_frame(&bytes, MAX).is_err());
}

#[test]
fn test_array_count_larger_than_frame_rejected() {
    // claims a billion ints in a tiny frame
    let mut body = Vec::new();
    body.extend_from_slice(&1u32.to_be_bytes());
    body.push(b'I');
    body.extend_from_slice(&1_000_000_000u32.to_be_bytes());
    let mut bytes = header((HEADER_LENGTH - 4 + body.len()) as u32, 101, 1);
    bytes.extend_from_slice(&body);
    assert!(decode_frame(&bytes, MAX).is_err());
}

#[test]
fn test_error_message_with_invalid_utf8_is_lossy() {
    let mut body = Vec::new();
    body.extend_from_slice(&77u32.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes());
    body.push(0xff);
    let mut bytes = header((HEADER_LENGTH - 4 + body.len()) as u32, 102, 5);
    bytes.extend_from_slice(&body);
    let (_, packet) = decode_frame(&bytes, MAX).unwrap().unwrap();
    assert!(matches!(packet.body, PacketBody::Error { code: 77, .. }));
}

// ============================================================================
// REGISTRY
// ============================================================================

#[test]
fn test_registry_unicode_and_empty_names() {
    let registry = MethodRegistry::new();
    registry.register(Method::new("", "", "", |_req: &mut Request| {}));
    registry.register(Method::new("метод.名前", "", "", |_req: &mut Request| {}));
    assert!(registry.lookup("").is_some());
    assert!(registry.lookup("метод.名前").is_some());
    assert!(registry.lookup("метод").is_none());
}

#[test]
fn test_registry_override_returns_previous() {
    let registry = MethodRegistry::new();
    assert!(registry
        .register(Method::new("m", "i", "", |_req: &mut Request| {}))
        .is_none());
    let old = registry
        .register(Method::new("m", "s", "", |_req: &mut Request| {}))
        .unwrap();
    assert_eq!(old.param_types(), "i");
    assert_eq!(registry.lookup("m").unwrap().param_types(), "s");
    assert_eq!(registry.len(), 1);
}

// ============================================================================
// REQUEST LIFECYCLE
// ============================================================================

#[test]
fn test_zero_timeout_still_completes() {
    let server = plain_supervisor();
    server.add_method(Method::new("hold", "", "", |req: &mut Request| {
        let detached = req.detach();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            detached.done();
        });
    }));
    let acceptor = listen_local(&server);
    let client = plain_supervisor();
    let target = client.get_target(&local_spec(&acceptor)).unwrap();

    let started = Instant::now();
    let req = target.invoke_sync(Request::new("hold"), Duration::ZERO);
    assert_eq!(req.error_code(), ErrorCode::TIMEOUT);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_request_reused_after_error() {
    let server = plain_supervisor();
    server.add_method(echo_method());
    let acceptor = listen_local(&server);
    let client = plain_supervisor();
    let target = client.get_target(&local_spec(&acceptor)).unwrap();

    let mut req = Request::new("nope");
    req.params_mut().add(1i32);
    let mut req = target.invoke_sync(req, CALL_TIMEOUT);
    assert_eq!(req.error_code(), ErrorCode::NO_SUCH_METHOD);

    // invoking again clears the previous outcome
    req = Request::new("echo");
    req.params_mut().add(2i32);
    let req = target.invoke_sync(req, CALL_TIMEOUT);
    let again = target.invoke_sync(req, CALL_TIMEOUT);
    assert!(!again.is_error());
    assert_eq!(again.returns().len(), 1);
    assert_eq!(again.returns().get(0).and_then(Value::as_i32), Some(2));
}

#[test]
fn test_empty_string_and_empty_arrays_round_trip() {
    let server = plain_supervisor();
    server.add_method(echo_method());
    let acceptor = listen_local(&server);
    let client = plain_supervisor();
    let target = client.get_target(&local_spec(&acceptor)).unwrap();

    let mut req = Request::new("echo");
    req.params_mut()
        .add("")
        .add(Value::StringArray(Vec::new()))
        .add(Value::Data(Vec::new()))
        .add(Value::DoubleArray(Vec::new()));
    let req = target.invoke_sync(req, CALL_TIMEOUT);
    assert!(!req.is_error());
    assert_eq!(req.returns().type_string(), "sSxD");
}

#[test]
fn test_error_codes_have_messages() {
    for code in [
        ErrorCode::GENERAL_ERROR,
        ErrorCode::NO_SUCH_METHOD,
        ErrorCode::WRONG_PARAMS,
        ErrorCode::TIMEOUT,
        ErrorCode::CONNECTION,
        ErrorCode::ABORT,
        ErrorCode::PERMISSION_DENIED,
    ] {
        assert!(ErrorCode::message(code).starts_with("(RPC)"));
    }
}
