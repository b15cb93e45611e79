//! Tests for the client wire protocol
//!
//! These tests verify:
//! - Frame layout for requests and responses
//! - Cluster administration requests (JOIN, REMOVE, STATS)
//! - NOT_LEADER responses carrying the leader address
//! - Rejection of malformed and oversized frames
//! - Stream helpers over a byte buffer

use std::io::Cursor;

use ledgerkv::protocol::{
    decode_request, decode_response, encode_request, encode_response, read_request,
    read_response, write_request, write_response, Request, RequestType, Response, Status,
    HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
use ledgerkv::LedgerError;

// =============================================================================
// Helper Functions
// =============================================================================

fn protocol_error(result: ledgerkv::Result<Request>) -> String {
    match result {
        Err(LedgerError::Protocol(msg)) => msg,
        other => panic!("expected protocol error, got {:?}", other),
    }
}

fn raw_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![tag];
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

// =============================================================================
// Request Encoding Tests
// =============================================================================

#[test]
fn test_get_request_layout() {
    let bytes = encode_request(&Request::Get {
        key: b"user".to_vec(),
    });

    assert_eq!(bytes[0], RequestType::Get as u8);
    assert_eq!(&bytes[1..5], &8u32.to_be_bytes());
    assert_eq!(&bytes[5..9], &4u32.to_be_bytes());
    assert_eq!(&bytes[9..], b"user");
}

#[test]
fn test_put_request_carries_json_value() {
    let request = Request::Put {
        key: b"cfg".to_vec(),
        value: br#"{"depth":3}"#.to_vec(),
    };

    let decoded = decode_request(&encode_request(&request)).unwrap();
    assert_eq!(decoded, request);
}

#[test]
fn test_put_with_empty_value() {
    let request = Request::Put {
        key: b"k".to_vec(),
        value: Vec::new(),
    };
    assert_eq!(decode_request(&encode_request(&request)).unwrap(), request);
}

#[test]
fn test_ping_and_stats_have_empty_payload() {
    for request in [Request::Ping, Request::Stats] {
        let bytes = encode_request(&request);
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(decode_request(&bytes).unwrap(), request);
    }
}

#[test]
fn test_join_request_layout() {
    let request = Request::Join {
        id: 7,
        addr: "10.0.0.7:6000".to_string(),
    };
    let bytes = encode_request(&request);

    assert_eq!(bytes[0], 0x10);
    assert_eq!(&bytes[5..13], &7u64.to_be_bytes());
    assert_eq!(&bytes[13..], b"10.0.0.7:6000");
    assert_eq!(decode_request(&bytes).unwrap(), request);
}

#[test]
fn test_remove_request() {
    let request = Request::Remove { id: 42 };
    let bytes = encode_request(&request);

    assert_eq!(bytes[0], 0x11);
    assert_eq!(bytes.len(), HEADER_SIZE + 8);
    assert_eq!(decode_request(&bytes).unwrap(), request);
}

// =============================================================================
// Malformed Request Tests
// =============================================================================

#[test]
fn test_unknown_command_type() {
    let msg = protocol_error(decode_request(&raw_frame(0x7f, &[])));
    assert!(msg.contains("Unknown command type: 0x7f"));
}

#[test]
fn test_truncated_header() {
    let msg = protocol_error(decode_request(&[0x01, 0x00]));
    assert!(msg.contains("Incomplete request header"));
}

#[test]
fn test_truncated_payload() {
    let mut bytes = encode_request(&Request::Get {
        key: b"abcdef".to_vec(),
    });
    bytes.truncate(bytes.len() - 2);

    let msg = protocol_error(decode_request(&bytes));
    assert!(msg.contains("Incomplete request payload"));
}

#[test]
fn test_key_length_past_payload() {
    let mut payload = 100u32.to_be_bytes().to_vec();
    payload.extend_from_slice(b"short");

    let msg = protocol_error(decode_request(&raw_frame(0x01, &payload)));
    assert!(msg.contains("GET command: incomplete key"));
}

#[test]
fn test_missing_key_length() {
    let msg = protocol_error(decode_request(&raw_frame(0x03, &[0, 1])));
    assert!(msg.contains("DELETE command: missing key length"));
}

#[test]
fn test_join_without_node_id() {
    let msg = protocol_error(decode_request(&raw_frame(0x10, &[1, 2, 3])));
    assert!(msg.contains("JOIN command: missing node id"));
}

#[test]
fn test_ping_with_payload_is_rejected() {
    let msg = protocol_error(decode_request(&raw_frame(0x04, b"xx")));
    assert!(msg.contains("unexpected payload of 2 bytes"));
}

#[test]
fn test_oversized_payload_is_rejected_before_reading() {
    let mut bytes = vec![0x01];
    bytes.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());

    let msg = protocol_error(read_request(&mut Cursor::new(bytes)));
    assert!(msg.contains("Payload too large"));
}

// =============================================================================
// Response Tests
// =============================================================================

#[test]
fn test_response_statuses_roundtrip() {
    let responses = [
        Response::ok(Some(b"{\"a\":1}".to_vec())),
        Response::ok(None),
        Response::not_found(),
        Response::error("boom"),
        Response::not_leader(Some("127.0.0.1:5001")),
    ];

    for response in responses {
        let decoded = decode_response(&encode_response(&response)).unwrap();
        assert_eq!(decoded, response);
    }
}

#[test]
fn test_not_leader_without_known_leader() {
    let bytes = encode_response(&Response::not_leader(None));
    assert_eq!(bytes, vec![0x03, 0, 0, 0, 0]);

    let decoded = decode_response(&bytes).unwrap();
    assert_eq!(decoded.status, Status::NotLeader);
    assert_eq!(decoded.payload, None);
}

#[test]
fn test_from_error_maps_not_leader() {
    let err = LedgerError::NotLeader {
        leader: Some("10.0.0.1:5000".to_string()),
    };
    let response = Response::from_error(&err);

    assert_eq!(response.status, Status::NotLeader);
    assert_eq!(response.payload_str().as_deref(), Some("10.0.0.1:5000"));
}

#[test]
fn test_from_error_uses_message() {
    let response = Response::from_error(&LedgerError::Protocol("bad frame".to_string()));

    assert_eq!(response.status, Status::Error);
    assert!(response.payload_str().unwrap().contains("bad frame"));
}

#[test]
fn test_unknown_response_status() {
    let result = decode_response(&[0x09, 0, 0, 0, 0]);
    assert!(matches!(result, Err(LedgerError::Protocol(_))));
}

// =============================================================================
// Stream Tests
// =============================================================================

#[test]
fn test_stream_carries_consecutive_requests() {
    let mut buffer = Vec::new();
    write_request(&mut buffer, &Request::Ping).unwrap();
    write_request(
        &mut buffer,
        &Request::Put {
            key: b"k".to_vec(),
            value: b"1".to_vec(),
        },
    )
    .unwrap();
    write_request(&mut buffer, &Request::Stats).unwrap();

    let mut cursor = Cursor::new(buffer);
    assert_eq!(read_request(&mut cursor).unwrap(), Request::Ping);
    assert!(matches!(
        read_request(&mut cursor).unwrap(),
        Request::Put { .. }
    ));
    assert_eq!(read_request(&mut cursor).unwrap(), Request::Stats);
    assert!(matches!(read_request(&mut cursor), Err(LedgerError::Io(_))));
}

#[test]
fn test_stream_response() {
    let mut buffer = Vec::new();
    write_response(&mut buffer, &Response::ok(Some(b"PONG".to_vec()))).unwrap();

    let response = read_response(&mut Cursor::new(buffer)).unwrap();
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.payload_str().as_deref(), Some("PONG"));
}
