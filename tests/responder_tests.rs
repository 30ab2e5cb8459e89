//! Responder integration tests against the mock transport.
//!
//! Exercises response correlation, orphan draining, timeouts,
//! cancellation and sticky session failure without any real socket.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::MockTransport;
use iiod_client::Error;
use iiod_client::proto::{Command, HDR_LEN, Opcode};
use iiod_client::responder::Responder;
use iiod_client::transport::Transport;

fn response(client_id: u16, code: i32) -> [u8; HDR_LEN] {
    Command::new(Opcode::Response, 0, client_id, code).to_bytes()
}

fn setup(timeout_ms: u32) -> (Arc<MockTransport>, Arc<Responder>) {
    let mock = MockTransport::new(timeout_ms);
    let xport: Arc<dyn Transport> = mock.clone();
    let responder = Responder::new(xport, timeout_ms);
    (mock, responder)
}

#[test]
fn exec_writes_header_then_payload() {
    let (mock, responder) = setup(1000);
    let io = responder.create_io();

    let cmd = Command::new(Opcode::WriteAttr, 3, io.client_id(), 7);
    io.get_response_async(Vec::new()).unwrap();
    io.send_command_async(cmd, vec![vec![0xAA, 0xBB], vec![0xCC]])
        .unwrap();

    let written = mock.wait_written(HDR_LEN + 3);
    assert_eq!(&written[..HDR_LEN], &cmd.to_bytes());
    assert_eq!(&written[HDR_LEN..], &[0xAA, 0xBB, 0xCC]);

    mock.push(&response(io.client_id(), 0));
    assert_eq!(io.wait_for_response().unwrap(), 0);
    responder.shutdown();
}

#[test]
fn responses_correlate_by_client_id_out_of_order() {
    let (mock, responder) = setup(2000);
    let first = responder.create_io();
    let second = responder.create_io();
    assert_ne!(first.client_id(), second.client_id());

    first.get_response_async(vec![vec![0u8; 4]]).unwrap();
    second.get_response_async(vec![vec![0u8; 4]]).unwrap();

    // Answer the second request first, with payload.
    mock.push(&response(second.client_id(), 4));
    mock.push(&[9, 9, 9, 9]);
    assert_eq!(second.wait_for_response().unwrap(), 4);
    assert_eq!(second.take_response_buffers()[0], [9, 9, 9, 9]);

    mock.push(&response(first.client_id(), 4));
    mock.push(&[1, 2, 3, 4]);
    assert_eq!(first.wait_for_response().unwrap(), 4);
    assert_eq!(first.take_response_buffers()[0], [1, 2, 3, 4]);
    responder.shutdown();
}

#[test]
fn negative_code_maps_to_error() {
    let (mock, responder) = setup(1000);
    let io = responder.create_io();
    io.get_response_async(Vec::new()).unwrap();
    mock.push(&response(io.client_id(), -22));
    assert_eq!(io.wait_for_response(), Err(Error::InvalidArg));
    responder.shutdown();
}

#[test]
fn orphan_response_is_drained_and_session_stays_healthy() {
    let (mock, responder) = setup(2000);

    // Nobody waits for client 0xDEAD: header + 8 payload bytes must
    // both be consumed.
    mock.push(&response(0xDEAD, 8));
    mock.push(&[0xEE; 8]);

    // A legitimate exchange right after must complete normally.
    let io = responder.create_io();
    io.get_response_async(vec![vec![0u8; 2]]).unwrap();
    mock.push(&response(io.client_id(), 2));
    mock.push(&[0x42, 0x43]);

    assert_eq!(io.wait_for_response().unwrap(), 2);
    assert_eq!(io.take_response_buffers()[0], [0x42, 0x43]);
    responder.shutdown();
}

#[test]
fn oversized_response_truncates_to_capacity() {
    let (mock, responder) = setup(2000);
    let io = responder.create_io();

    // 6 payload bytes declared, 4 bytes of capacity registered.
    io.get_response_async(vec![vec![0u8; 4]]).unwrap();
    mock.push(&response(io.client_id(), 6));
    mock.push(&[1, 2, 3, 4, 5, 6]);

    assert_eq!(io.wait_for_response().unwrap(), 6);
    assert_eq!(io.take_response_buffers()[0], [1, 2, 3, 4]);

    // The 2 excess bytes must not linger on the wire.
    let probe = responder.create_io();
    probe.get_response_async(vec![vec![0u8; 1]]).unwrap();
    mock.push(&response(probe.client_id(), 1));
    mock.push(&[7]);
    assert_eq!(probe.wait_for_response().unwrap(), 1);
    assert_eq!(probe.take_response_buffers()[0], [7]);
    responder.shutdown();
}

#[test]
fn timeout_returns_and_unlinks() {
    let (_mock, responder) = setup(100);
    let io = responder.create_io();

    io.get_response_async(vec![vec![0u8; 4]]).unwrap();
    let start = Instant::now();
    assert_eq!(io.wait_for_response(), Err(Error::TimedOut));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "returned too early");
    assert!(elapsed < Duration::from_secs(2), "deadline not honoured");

    // Unlinked: cancelling afterwards is a no-op that must not hang.
    io.cancel();
    responder.shutdown();
}

#[test]
fn zero_timeout_waits_until_response() {
    let (mock, responder) = setup(1000);
    let io = responder.create_io();
    io.set_timeout(0); // never time out

    io.get_response_async(Vec::new()).unwrap();
    let io_thread = io.clone();
    let handle = std::thread::spawn(move || io_thread.wait_for_response());

    std::thread::sleep(Duration::from_millis(150));
    mock.push(&response(io.client_id(), 5));
    assert_eq!(handle.join().unwrap().unwrap(), 5);
    responder.shutdown();
}

#[test]
fn cancel_wakes_waiter_with_cancelled() {
    let (_mock, responder) = setup(0);
    let io = responder.create_io();
    io.set_timeout(0);

    io.get_response_async(Vec::new()).unwrap();
    let io_thread = io.clone();
    let handle = std::thread::spawn(move || io_thread.wait_for_response());

    std::thread::sleep(Duration::from_millis(50));
    io.cancel();
    assert_eq!(handle.join().unwrap(), Err(Error::Cancelled));

    // Idempotent.
    io.cancel();
    responder.shutdown();
}

#[test]
fn peer_hangup_poisons_the_session() {
    let (mock, responder) = setup(5000);
    let io = responder.create_io();
    io.get_response_async(Vec::new()).unwrap();

    mock.close();

    assert_eq!(io.wait_for_response(), Err(Error::BrokenPipe));

    // Sticky: everything after fails fast with the same code.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(responder.session_error(), Some(Error::BrokenPipe));
    let late = responder.create_io();
    assert_eq!(late.get_response_async(Vec::new()), Err(Error::BrokenPipe));
    responder.shutdown();
}

#[test]
fn incoming_command_is_rejected_with_einval() {
    let (mock, responder) = setup(2000);

    // Server-initiated command (not a RESPONSE): the client must
    // answer with -EINVAL for that client id.
    mock.push(&Command::new(Opcode::Print, 0, 0x0042, 0).to_bytes());

    let written = mock.wait_written(HDR_LEN);
    let reply = Command::from_bytes(&written[..HDR_LEN].try_into().unwrap());
    assert_eq!(reply.opcode(), Some(Opcode::Response));
    assert_eq!(reply.client_id, 0x0042);
    assert_eq!(reply.code, -22);
    responder.shutdown();
}

#[test]
fn shutdown_is_idempotent_and_fails_new_work() {
    let (_mock, responder) = setup(100);
    responder.shutdown();
    responder.shutdown();

    let io = responder.create_io();
    assert!(io.get_response_async(Vec::new()).is_err());
}
