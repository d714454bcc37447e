/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The single-instance guard: a second invocation must defer to a live
//! supervisor and must ignore a stale or misbehaving socket.

use std::os::unix::net::UnixListener;

use sandstorm_supervisor::rpc;
use sandstorm_supervisor::rpc::SupervisorRequest;
use sandstorm_supervisor::rpc::SupervisorResponse;
use sandstorm_supervisor::supervisor::existing_supervisor_took_over;

#[test]
fn defers_to_a_live_supervisor() {
    let dir = tempfile::tempdir().unwrap();
    let listener = UnixListener::bind(dir.path().join(rpc::SOCKET_NAME)).unwrap();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let request: SupervisorRequest = rpc::blocking::read_frame(&mut stream).unwrap();
        assert_eq!(request, SupervisorRequest::KeepAlive);
        rpc::blocking::write_frame(&mut stream, &SupervisorResponse::Ok).unwrap();
    });

    assert!(existing_supervisor_took_over(dir.path()));
    server.join().unwrap();
}

#[test]
fn proceeds_when_no_socket_exists() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!existing_supervisor_took_over(dir.path()));
}

#[test]
fn proceeds_when_the_socket_is_stale() {
    let dir = tempfile::tempdir().unwrap();
    // A socket node with nobody listening behind it.
    drop(UnixListener::bind(dir.path().join(rpc::SOCKET_NAME)).unwrap());
    assert!(!existing_supervisor_took_over(dir.path()));
}

#[test]
fn proceeds_when_the_peer_misbehaves() {
    let dir = tempfile::tempdir().unwrap();
    let listener = UnixListener::bind(dir.path().join(rpc::SOCKET_NAME)).unwrap();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _request: SupervisorRequest = rpc::blocking::read_frame(&mut stream).unwrap();
        rpc::blocking::write_frame(
            &mut stream,
            &SupervisorResponse::Error {
                message: "not today".to_string(),
            },
        )
        .unwrap();
    });

    assert!(!existing_supervisor_took_over(dir.path()));
    server.join().unwrap();
}
