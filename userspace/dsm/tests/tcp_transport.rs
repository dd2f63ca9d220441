// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Coordinator over real loopback sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nexus_dsm::client::{ClientEnv, ClientSession, SimPageTable, StaticResolver};
use nexus_dsm::server::{OwnershipDirectory, Server};
use nexus_dsm::wire::HEADER_LEN;
use nexus_dsm::{
    AckCode, AddressSpaceId, ClientConfig, Connection, Message, Opcode, PageData, PageIdentity,
    ServerConfig, Wait, PAGE_SIZE,
};

const PATIENCE: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    directory: Arc<OwnershipDirectory>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Running {
    fn start() -> Self {
        // Generous command timeout: tests answer commands by hand.
        let config = ServerConfig {
            listen: "127.0.0.1:0".into(),
            poll_interval_ms: 1,
            command_timeout_ms: 2_000,
            ..ServerConfig::default()
        };
        let mut server = Server::bind(config).unwrap();
        let addr = server.local_addr().unwrap();
        let directory = server.directory();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || server.serve_until(&stop))
        };
        Self { addr, directory, stop, handle: Some(handle) }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn ping_and_join_round_trip() {
    let server = Running::start();
    let mut conn = Connection::connect(server.addr).unwrap();

    let ping = Message::request(Opcode::PingAlive, AddressSpaceId(1), 0, 7);
    conn.send(&ping).unwrap();
    let reply = conn.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert!(reply.is_ack_for(&ping, AckCode::PingAlive));

    let join = Message::request(Opcode::InitialRead, AddressSpaceId(1), 0x3000, 7);
    conn.send(&join).unwrap();
    let reply = conn.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert!(reply.is_ack_for(&join, AckCode::InitialRead));
    let record = server.directory.record(join.page()).unwrap();
    assert_eq!(record.holders.len(), 1);
}

#[test]
fn full_page_payload_crosses_the_socket() {
    let server = Running::start();
    let mut conn = Connection::connect(server.addr).unwrap();
    let space = AddressSpaceId(2);
    conn.send(&Message::request(Opcode::InitialRead, space, 0x5000, 9)).unwrap();
    conn.recv(Wait::Timeout(PATIENCE)).unwrap();

    // Grant: the coordinator sends AllowWrite on this same connection.
    let request = Message::request(Opcode::RequestWrite, space, 0x5000, 9);
    conn.send(&request).unwrap();
    let grant = conn.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert_eq!(grant.opcode(), Some(Opcode::AllowWrite));
    conn.send(&grant.ack(AckCode::AllowWrite)).unwrap();
    let done = conn.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert!(done.is_ack_for(&request, AckCode::RequestWrite));

    let mut content = PageData::zeroed();
    content.as_bytes_mut()[PAGE_SIZE - 1] = 0xab;
    let commit = Message::request(Opcode::CommitPage, space, 0x5000, 9).with_payload(content.clone());
    conn.send(&commit).unwrap();
    let done = conn.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert!(done.is_ack_for(&commit, AckCode::CommitPage));

    let mut other = Connection::connect(server.addr).unwrap();
    other.send(&Message::request(Opcode::InitialRead, space, 0x5000, 10)).unwrap();
    let reply = other.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert_eq!(reply.ack_code(), Some(AckCode::InitialRead));
    assert_eq!(reply.payload, Some(content));
}

#[test]
fn bad_payload_length_drops_the_connection() {
    let server = Running::start();
    let mut raw = TcpStream::connect(server.addr).unwrap();
    let mut frame = Message::request(Opcode::PingAlive, AddressSpaceId(1), 0, 1).encode();
    frame[HEADER_LEN - 4..HEADER_LEN].copy_from_slice(&100u32.to_le_bytes());
    raw.write_all(&frame).unwrap();

    raw.set_read_timeout(Some(PATIENCE)).unwrap();
    let mut buf = [0u8; 64];
    match raw.read(&mut buf) {
        Ok(n) => assert_eq!(n, 0, "server answered a malformed frame"),
        Err(err) => assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset),
    }

    // The coordinator keeps serving everyone else.
    let mut conn = Connection::connect(server.addr).unwrap();
    let ping = Message::request(Opcode::PingAlive, AddressSpaceId(1), 0, 2);
    conn.send(&ping).unwrap();
    assert!(conn.recv(Wait::Timeout(PATIENCE)).unwrap().is_ack_for(&ping, AckCode::PingAlive));
}

#[test]
fn client_session_joins_over_tcp() {
    let server = Running::start();
    let space = AddressSpaceId(3);
    let page = PageIdentity::containing(space, 0x9000);
    let sim = Arc::new(SimPageTable::new());
    sim.map(page, true);
    let env = ClientEnv::new(sim.clone(), sim.clone(), Arc::new(StaticResolver::new().with(4, "fptrtest")));
    let config = ClientConfig { server: server.addr.to_string(), ..ClientConfig::default() };
    let session = ClientSession::connect(config, env).unwrap();
    session.initial_read(space, 4, 0x9000).unwrap();
    session.ping(space, 4).unwrap();

    let deadline = Instant::now() + PATIENCE;
    while server.directory.record(page).is_none() {
        assert!(Instant::now() < deadline, "join never reached the coordinator");
        thread::sleep(Duration::from_millis(2));
    }
    assert!(session.is_open());
    session.shutdown();
}
