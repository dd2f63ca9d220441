// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end coherence scenarios over in-process connections.
//!
//! Each host runs a real `ClientSession` against a simulated page table; the
//! coordinator runs its event loop on a background thread. A few tests play
//! the coordinator by hand over the raw connection instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nexus_dsm::client::{
    AccessKind, AccessMonitor, ClientEnv, ClientSession, Fault, FaultKind, FaultOutcome, Pacer,
    QuiescenceOutcome, SimPageTable, StaticResolver, ThreadPacer,
};
use nexus_dsm::server::{OwnershipDirectory, Server};
use nexus_dsm::transport::connection_pair;
use nexus_dsm::{
    AckCode, AddressSpaceId, ClientConfig, Connection, Message, Opcode, PageData, PageIdentity,
    QuiescencePolicy, ServerConfig, TransportError, Wait,
};

const SPACE: AddressSpaceId = AddressSpaceId(0x7e57);
const VADDR: u64 = 0x2_0000;
const PID_A: u32 = 101;
const PID_B: u32 = 202;
const PID_C: u32 = 303;
const PATIENCE: Duration = Duration::from_secs(5);

fn page() -> PageIdentity {
    PageIdentity::containing(SPACE, VADDR)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Holds write monitors in their first pause until opened.
#[derive(Default)]
struct Gate {
    open: AtomicBool,
}

impl Gate {
    fn open(&self) {
        self.open.store(true, Ordering::Release);
    }
}

impl Pacer for Gate {
    fn pause(&self, _policy: &QuiescencePolicy) {
        let deadline = Instant::now() + PATIENCE;
        while !self.open.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

struct Host {
    pid: u32,
    sim: Arc<SimPageTable>,
    session: ClientSession,
    monitor: AccessMonitor,
}

impl Host {
    fn start(pid: u32, conn: Connection, config: ClientConfig, pacer: Arc<dyn Pacer>) -> Self {
        let sim = Arc::new(SimPageTable::new());
        let resolver = StaticResolver::new().with(pid, "fptrtest");
        let env = ClientEnv::new(sim.clone(), sim.clone(), Arc::new(resolver)).with_pacer(pacer);
        let session = ClientSession::start(config, conn, env).unwrap();
        let monitor = session.monitor();
        Self { pid, sim, session, monitor }
    }

    fn new(pid: u32, conn: Connection) -> Self {
        Self::start(pid, conn, ClientConfig::default(), Arc::new(ThreadPacer))
    }

    fn join(&self) {
        self.session.initial_read(SPACE, self.pid, VADDR).unwrap();
    }

    /// First write touch: associates the page and blocks writes.
    fn prime(&self) {
        let touch = Fault { space: SPACE, pid: self.pid, vaddr: VADDR, access: AccessKind::Write, kind: FaultKind::Violation };
        assert_eq!(self.monitor.handle_fault(&touch), FaultOutcome::Primed);
    }

    /// Stores `byte`, routing a fault through the monitor.
    fn store(&self, byte: u8) -> Option<FaultOutcome> {
        match self.sim.store(SPACE, self.pid, VADDR, byte) {
            Ok(()) => None,
            Err(fault) => Some(self.monitor.handle_fault(&fault)),
        }
    }

    /// Loads the first byte, routing a fault through the monitor.
    fn load(&self) -> Result<u8, FaultOutcome> {
        self.sim.load(SPACE, self.pid, VADDR).map_err(|fault| self.monitor.handle_fault(&fault))
    }

    fn writes_allowed(&self) -> Option<bool> {
        self.session.context().permissions().writes_allowed(page())
    }

    fn pending(&self) -> Option<bool> {
        self.session.context().ledger().find(page()).map(|lock| lock.resolved)
    }
}

/// Coordinator event loop on a background thread.
struct Cluster {
    directory: Arc<OwnershipDirectory>,
    stop: Arc<AtomicBool>,
    server: Option<JoinHandle<()>>,
}

impl Cluster {
    fn start(hosts: usize) -> (Self, Vec<Connection>) {
        let mut server = Server::new(ServerConfig {
            poll_interval_ms: 1,
            command_timeout_ms: 500,
            ..ServerConfig::default()
        });
        let conns = (0..hosts)
            .map(|_| {
                let (server_end, client_end) = connection_pair();
                server.attach(server_end).unwrap();
                client_end
            })
            .collect();
        let directory = server.directory();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::spawn(move || server.serve_until(&stop))
        };
        (Self { directory, stop, server: Some(handle) }, conns)
    }

    fn holders(&self) -> usize {
        self.directory.record(page()).map_or(0, |r| r.holders.len())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

#[test]
fn write_on_unjoined_page_is_refused_and_rearms_the_throttle() {
    let (cluster, mut conns) = Cluster::start(1);
    let a = Host::new(PID_A, conns.remove(0));
    a.sim.map(page(), true);
    a.prime();
    assert_eq!(a.store(1), Some(FaultOutcome::WriteRequested));

    // Fewer retries than the throttle interval: only a reset re-admits.
    let mut readmitted = false;
    for _ in 0..40 {
        thread::sleep(Duration::from_millis(20));
        if a.store(1) == Some(FaultOutcome::WriteRequested) {
            readmitted = true;
            break;
        }
    }
    assert!(readmitted, "refusal never re-armed the throttle");
    assert!(cluster.directory.is_empty());
    assert_eq!(a.writes_allowed(), Some(false));
}

#[test]
fn write_handshake_blocks_readers_until_commit() {
    let (cluster, mut conns) = Cluster::start(3);
    let gate = Arc::new(Gate::default());
    let a = Host::start(PID_A, conns.remove(0), ClientConfig::default(), gate.clone());
    let b = Host::new(PID_B, conns.remove(0));
    a.sim.map(page(), true);
    b.sim.map(page(), true);
    a.join();
    b.join();
    wait_until("both hosts joined", || cluster.holders() == 2);

    a.prime();
    assert_eq!(a.store(0x42), Some(FaultOutcome::WriteRequested));
    wait_until("reader locked", || b.pending() == Some(false));
    wait_until("writer granted", || a.writes_allowed() == Some(true));
    assert!(cluster.directory.record(page()).unwrap().locked);

    // Reader stalls while the writer holds the page.
    assert_eq!(b.load(), Err(FaultOutcome::Suppressed));
    assert_eq!(a.store(0x42), None);
    gate.open();

    wait_until("reader resumed", || b.pending() == Some(true));
    assert_eq!(b.load(), Err(FaultOutcome::Installed));
    assert_eq!(b.load(), Ok(0x42));
    assert_eq!(b.pending(), None);

    wait_until("writer re-blocked", || a.writes_allowed() == Some(false));
    let outcomes = a.session.context().monitors().join_all();
    assert!(matches!(outcomes.as_slice(), [QuiescenceOutcome::Quiet { .. }]));
    let record = cluster.directory.record(page()).unwrap();
    assert!(!record.locked);
    assert_eq!(record.cached.map(|p| p.as_bytes()[0]), Some(0x42));

    // A late joiner receives the committed page.
    let c = Host::new(PID_C, conns.remove(0));
    c.sim.map(page(), true);
    c.join();
    wait_until("late joiner installed", || c.sim.contents(page()).map(|p| p.as_bytes()[0]) == Some(0x42));
    assert_eq!(cluster.holders(), 3);
}

#[test]
fn resume_before_mapping_installs_on_first_touch() {
    let (cluster, mut conns) = Cluster::start(2);
    let gate = Arc::new(Gate::default());
    let a = Host::start(PID_A, conns.remove(0), ClientConfig::default(), gate.clone());
    let b = Host::new(PID_B, conns.remove(0));
    a.sim.map(page(), true);
    b.sim.declare(page(), true);
    a.join();
    b.join();
    wait_until("both hosts joined", || cluster.holders() == 2);

    a.prime();
    assert_eq!(a.store(0x17), Some(FaultOutcome::WriteRequested));
    wait_until("writer granted", || a.writes_allowed() == Some(true));
    // The lock was acknowledged without a mapping and is only recorded.
    assert_eq!(b.pending(), Some(false));

    // Unresolved: the missing-page fault must not materialize the page.
    assert_eq!(b.load(), Err(FaultOutcome::Suppressed));
    assert!(!b.sim.is_mapped(page()));
    assert!(b.sim.fallback_log().is_empty());

    assert_eq!(a.store(0x17), None);
    gate.open();

    wait_until("lock resolved before mapping", || b.pending() == Some(true));
    assert!(!b.sim.is_mapped(page()));
    assert_eq!(b.load(), Err(FaultOutcome::Installed));
    assert_eq!(b.load(), Ok(0x17));
    assert_eq!(b.pending(), None);
}

#[test]
fn repeated_write_faults_send_one_request() {
    let (mut coordinator, near) = connection_pair();
    let a = Host::new(PID_A, near);
    a.sim.map(page(), true);
    a.prime();

    let outcomes: Vec<_> = (0..10).map(|_| a.store(9)).collect();
    assert_eq!(outcomes[0], Some(FaultOutcome::WriteRequested));
    assert!(outcomes[1..].iter().all(|o| *o == Some(FaultOutcome::Throttled)));

    let mut requests = 0;
    loop {
        match coordinator.recv(Wait::Timeout(Duration::from_millis(100))) {
            Ok(msg) => {
                assert_eq!(msg.opcode(), Some(Opcode::RequestWrite));
                requests += 1;
            }
            Err(TransportError::Timeout) => break,
            Err(err) => panic!("unexpected transport error: {err}"),
        }
    }
    assert_eq!(requests, 1);
}

#[test]
fn throttle_interval_is_configurable() {
    let (_coordinator, near) = connection_pair();
    let config = ClientConfig { write_request_interval: 2, ..ClientConfig::default() };
    let a = Host::start(PID_A, near, config, Arc::new(ThreadPacer));
    a.sim.map(page(), true);
    a.prime();

    let outcomes: Vec<_> = (0..4).map(|_| a.store(9)).collect();
    assert_eq!(
        outcomes,
        vec![
            Some(FaultOutcome::WriteRequested),
            Some(FaultOutcome::Throttled),
            Some(FaultOutcome::WriteRequested),
            Some(FaultOutcome::Throttled),
        ]
    );
}

#[test]
fn repeated_read_locks_leave_one_entry_and_resolve_once() {
    let (mut coordinator, near) = connection_pair();
    let b = Host::new(PID_B, near);
    b.sim.map(page(), true);

    let lock = Message::request(Opcode::LockRead, SPACE, VADDR, PID_B);
    for _ in 0..2 {
        coordinator.send(&lock).unwrap();
        let ack = coordinator.recv(Wait::Timeout(PATIENCE)).unwrap();
        assert!(ack.is_ack_for(&lock, AckCode::LockRead));
    }
    assert_eq!(b.session.context().ledger().len(), 1);
    assert_eq!(b.pending(), Some(false));

    let resume = Message::request(Opcode::ResumeRead, SPACE, VADDR, PID_B).with_payload(PageData::filled(3));
    coordinator.send(&resume).unwrap();
    let ack = coordinator.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert!(ack.is_ack_for(&resume, AckCode::ResumeRead));
    assert_eq!(b.load(), Err(FaultOutcome::Installed));
    assert_eq!(b.load(), Ok(3));

    // A duplicate resume finds no entry and is still acknowledged.
    coordinator.send(&resume).unwrap();
    let ack = coordinator.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert!(ack.is_ack_for(&resume, AckCode::ResumeRead));
    assert!(b.session.context().ledger().is_empty());
    assert_eq!(b.load(), Ok(3));
}

#[test]
fn lost_coordinator_forwards_every_fault() {
    let (coordinator, near) = connection_pair();
    let a = Host::new(PID_A, near);
    a.sim.declare(page(), true);
    drop(coordinator);
    wait_until("session closed", || !a.session.is_open());

    assert_eq!(a.load(), Err(FaultOutcome::Forwarded));
    assert_eq!(a.load(), Ok(0));
    assert_eq!(a.sim.fallback_log().len(), 1);
}

#[test]
fn lost_coordinator_releases_primed_and_locked_pages() {
    let (mut coordinator, near) = connection_pair();
    let a = Host::new(PID_A, near);
    a.sim.declare(page(), true);
    a.prime();
    assert_eq!(a.writes_allowed(), Some(false));

    let lock = Message::request(Opcode::LockRead, SPACE, VADDR, PID_A);
    coordinator.send(&lock).unwrap();
    let ack = coordinator.recv(Wait::Timeout(PATIENCE)).unwrap();
    assert!(ack.is_ack_for(&lock, AckCode::LockRead));
    assert_eq!(a.pending(), Some(false));

    drop(coordinator);
    wait_until("session closed", || !a.session.is_open());

    // Each access faults at most once more, then goes through.
    assert_eq!(a.store(7), Some(FaultOutcome::Forwarded));
    assert_eq!(a.store(7), None);
    assert_eq!(a.load(), Err(FaultOutcome::Forwarded));
    assert_eq!(a.load(), Ok(7));
}
