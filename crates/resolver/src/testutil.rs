//! In-memory fakes for the injected ports, used by the integration tests in
//! [`crate::tests`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::connection::SocketHandle;
use crate::error::Status;
use crate::ports::{ConnectionIo, ConnectionOpener, IoOutcome, RandomSource};

#[derive(Default)]
struct NetworkState {
    next_socket: u64,
    /// Bytes the engine has written out, per socket — what "reached the wire".
    outbound: HashMap<SocketHandle, VecDeque<u8>>,
    /// Bytes queued for the engine to read, per socket — simulated responses.
    inbound: HashMap<SocketHandle, VecDeque<u8>>,
    closed: HashSet<SocketHandle>,
    fail_open: bool,
}

/// A fake network shared between the engine's injected I/O and the test
/// driving it, so the test can inspect what was sent and inject responses.
#[derive(Clone, Default)]
pub struct FakeNetwork(Arc<Mutex<NetworkState>>);

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.0.lock().unwrap().fail_open = fail;
    }

    pub fn io(&self) -> Box<dyn ConnectionIo> {
        Box::new(FakeIo(self.0.clone()))
    }

    pub fn opener(&self) -> Box<dyn ConnectionOpener> {
        Box::new(FakeOpener(self.0.clone()))
    }

    /// Push a framed (length-prefixed) response payload into a socket's
    /// read queue so the next `read` call on it returns these bytes.
    pub fn push_udp_response(&self, socket: SocketHandle, payload: &[u8]) {
        let mut state = self.0.lock().unwrap();
        let q = state.inbound.entry(socket).or_default();
        q.extend(payload.iter().copied());
    }

    /// Bytes the engine has written to `socket`, most recent flush included.
    pub fn sent_to(&self, socket: SocketHandle) -> Vec<u8> {
        self.0
            .lock()
            .unwrap()
            .outbound
            .get(&socket)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self, socket: SocketHandle) -> bool {
        self.0.lock().unwrap().closed.contains(&socket)
    }
}

struct FakeIo(Arc<Mutex<NetworkState>>);

impl ConnectionIo for FakeIo {
    fn read(&mut self, socket: SocketHandle, buf: &mut [u8]) -> IoOutcome {
        let mut state = self.0.lock().unwrap();
        let Some(q) = state.inbound.get_mut(&socket) else {
            return IoOutcome::WouldBlock;
        };
        if q.is_empty() {
            return IoOutcome::WouldBlock;
        }
        let n = buf.len().min(q.len());
        for slot in buf.iter_mut().take(n) {
            *slot = q.pop_front().unwrap();
        }
        IoOutcome::Count(n)
    }

    fn write(&mut self, socket: SocketHandle, buf: &[u8]) -> IoOutcome {
        let mut state = self.0.lock().unwrap();
        state.outbound.entry(socket).or_default().extend(buf.iter().copied());
        IoOutcome::Count(buf.len())
    }
}

struct FakeOpener(Arc<Mutex<NetworkState>>);

impl ConnectionOpener for FakeOpener {
    fn open(&mut self, _addr: SocketAddr, _using_tcp: bool) -> Result<SocketHandle, Status> {
        let mut state = self.0.lock().unwrap();
        if state.fail_open {
            return Err(Status::ConnectionRefused);
        }
        state.next_socket += 1;
        let socket = state.next_socket;
        state.inbound.insert(socket, VecDeque::new());
        state.outbound.insert(socket, VecDeque::new());
        Ok(socket)
    }

    fn close(&mut self, socket: SocketHandle) {
        let mut state = self.0.lock().unwrap();
        state.closed.insert(socket);
    }
}

/// Deterministic qid/rotation source: `next_u16` counts up from a seed,
/// `next_byte` always returns 0 (picks the first server under `ROTATE`).
pub struct CountingRandomSource {
    next: u16,
}

impl CountingRandomSource {
    pub fn starting_at(seed: u16) -> Self {
        Self { next: seed }
    }
}

impl RandomSource for CountingRandomSource {
    fn next_u16(&mut self) -> u16 {
        let v = self.next;
        self.next = self.next.wrapping_add(1);
        v
    }

    fn next_byte(&mut self) -> u8 {
        0
    }
}
