//! External interfaces the engine consumes but does not implement: socket
//! I/O, connection lifecycle, the result cache, cookie validation, per-server
//! latency metrics, and randomness. All are injected trait objects so the
//! engine itself stays free of an async runtime or real network dependency.

use std::net::SocketAddr;

use resolv_dns::message::DnsMessage;

use crate::connection::{ConnKind, SocketHandle};
use crate::error::Status;
use crate::time::Timeval;

/// Outcome of a single non-blocking read or write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// `count` bytes were transferred.
    Count(usize),
    /// The operation would have blocked; try again once notified.
    WouldBlock,
    /// Any other I/O failure.
    Other,
}

/// Non-blocking read/write on an already-open socket.
pub trait ConnectionIo: Send {
    fn read(&mut self, socket: SocketHandle, buf: &mut [u8]) -> IoOutcome;
    fn write(&mut self, socket: SocketHandle, buf: &[u8]) -> IoOutcome;
}

/// Opens and closes sockets to upstream servers.
pub trait ConnectionOpener: Send {
    fn open(&mut self, addr: SocketAddr, using_tcp: bool) -> Result<SocketHandle, Status>;
    fn close(&mut self, socket: SocketHandle);
}

/// The query-level result cache. `insert` returning `true` means the cache
/// took ownership of the record (the engine must not also report it through
/// metrics as a fresh answer, but the callback still fires).
pub trait QueryCache: Send {
    fn insert(&mut self, now: Timeval, qname: &str, message: &DnsMessage) -> bool;
}

/// DNS cookie (RFC 7873) application and validation.
pub trait CookieValidator: Send {
    fn apply(&mut self, message: &mut DnsMessage, server: SocketAddr, now: Timeval);
    /// Returns `true` if the response is acceptable. A `false` return has the
    /// caller drop the response outright, as a stray or spoofed reply — the
    /// validator has no query or channel handle to request anything more
    /// specific, such as a requeue.
    fn validate(&mut self, message: &DnsMessage, server: SocketAddr, now: Timeval) -> bool;
}

/// Per-server latency tracking used to seed retry timeouts.
pub trait Metrics: Send {
    fn server_timeout_ms(&self, server: SocketAddr, now: Timeval) -> u32;
    fn record(&mut self, server: SocketAddr, status: Status);
}

/// Source of randomness for qid allocation, server rotation, failover
/// sampling, and timeout jitter.
pub trait RandomSource: Send {
    fn next_u16(&mut self) -> u16;
    fn next_byte(&mut self) -> u8;
}

/// Default `RandomSource` backed by the thread-local CSPRNG.
#[derive(Default)]
pub struct SystemRandomSource;

impl RandomSource for SystemRandomSource {
    fn next_u16(&mut self) -> u16 {
        rand::random()
    }

    fn next_byte(&mut self) -> u8 {
        rand::random()
    }
}

/// Server health transition, reported once per `increment_failures` /
/// `set_good` call so an operator can log or alert on flapping upstreams.
#[derive(Debug, Clone, Copy)]
pub struct ServerStateEvent {
    pub server: SocketAddr,
    pub kind: ConnKind,
    pub success: bool,
}
