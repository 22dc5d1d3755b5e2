//! Per-server UDP/TCP connections (component C3).

use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::keys::{QueryKey, ServerKey};
use crate::ports::{ConnectionIo, IoOutcome};

/// Opaque handle to a socket, minted and owned by the injected
/// [`crate::ports::ConnectionOpener`]. The engine never interprets it beyond
/// equality and use as a map key.
pub type SocketHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Udp,
    Tcp,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnFlags: u8 {
        /// The connect() has completed (or a UDP socket, which is
        /// "connected" immediately).
        const CONNECTED = 1 << 0;
        /// First write on a TCP Fast Open socket, sent before the
        /// three-way handshake completes.
        const TFO_INITIAL = 1 << 1;
    }
}

/// A single socket to one server, with its framing buffers.
pub struct Connection {
    pub server: ServerKey,
    pub kind: ConnKind,
    pub flags: ConnFlags,
    pub socket: SocketHandle,
    pub in_buf: BytesMut,
    pub out_buf: BytesMut,
    /// Queries currently riding this connection, in dispatch order.
    pub queries_to_conn: Vec<QueryKey>,
    pub total_queries: u64,
}

impl Connection {
    /// A UDP socket is usable immediately — there's no handshake — so it
    /// starts `CONNECTED`. A fresh TCP connection starts in the TFO-initial
    /// state instead: data may ride out attached to the SYN before the
    /// three-way handshake completes, so writes are still allowed
    /// ([`Self::can_write`]), but [`crate::events::notify_write`] is the one
    /// that promotes it to `CONNECTED` once the socket actually reports
    /// writable.
    pub fn new(server: ServerKey, kind: ConnKind, socket: SocketHandle) -> Self {
        let flags = match kind {
            ConnKind::Udp => ConnFlags::CONNECTED,
            ConnKind::Tcp => ConnFlags::TFO_INITIAL,
        };
        Self {
            server,
            kind,
            flags,
            socket,
            in_buf: BytesMut::new(),
            out_buf: BytesMut::new(),
            queries_to_conn: Vec::new(),
            total_queries: 0,
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.kind, ConnKind::Udp)
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.kind, ConnKind::Tcp)
    }

    pub fn is_connected(&self) -> bool {
        self.flags.contains(ConnFlags::CONNECTED)
    }

    /// Whether a write may be attempted right now: fully connected, or a TCP
    /// Fast Open socket still in its initial state (data can ride the SYN).
    pub fn can_write(&self) -> bool {
        self.is_connected() || self.flags.contains(ConnFlags::TFO_INITIAL)
    }

    pub fn link_query(&mut self, query: QueryKey) {
        self.queries_to_conn.push(query);
        self.total_queries += 1;
    }

    /// Detach `query` from this connection. A no-op if it's already gone,
    /// matching the "idempotent detach" law.
    pub fn unlink_query(&mut self, query: QueryKey) {
        if let Some(pos) = self.queries_to_conn.iter().position(|q| *q == query) {
            self.queries_to_conn.remove(pos);
        }
    }

    /// Queue a fully-serialized DNS message for write, framed with a 2-byte
    /// big-endian length prefix regardless of transport — the same internal
    /// framing the read path expects in `in_buf`. For UDP sockets the prefix
    /// is stripped again by [`Self::flush`] before the payload reaches the
    /// wire, since one UDP write is one datagram.
    pub fn queue_write(&mut self, payload: &[u8]) {
        self.out_buf.put_u16(payload.len() as u16);
        self.out_buf.extend_from_slice(payload);
    }

    /// Drain as much of `out_buf` as the I/O layer will currently accept.
    /// Returns `Ok(())` on a clean flush (including a partial write left for
    /// next time) or `Err(status)` on a hard I/O failure, which the caller
    /// must treat as a critical connection error.
    pub fn flush(&mut self, io: &mut dyn ConnectionIo) -> Result<(), crate::error::Status> {
        loop {
            if self.out_buf.len() < 2 {
                return Ok(());
            }
            let len = u16::from_be_bytes([self.out_buf[0], self.out_buf[1]]) as usize;
            if self.out_buf.len() < 2 + len {
                // Shouldn't happen for outbound frames we built ourselves.
                return Ok(());
            }

            let frame_end = 2 + len;
            let outcome = if self.is_tcp() {
                io.write(self.socket, &self.out_buf[..frame_end])
            } else {
                io.write(self.socket, &self.out_buf[2..frame_end])
            };

            match outcome {
                IoOutcome::Count(n) => {
                    let consumed = if self.is_tcp() { n } else if n == len { frame_end } else { 0 };
                    if consumed == 0 {
                        // Partial UDP write is not meaningful; treat as failure.
                        return Err(crate::error::Status::ConnectionRefused);
                    }
                    self.out_buf.advance(consumed);
                    if self.is_tcp() && consumed < frame_end {
                        // Partial TCP write: wait for the next writable signal.
                        return Ok(());
                    }
                }
                IoOutcome::WouldBlock => return Ok(()),
                IoOutcome::Other => return Err(crate::error::Status::ConnectionRefused),
            }
        }
    }
}
