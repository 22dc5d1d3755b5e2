//! Draining readable sockets into framed response payloads (component C5).

use bytes::{Buf, BufMut};
use tracing::trace;

use crate::channel::Channel;
use crate::error::Status;
use crate::keys::{ConnKey, ServerKey};
use crate::ports::IoOutcome;
use crate::response::handle_response;
use crate::time::Timeval;

const UDP_MAX_DATAGRAM: usize = 65535;
const TCP_READ_CHUNK: usize = 4096;

/// `read_conn_packets` (§4.4): pull raw bytes off the socket into `in_buf`.
///
/// UDP reads are synthetically length-prefixed (one read = one datagram) so
/// that [`read_answers`] can frame both transports the same way; TCP bytes
/// are appended as-is, since the wire format already carries a length prefix.
pub fn read_conn_packets(channel: &mut Channel, server: ServerKey, conn: ConnKey) -> Result<(), Status> {
    let is_udp = channel
        .servers
        .get(server)
        .and_then(|s| s.connections.get(conn.0))
        .map(|c| c.is_udp())
        .ok_or(Status::BadResponse)?;

    loop {
        let socket = channel
            .servers
            .get(server)
            .and_then(|s| s.connections.get(conn.0))
            .map(|c| c.socket);
        let Some(socket) = socket else {
            return Ok(());
        };

        let mut scratch = [0u8; UDP_MAX_DATAGRAM];
        let read_len = if is_udp { UDP_MAX_DATAGRAM } else { TCP_READ_CHUNK };
        let outcome = channel.io.read(socket, &mut scratch[..read_len]);

        match outcome {
            IoOutcome::Count(n) => {
                let conn_mut = channel
                    .servers
                    .get_mut(server)
                    .and_then(|s| s.connections.get_mut(conn.0));
                let Some(conn_mut) = conn_mut else {
                    return Ok(());
                };
                if is_udp {
                    conn_mut.in_buf.put_u16(n as u16);
                }
                conn_mut.in_buf.extend_from_slice(&scratch[..n]);

                // Only loop again for UDP, where another datagram may
                // already be queued; a short TCP read means the stream
                // is caught up for now.
                if is_udp {
                    continue;
                }
                if n == read_len {
                    continue;
                }
                return Ok(());
            }
            IoOutcome::WouldBlock => return Ok(()),
            IoOutcome::Other => {
                crate::events::handle_conn_error(channel, server, conn, true, Status::ConnectionRefused);
                return Err(Status::ConnectionRefused);
            }
        }
    }
}

/// `read_answers` (§4.4): frame complete messages out of `in_buf` and hand
/// each to the response handler, stopping (and signalling teardown) on the
/// first malformed payload.
pub fn read_answers(channel: &mut Channel, server: ServerKey, conn: ConnKey, now: Timeval) -> Result<(), Status> {
    loop {
        let frame = {
            let Some(conn_ref) = channel
                .servers
                .get(server)
                .and_then(|s| s.connections.get(conn.0))
            else {
                return Ok(());
            };
            if conn_ref.in_buf.len() < 2 {
                None
            } else {
                let len = u16::from_be_bytes([conn_ref.in_buf[0], conn_ref.in_buf[1]]) as usize;
                if conn_ref.in_buf.len() < 2 + len {
                    None
                } else {
                    Some(len)
                }
            }
        };

        let Some(len) = frame else {
            return Ok(());
        };

        let payload = {
            let conn_mut = channel
                .servers
                .get_mut(server)
                .and_then(|s| s.connections.get_mut(conn.0))
                .unwrap();
            conn_mut.in_buf.advance(2);
            let payload = conn_mut.in_buf[..len].to_vec();
            conn_mut.in_buf.advance(len);
            payload
        };

        trace!(len, "framed response payload");
        handle_response(channel, server, conn, &payload, now)?;
    }
}
