//! Readiness-driven event loop entry points and connection teardown
//! (component C9).

use crate::channel::Channel;
use crate::connection::{ConnFlags, SocketHandle};
use crate::error::Status;
use crate::keys::{ConnKey, ServerKey};
use crate::ports::ServerStateEvent;
use crate::readpath::{read_answers, read_conn_packets};
use crate::time::Timeval;
use crate::timeout_engine::{process_timeouts, requeue_query};

/// A socket worth polling right now, captured as a snapshot before iterating
/// so that closing one connection (which can remove entries from
/// `connnode_by_socket` or insert a replacement reusing a freed fd) never
/// perturbs the set we're currently walking.
fn socket_snapshot(channel: &Channel) -> Vec<(SocketHandle, ServerKey, ConnKey)> {
    channel
        .connnode_by_socket
        .iter()
        .map(|(socket, (server, conn))| (*socket, *server, *conn))
        .collect()
}

/// Drive one readiness pass: readable sockets, writable sockets, then
/// timeouts, then a flush attempt on anything still holding buffered
/// writes, then idle-connection reaping. `readable`/`writable` identify the
/// sockets the caller's poller reported ready in each direction.
pub fn process(channel: &mut Channel, readable: &[SocketHandle], writable: &[SocketHandle], now: Timeval) {
    let mut handled_read = std::collections::HashSet::new();
    for (socket, server, conn) in socket_snapshot(channel) {
        if handled_read.contains(&socket) || !readable.contains(&socket) {
            continue;
        }
        handled_read.insert(socket);
        process_fd_readable(channel, server, conn, now);
    }

    let mut handled_write = std::collections::HashSet::new();
    for (socket, server, conn) in socket_snapshot(channel) {
        if handled_write.contains(&socket) || !writable.contains(&socket) {
            continue;
        }
        handled_write.insert(socket);
        notify_write(channel, server, conn);
    }

    process_timeouts(channel, now);
    process_pending_write(channel);
    reap_connections(channel);
}

/// Process a single socket, identified by the caller (e.g. from an
/// edge-triggered poller callback rather than a full readiness scan) as
/// ready for reading, writing, or both, then run the same timeout/write/reap
/// tail as [`process`]. Mirrors `ares_process_fd`'s two-socket shape: a
/// single fd that's both readable and writable is passed as both arguments.
pub fn process_fd(channel: &mut Channel, read_fd: Option<SocketHandle>, write_fd: Option<SocketHandle>, now: Timeval) {
    if let Some(socket) = read_fd {
        if let Some((server, conn)) = channel.connnode_by_socket.get(&socket).copied() {
            process_fd_readable(channel, server, conn, now);
        }
    }
    if let Some(socket) = write_fd {
        if let Some((server, conn)) = channel.connnode_by_socket.get(&socket).copied() {
            notify_write(channel, server, conn);
        }
    }

    process_timeouts(channel, now);
    process_pending_write(channel);
    reap_connections(channel);
}

fn process_fd_readable(channel: &mut Channel, server: ServerKey, conn: ConnKey, now: Timeval) {
    if read_conn_packets(channel, server, conn).is_err() {
        return;
    }
    if read_answers(channel, server, conn, now).is_err() {
        handle_conn_error(channel, server, conn, true, Status::BadResponse);
    }
}

/// `notify_write` (SPEC_FULL §4.3): a connection's socket reported writable.
/// A connection still in the TFO-initial state (data may have ridden out
/// with the SYN before the handshake finished) just has that flag cleared —
/// the next writable notification is what promotes it to `CONNECTED`. Any
/// other connection is marked `CONNECTED` directly. Either way, whatever is
/// still queued in `out_buf` gets a flush attempt.
pub fn notify_write(channel: &mut Channel, server: ServerKey, conn_key: ConnKey) {
    {
        let Some(conn) = channel.servers.get_mut(server).and_then(|s| s.connections.get_mut(conn_key.0)) else {
            return;
        };
        if conn.flags.contains(ConnFlags::TFO_INITIAL) {
            conn.flags.remove(ConnFlags::TFO_INITIAL);
        } else {
            conn.flags.insert(ConnFlags::CONNECTED);
        }
    }

    let flush_result = {
        let Some(conn) = channel.servers.get_mut(server).and_then(|s| s.connections.get_mut(conn_key.0)) else {
            return;
        };
        conn.flush(&mut *channel.io)
    };
    if let Err(status) = flush_result {
        handle_conn_error(channel, server, conn_key, true, status);
    }
}

/// Flush any connection still holding buffered writes, typically invoked from
/// the pending-write-ready callback rather than a full readiness pass.
pub fn process_pending_write(channel: &mut Channel) {
    channel.notify_pending_write = false;
    for (_, server, conn_key) in socket_snapshot(channel) {
        let result = {
            let Some(s) = channel.servers.get_mut(server) else {
                continue;
            };
            let Some(conn) = s.connections.get_mut(conn_key.0) else {
                continue;
            };
            if conn.out_buf.is_empty() {
                continue;
            }
            conn.flush(&mut *channel.io)
        };
        if let Err(status) = result {
            handle_conn_error(channel, server, conn_key, true, status);
        }
    }
}

/// Close idle TCP connections left with no riding queries after an event
/// pass (the teacher's `ares__check_cleanup_conns` equivalent). UDP
/// connections are cheap to keep open — `Server::fetch_connection` reuses
/// the first one it finds — so only idle TCP sockets are reaped. The
/// `STAYOPEN` flag disables this entirely, leaving idle TCP sockets open
/// across readiness passes.
pub fn reap_connections(channel: &mut Channel) {
    if channel.config.flags().contains(crate::config::ChannelFlags::STAYOPEN) {
        return;
    }
    let idle: Vec<(ServerKey, ConnKey, SocketHandle)> = socket_snapshot(channel)
        .into_iter()
        .filter(|(_, server, conn)| {
            channel
                .servers
                .get(*server)
                .and_then(|s| s.connections.get(conn.0))
                .map(|c| c.is_tcp() && c.queries_to_conn.is_empty())
                .unwrap_or(false)
        })
        .map(|(socket, server, conn)| (server, conn, socket))
        .collect();

    for (server, conn_key, socket) in idle {
        if let Some(s) = channel.servers.get_mut(server) {
            s.connections.remove(conn_key.0);
            if s.tcp_conn == Some(conn_key) {
                s.tcp_conn = None;
            }
        }
        channel.connnode_by_socket.remove(&socket);
        channel.opener.close(socket);
    }
}

/// `handle_conn_error` (§4.9): tear down a connection after a critical I/O
/// failure, requeuing every query it was carrying.
///
/// Order matters: the server's failure counter is bumped *before* the
/// connection is closed and its queries detached, so a `server_state`
/// observer sees the health transition attributed to the connection that
/// actually failed, not to whatever the queries get requeued onto next.
pub fn handle_conn_error(channel: &mut Channel, server: ServerKey, conn_key: ConnKey, critical: bool, status: Status) {
    if critical {
        channel
            .servers
            .increment_failures(server, crate::time::now(), channel.config.server_retry_delay_ms);
        if let Some(addr) = channel.servers.get(server).map(|s| s.addr) {
            let kind = channel
                .servers
                .get(server)
                .and_then(|s| s.connections.get(conn_key.0))
                .map(|c| c.kind);
            if let Some(kind) = kind {
                channel.emit_server_state(ServerStateEvent { server: addr, kind, success: false });
            }
        }
    }

    let (socket, pending_queries) = {
        let Some(s) = channel.servers.get_mut(server) else {
            return;
        };
        let Some(conn) = s.connections.get_mut(conn_key.0) else {
            return;
        };
        let queries = std::mem::take(&mut conn.queries_to_conn);
        (conn.socket, queries)
    };

    if let Some(s) = channel.servers.get_mut(server) {
        s.connections.remove(conn_key.0);
        if s.tcp_conn == Some(conn_key) {
            s.tcp_conn = None;
        }
    }
    channel.connnode_by_socket.remove(&socket);
    channel.opener.close(socket);

    // Every query riding this connection already had its `try_count`
    // incremented by `send_query` when it was dispatched here, so the
    // teardown itself isn't a fresh attempt.
    let now = crate::time::now();
    for query_key in pending_queries {
        requeue_query(channel, query_key, now, status, false);
    }
}
