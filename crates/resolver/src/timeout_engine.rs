//! Timeout detection and the shared requeue/give-up path (component C8).

use tracing::trace;

use crate::channel::Channel;
use crate::dispatch::{end_query, send_query};
use crate::error::Status;
use crate::keys::QueryKey;
use crate::ports::ServerStateEvent;
use crate::time::Timeval;

/// `process_timeouts` (§4.7): fire every query whose deadline has passed.
///
/// Re-peeks the minimum after each requeue rather than caching a "next"
/// pointer, since a requeue can reshape the timeout index (a resend arms a
/// fresh, later deadline; exhausting retries removes the query outright).
pub fn process_timeouts(channel: &mut Channel, now: Timeval) {
    loop {
        let Some(key) = channel.queries.peek_min_timeout() else {
            return;
        };
        let timed_out = channel
            .queries
            .get(key)
            .map(|q| crate::time::timedout(now, q.timeout))
            .unwrap_or(false);
        if !timed_out {
            return;
        }

        let conn = channel.queries.get(key).and_then(|q| q.conn);
        if let Some((server, conn_key)) = conn {
            let using_tcp = channel
                .servers
                .get(server)
                .and_then(|s| s.connections.get(conn_key.0))
                .map(|c| c.is_tcp())
                .unwrap_or(false);
            channel
                .servers
                .increment_failures(server, now, channel.config.server_retry_delay_ms);
            if let Some(addr) = channel.servers.get(server).map(|s| s.addr) {
                channel.emit_server_state(ServerStateEvent {
                    server: addr,
                    kind: if using_tcp { crate::connection::ConnKind::Tcp } else { crate::connection::ConnKind::Udp },
                    success: false,
                });
            }
        }
        if let Some(query) = channel.queries.get_mut(key) {
            query.timeouts += 1;
        }

        trace!(?key, "query timed out");
        requeue_query(channel, key, now, Status::Timeout, false);
    }
}

/// Shared give-up-or-retry decision (§4.7), called after any attempt fails
/// (timeout, transport error, or a retryable server-side rcode).
///
/// `count_as_try` should be `true` only when the failing attempt never
/// reached [`send_query`]'s own `try_count` increment (e.g. the connection
/// couldn't even be opened) — otherwise that attempt already counts itself
/// and incrementing again here would double-charge it against the retry
/// budget.
pub fn requeue_query(channel: &mut Channel, key: QueryKey, now: Timeval, status: Status, count_as_try: bool) {
    let conn = channel.queries.get(key).and_then(|q| q.conn);
    channel.queries.unlink_from_connection_and_timeout(key);
    if let Some((server, conn_key)) = conn {
        if let Some(s) = channel.servers.get_mut(server) {
            if let Some(c) = s.connections.get_mut(conn_key.0) {
                c.unlink_query(key);
            }
        }
    }

    let decision = {
        let Some(query) = channel.queries.get_mut(key) else {
            return;
        };
        if status != Status::Success {
            query.error_status = status;
        }
        if count_as_try {
            query.try_count += 1;
        }
        (query.try_count, query.no_retries)
    };
    let (try_count, no_retries) = decision;

    let limit = channel.servers.len().max(1) as u32 * channel.config.tries_per_server.max(1);
    if !no_retries && (try_count as u32) < limit {
        send_query(channel, key, now);
        return;
    }

    let final_status = channel
        .queries
        .get(key)
        .map(|q| q.error_status)
        .unwrap_or(Status::Timeout);
    let final_status = if final_status == Status::Success { Status::Timeout } else { final_status };
    end_query(channel, key, final_status, None);
}
