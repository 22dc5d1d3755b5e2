//! Server selection and query dispatch (component C7).

use tracing::{trace, warn};

use crate::channel::Channel;
use crate::connection::{ConnKind, Connection};
use crate::error::Status;
use crate::keys::{ConnKey, QueryKey, ServerKey};
use crate::ports::ServerStateEvent;
use crate::time::Timeval;
use crate::timeout_engine::requeue_query;

/// Pick a server uniformly at random (the `ROTATE` flag's policy).
pub fn random_server(channel: &mut Channel) -> Option<ServerKey> {
    let count = channel.servers.len();
    if count == 0 {
        return None;
    }
    let r = channel.rng.next_byte() as usize % count;
    channel.servers.iter_in_order().nth(r)
}

/// Pick a server by the failover policy (§4.6): prefer the healthiest
/// server, but occasionally give a failed one early back a chance.
pub fn failover_server(channel: &mut Channel) -> Option<ServerKey> {
    let first = channel.servers.first()?;
    let last = channel.servers.last()?;

    if channel.servers.get(last).unwrap().consec_failures == 0 {
        return Some(first);
    }
    if channel.config.server_retry_chance == 0 {
        return Some(first);
    }

    let r = channel.rng.next_u16();
    if (r as u32) % channel.config.server_retry_chance != 0 {
        return Some(first);
    }

    let now = crate::time::now();
    let candidates: Vec<ServerKey> = channel.servers.iter_in_order().collect();
    for key in candidates {
        let server = channel.servers.get(key).unwrap();
        if server.consec_failures > 0 && crate::time::timedout(now, server.next_retry_time) {
            return Some(key);
        }
    }
    Some(first)
}

fn select_server(channel: &mut Channel) -> Option<ServerKey> {
    if channel.config.flags().contains(crate::config::ChannelFlags::ROTATE) {
        random_server(channel)
    } else {
        failover_server(channel)
    }
}

/// `calc_query_timeout` (§4.6): per-attempt timeout with exponential growth
/// across full passes over the server list and bounded jitter on the
/// jittered rounds.
pub fn calc_query_timeout(channel: &mut Channel, server: ServerKey, try_count: u16) -> u64 {
    let now = crate::time::now();
    let addr = channel.servers.get(server).unwrap().addr;
    let base = channel
        .metrics
        .as_ref()
        .map(|m| m.server_timeout_ms(addr, now))
        .unwrap_or(channel.config.timeout_ms) as u64;

    let num_servers = channel.servers.len().max(1) as u16;
    let rounds = try_count / num_servers;

    let mut value = base;
    if rounds > 0 {
        value = base << rounds.min(16);
    }
    if let Some(max) = channel.config.max_timeout_ms {
        value = value.min(max as u64);
    }

    if rounds > 0 {
        let r = channel.rng.next_u16();
        // delta in [0, 0.5) of value
        let delta = (r as u64 * value) / (2 * u16::MAX as u64);
        value = value.saturating_sub(delta);
        if value < base {
            value = base;
        }
    }

    value
}

fn open_connection(channel: &mut Channel, server: ServerKey, using_tcp: bool) -> Result<ConnKey, Status> {
    let addr = channel.servers.get(server).unwrap().addr;
    let socket = channel.opener.open(addr, using_tcp)?;
    let kind = if using_tcp { ConnKind::Tcp } else { ConnKind::Udp };
    let conn = Connection::new(server, kind, socket);

    let server_mut = channel.servers.get_mut(server).unwrap();
    let conn_key = ConnKey(server_mut.connections.insert(conn));
    if using_tcp {
        server_mut.tcp_conn = Some(conn_key);
    }
    channel.connnode_by_socket.insert(socket, (server, conn_key));
    Ok(conn_key)
}

/// `send_query` (§4.6): dispatch a new or retried query. On entry the query
/// must not be linked into any connection.
pub fn send_query(channel: &mut Channel, key: QueryKey, now: Timeval) {
    if channel.servers.is_empty() {
        end_query(channel, key, Status::NoServer, None);
        return;
    }

    let Some(server) = select_server(channel) else {
        end_query(channel, key, Status::NoServer, None);
        return;
    };

    let using_tcp = match channel.queries.get(key) {
        Some(q) => q.using_tcp,
        None => return,
    };

    let existing = channel
        .servers
        .get(server)
        .and_then(|s| s.fetch_connection(using_tcp, channel.config.udp_max_queries));

    let conn_key = match existing {
        Some(c) => c,
        None => match open_connection(channel, server, using_tcp) {
            Ok(c) => c,
            Err(Status::ConnectionRefused) | Err(Status::BadFamily) => {
                channel.servers.increment_failures(server, now, channel.config.server_retry_delay_ms);
                let addr = channel.servers.get(server).unwrap().addr;
                channel.emit_server_state(ServerStateEvent {
                    server: addr,
                    kind: if using_tcp { ConnKind::Tcp } else { ConnKind::Udp },
                    success: false,
                });
                requeue_query(channel, key, now, Status::ConnectionRefused, true);
                return;
            }
            Err(other) => {
                end_query(channel, key, other, None);
                return;
            }
        },
    };

    // Rekey the qid on every send (including retries) so a stray late
    // response for a prior attempt can never be matched to this one.
    let old_qid = match channel.queries.get(key) {
        Some(q) => q.qid,
        None => return,
    };
    let new_qid = channel.queries.allocate_qid(&mut *channel.rng);
    channel.queries.rekey_qid(key, old_qid, new_qid);

    let addr = channel.servers.get(server).unwrap().addr;

    let encoded = {
        let query = match channel.queries.get_mut(key) {
            Some(q) => q,
            None => return,
        };
        query.qid = new_qid;
        query.message.id = new_qid;
        if let Some(cookie) = channel.cookie.as_mut() {
            cookie.apply(&mut query.message, addr, now);
        }
        query.message.encode()
    };

    let payload = match encoded {
        Ok(p) => p,
        Err(_) => {
            end_query(channel, key, Status::NoMemory, None);
            return;
        }
    };

    let can_flush_now = {
        let server_mut = channel.servers.get_mut(server).unwrap();
        let conn = server_mut.connections.get_mut(conn_key.0).unwrap();
        conn.queue_write(&payload);
        let can_flush = conn.can_write();
        conn.link_query(key);
        can_flush
    };

    if let Some(query) = channel.queries.get_mut(key) {
        query.try_count += 1;
        query.conn = Some((server, conn_key));
        query.last_server = Some(server);
    }

    if can_flush_now {
        if channel.pending_write_callback.is_some() {
            channel.notify_pending_write = true;
            if let Some(cb) = channel.pending_write_callback.as_mut() {
                cb();
            }
        } else {
            let flush_result = {
                let server_mut = channel.servers.get_mut(server).unwrap();
                let conn = server_mut.connections.get_mut(conn_key.0).unwrap();
                conn.flush(&mut *channel.io)
            };
            if let Err(status) = flush_result {
                crate::events::handle_conn_error(channel, server, conn_key, true, status);
                return;
            }
        }
    }

    let try_count = channel.queries.get(key).map(|q| q.try_count).unwrap_or(1);
    let timeout_ms = calc_query_timeout(channel, server, try_count);
    if let Some(query) = channel.queries.get_mut(key) {
        query.timeout = now.plus_millis(timeout_ms);
    }
    channel.queries.link_timeout(key);

    trace!(qid = new_qid, server = %addr, "dispatched query");
}

/// `end_query` (§4.8): record metrics, invoke the user callback, free the
/// query, and notify the channel that the queue may now be empty.
pub fn end_query(channel: &mut Channel, key: QueryKey, status: Status, response: Option<resolv_dns::message::DnsMessage>) {
    let server_addr = channel
        .queries
        .get(key)
        .and_then(|q| q.last_server)
        .and_then(|s| channel.servers.get(s))
        .map(|s| s.addr);

    let Some(mut query) = channel.queries.free(key) else {
        return;
    };

    if let Some(addr) = server_addr {
        if let Some(m) = channel.metrics.as_mut() {
            m.record(addr, status);
        }
    }

    match query.take_callback() {
        Some(cb) => {
            let timeouts = query.timeouts;
            cb(status, timeouts, response);
        }
        None => warn!(qid = query.qid, "query ended twice"),
    }
    channel.notify_if_empty();
}
