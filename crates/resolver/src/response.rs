//! Response validation and classification (component C6).

use resolv_dns::message::DnsMessage;
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::config::ChannelFlags;
use crate::dispatch::{end_query, send_query};
use crate::error::Status;
use crate::keys::{ConnKey, ServerKey};
use crate::ports::ServerStateEvent;
use crate::time::Timeval;
use crate::timeout_engine::requeue_query;

/// Handle one fully-framed response payload read from `conn`.
///
/// Returns `Err` only for a malformed payload — the only condition the
/// caller must treat as fatal to the connection, per the handler's contract
/// that it never tears a connection down itself.
pub fn handle_response(
    channel: &mut Channel,
    server: ServerKey,
    conn_key: ConnKey,
    payload: &[u8],
    now: Timeval,
) -> Result<(), Status> {
    if payload.is_empty() {
        return Ok(());
    }

    let message = match DnsMessage::decode(payload) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "malformed dns response");
            return Err(Status::BadResponse);
        }
    };

    let Some(query_key) = channel.queries.by_qid(message.id) else {
        trace!(qid = message.id, "response for unknown qid, dropping");
        return Ok(());
    };

    let dns_0x20 = channel.config.flags().contains(ChannelFlags::DNS_0X20);
    let surface_all_rcodes = channel.config.flags().contains(ChannelFlags::SURFACE_ALL_RCODES);
    let ignore_truncation = channel.config.flags().contains(ChannelFlags::IGNORE_TRUNCATION);

    // §4.5 step 4: byte-for-byte question validation.
    let questions_match = {
        let Some(query) = channel.queries.get(query_key) else {
            return Ok(());
        };
        if message.questions().len() != 1 {
            false
        } else {
            let q = &message.questions()[0];
            let case_sensitive = dns_0x20 && !query.using_tcp;
            let qname_matches = if case_sensitive {
                q.qname_matches_case(query.question_qname.original_case())
            } else {
                q.qname.as_str().eq_ignore_ascii_case(query.question_qname.as_str())
            };
            q.qtype == query.question_qtype && q.qclass == query.question_qclass && qname_matches
        }
    };
    if !questions_match {
        trace!(qid = message.id, "question mismatch, dropping as stray response");
        return Ok(());
    }

    if let Some(cookie) = channel.cookie.as_mut() {
        let addr = channel.servers.get(server).map(|s| s.addr);
        if let Some(addr) = addr {
            if !cookie.validate(&message, addr, now) {
                trace!(qid = message.id, "cookie validation rejected response");
                return Ok(());
            }
        }
    }

    // §4.5 step 6: detach from the connection, stay indexed by qid.
    channel.queries.unlink_from_connection_and_timeout(query_key);
    if let Some(s) = channel.servers.get_mut(server) {
        if let Some(conn) = s.connections.get_mut(conn_key.0) {
            conn.unlink_query(query_key);
        }
    }

    // §4.5 step 7: EDNS downgrade on FORMERR.
    let had_opt_in_request = channel
        .queries
        .get(query_key)
        .map(|q| q.message.edns().is_some())
        .unwrap_or(false);
    let rcode = message.rcode().ok();
    if had_opt_in_request && message.edns().is_none() && rcode == Some(resolv_dns::message::DnsResponseCode::FormatError) {
        if let Some(query) = channel.queries.get_mut(query_key) {
            query.message.strip_edns();
        }
        send_query(channel, query_key, now);
        return Ok(());
    }

    // §4.5 step 8: truncation promotes UDP -> TCP and resends.
    let conn_is_udp = channel
        .servers
        .get(server)
        .and_then(|s| s.connections.get(conn_key.0))
        .map(|c| c.is_udp())
        .unwrap_or(false);
    if message.flags.tc && conn_is_udp && !ignore_truncation {
        if let Some(query) = channel.queries.get_mut(query_key) {
            query.using_tcp = true;
        }
        send_query(channel, query_key, now);
        return Ok(());
    }

    // §4.5 step 9: SERVFAIL/NOTIMP/REFUSED are server-specific retryable
    // failures unless the caller wants to see every rcode.
    if !surface_all_rcodes {
        let retry_status = match rcode {
            Some(resolv_dns::message::DnsResponseCode::ServerFailure) => Some(Status::ServerFailure),
            Some(resolv_dns::message::DnsResponseCode::NotImplemented) => Some(Status::NotImplemented),
            Some(resolv_dns::message::DnsResponseCode::Refused) => Some(Status::Refused),
            _ => None,
        };
        if let Some(status) = retry_status {
            channel
                .servers
                .increment_failures(server, now, channel.config.server_retry_delay_ms);
            let addr = channel.servers.get(server).map(|s| s.addr);
            if let Some(addr) = addr {
                channel.emit_server_state(ServerStateEvent {
                    server: addr,
                    kind: if conn_is_udp { crate::connection::ConnKind::Udp } else { crate::connection::ConnKind::Tcp },
                    success: false,
                });
            }
            requeue_query(channel, query_key, now, status, false);
            return Ok(());
        }
    }

    if let Some(cache) = channel.cache.as_mut() {
        let qname = channel
            .queries
            .get(query_key)
            .map(|q| q.question_qname.as_str().to_string());
        if let Some(qname) = qname {
            cache.insert(now, &qname, &message);
        }
    }

    channel.servers.set_good(server);
    let addr = channel.servers.get(server).map(|s| s.addr);
    if let Some(addr) = addr {
        channel.emit_server_state(ServerStateEvent {
            server: addr,
            kind: if conn_is_udp { crate::connection::ConnKind::Udp } else { crate::connection::ConnKind::Tcp },
            success: true,
        });
    }
    end_query(channel, query_key, Status::Success, Some(message));
    Ok(())
}
