//! Integration tests covering the end-to-end scenarios and invariants.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use resolv_dns::builder::DnsMessageBuilder;
use resolv_dns::domain_name::DomainName;
use resolv_dns::message::{ClassType, DnsFlags, DnsMessage, DnsOpcode, DnsQuestion, DnsResponseCode, RecordType};

use crate::channel::ChannelBuilder;
use crate::config::{ChannelConfig, ChannelFlags};
use crate::error::Status;
use crate::testutil::{CountingRandomSource, FakeNetwork};
use crate::time::Timeval;

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn response_for(request_qid: u16, qname: &DomainName, rcode: DnsResponseCode, tc: bool) -> Vec<u8> {
    let question = DnsQuestion::new(qname.clone(), RecordType::A, ClassType::IN);
    let msg = DnsMessageBuilder::new()
        .with_id(request_qid)
        .with_flags(DnsFlags {
            qr: true,
            opcode: DnsOpcode::Query,
            aa: false,
            tc,
            rd: true,
            ra: true,
            z: false,
            ad: false,
            cd: false,
            rcode_low: 0,
        })
        .add_question(question)
        .with_response(rcode)
        .build();
    let payload = msg.encode().unwrap();
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(&payload);
    framed
}

/// Pull the qid the dispatcher actually put on the wire for `socket`. UDP
/// writes reach the fake network prefix-free (one write = one datagram);
/// TCP writes keep the internal 2-byte length prefix. Each test socket only
/// ever carries a single outbound message, so trying the unprefixed decode
/// first and falling back to skipping 2 bytes disambiguates the two.
fn wire_qid(net: &FakeNetwork, socket: u64) -> u16 {
    let sent = net.sent_to(socket);
    if let Ok(msg) = DnsMessage::decode(&sent) {
        return msg.id;
    }
    DnsMessage::decode(&sent[2..]).unwrap().id
}

type Outcome = Arc<Mutex<Option<(Status, u16, Option<DnsMessage>)>>>;

fn capture() -> (Outcome, impl FnOnce(Status, u16, Option<DnsMessage>) + Send + 'static) {
    let slot: Outcome = Arc::new(Mutex::new(None));
    let slot2 = slot.clone();
    (slot, move |status, timeouts, msg| {
        *slot2.lock().unwrap() = Some((status, timeouts, msg));
    })
}

#[test]
fn happy_udp_roundtrip() {
    let net = FakeNetwork::new();
    let config = ChannelConfig::default();
    let resolver = ChannelBuilder::new(config, net.io(), net.opener())
        .with_rng(Box::new(CountingRandomSource::starting_at(1000)))
        .build();

    let s0 = resolver.register_server(addr(53));
    let s1 = resolver.register_server(addr(54));

    let qname = DomainName::from_ascii("example.com").unwrap();
    let (outcome, cb) = capture();
    resolver.submit_query_at(qname.clone(), RecordType::A, ClassType::IN, false, cb, Timeval::ZERO);

    // First server in priority order gets the connection; socket handles are
    // minted sequentially by FakeOpener starting at 1.
    let socket = 1;
    let qid = wire_qid(&net, socket);

    let response = response_for(qid, &qname, DnsResponseCode::NoError, false);
    net.push_udp_response(socket, &response);
    resolver.process(&[socket], &[], Timeval::ZERO);

    let (status, _, msg) = outcome.lock().unwrap().take().expect("callback fired");
    assert_eq!(status, Status::Success);
    assert!(msg.is_some());
    assert_eq!(resolver.consec_failures(s0), Some(0));
    assert_eq!(resolver.consec_failures(s1), Some(0));
    assert_eq!(resolver.pending_query_count(), 0);
}

#[test]
fn truncation_promotes_to_tcp_and_resends() {
    let net = FakeNetwork::new();
    let config = ChannelConfig::default();
    let resolver = ChannelBuilder::new(config, net.io(), net.opener())
        .with_rng(Box::new(CountingRandomSource::starting_at(1)))
        .build();
    resolver.register_server(addr(53));

    let qname = DomainName::from_ascii("big.example.com").unwrap();
    let (outcome, cb) = capture();
    resolver.submit_query_at(qname.clone(), RecordType::A, ClassType::IN, false, cb, Timeval::ZERO);

    let udp_socket = 1;
    let qid = wire_qid(&net, udp_socket);
    let truncated = response_for(qid, &qname, DnsResponseCode::NoError, true);
    net.push_udp_response(udp_socket, &truncated);
    resolver.process(&[udp_socket], &[], Timeval::ZERO);

    // Still pending: the truncated reply triggered a TCP resend, not a
    // terminal callback.
    assert!(outcome.lock().unwrap().is_none());
    assert_eq!(resolver.pending_query_count(), 1);

    let tcp_socket = 2;
    let tcp_qid = wire_qid(&net, tcp_socket);
    assert_ne!(tcp_qid, qid, "resend must use a fresh qid");
    let good = response_for(tcp_qid, &qname, DnsResponseCode::NoError, false);
    net.push_udp_response(tcp_socket, &good);
    resolver.process(&[tcp_socket], &[], Timeval::ZERO);

    let (status, _, _) = outcome.lock().unwrap().take().expect("callback fired");
    assert_eq!(status, Status::Success);
}

#[test]
fn servfail_fails_over_to_next_server() {
    let net = FakeNetwork::new();
    let config = ChannelConfig::default();
    let resolver = ChannelBuilder::new(config, net.io(), net.opener())
        .with_rng(Box::new(CountingRandomSource::starting_at(1)))
        .build();
    let s0 = resolver.register_server(addr(53));
    let s1 = resolver.register_server(addr(54));

    let qname = DomainName::from_ascii("example.com").unwrap();
    let (outcome, cb) = capture();
    resolver.submit_query_at(qname.clone(), RecordType::A, ClassType::IN, false, cb, Timeval::ZERO);

    let socket0 = 1;
    let qid0 = wire_qid(&net, socket0);
    let servfail = response_for(qid0, &qname, DnsResponseCode::ServerFailure, false);
    net.push_udp_response(socket0, &servfail);
    resolver.process(&[socket0], &[], Timeval::ZERO);

    assert_eq!(resolver.consec_failures(s0), Some(1));
    assert!(outcome.lock().unwrap().is_none(), "should retry on s1, not end yet");

    let socket1 = 2;
    let qid1 = wire_qid(&net, socket1);
    let good = response_for(qid1, &qname, DnsResponseCode::NoError, false);
    net.push_udp_response(socket1, &good);
    resolver.process(&[socket1], &[], Timeval::ZERO);

    let (status, _, _) = outcome.lock().unwrap().take().expect("callback fired");
    assert_eq!(status, Status::Success);
    assert_eq!(resolver.consec_failures(s1), Some(0));
}

#[test]
fn timeout_exhaustion_ends_query_with_timeout() {
    let net = FakeNetwork::new();
    let mut config = ChannelConfig::default();
    config.tries_per_server = 2;
    config.timeout_ms = 100;
    let resolver = ChannelBuilder::new(config, net.io(), net.opener())
        .with_rng(Box::new(CountingRandomSource::starting_at(1)))
        .build();
    let s0 = resolver.register_server(addr(53));

    let qname = DomainName::from_ascii("example.com").unwrap();
    let (outcome, cb) = capture();
    resolver.submit_query_at(qname, RecordType::A, ClassType::IN, false, cb, Timeval::ZERO);

    let t0 = Timeval::ZERO;
    let t1 = t0.plus_millis(150);
    resolver.process(&[], &[], t1);
    assert_eq!(resolver.consec_failures(s0), Some(1));
    assert!(outcome.lock().unwrap().is_none(), "one retry left, tries=2 * 1 server");

    // Second attempt's timeout window starts from t1, doubled-with-jitter;
    // 400ms comfortably clears it regardless of jitter.
    let t2 = t1.plus_millis(400);
    resolver.process(&[], &[], t2);

    let (status, timeouts, _) = outcome.lock().unwrap().take().expect("callback fired");
    assert_eq!(status, Status::Timeout);
    assert_eq!(timeouts, 2);
}

#[test]
fn late_response_for_superseded_qid_is_dropped() {
    let net = FakeNetwork::new();
    let mut config = ChannelConfig::default();
    config.tries_per_server = 3;
    config.timeout_ms = 100;
    let resolver = ChannelBuilder::new(config, net.io(), net.opener())
        .with_rng(Box::new(CountingRandomSource::starting_at(1)))
        .build();
    let s0 = resolver.register_server(addr(53));
    let s1 = resolver.register_server(addr(54));

    let qname = DomainName::from_ascii("example.com").unwrap();
    let (outcome, cb) = capture();
    resolver.submit_query_at(qname.clone(), RecordType::A, ClassType::IN, false, cb, Timeval::ZERO);

    let socket0 = 1;
    let original_qid = wire_qid(&net, socket0);

    // Time out on S0, forcing a resend to S1 with a new qid.
    resolver.process(&[], &[], Timeval::ZERO.plus_millis(150));
    assert_eq!(resolver.consec_failures(s0), Some(1));

    let socket1 = 2;
    let new_qid = wire_qid(&net, socket1);
    assert_ne!(new_qid, original_qid);

    // The original S0 response finally shows up, for a qid nobody is
    // waiting on anymore.
    let stale = response_for(original_qid, &qname, DnsResponseCode::NoError, false);
    net.push_udp_response(socket0, &stale);
    resolver.process(&[socket0], &[], Timeval::ZERO.plus_millis(150));

    assert!(outcome.lock().unwrap().is_none(), "stale response must not complete the query");
    assert_eq!(resolver.consec_failures(s1), Some(0), "stale delivery must not touch s1's health");

    let good = response_for(new_qid, &qname, DnsResponseCode::NoError, false);
    net.push_udp_response(socket1, &good);
    resolver.process(&[socket1], &[], Timeval::ZERO.plus_millis(150));
    let (status, _, _) = outcome.lock().unwrap().take().expect("callback fired");
    assert_eq!(status, Status::Success);
}

#[test]
fn formerr_strips_edns_and_resends() {
    let net = FakeNetwork::new();
    let mut config = ChannelConfig::default();
    config.set_flags(ChannelFlags::EDNS);
    let resolver = ChannelBuilder::new(config, net.io(), net.opener())
        .with_rng(Box::new(CountingRandomSource::starting_at(1)))
        .build();
    resolver.register_server(addr(53));

    let qname = DomainName::from_ascii("example.com").unwrap();
    let (outcome, cb) = capture();
    resolver.submit_query_at(qname.clone(), RecordType::A, ClassType::IN, false, cb, Timeval::ZERO);

    let socket0 = 1;
    let qid0 = wire_qid(&net, socket0);
    let sent_before_resend = net.sent_to(socket0).len();
    let formerr = response_for(qid0, &qname, DnsResponseCode::FormatError, false);
    net.push_udp_response(socket0, &formerr);
    resolver.process(&[socket0], &[], Timeval::ZERO);

    assert!(outcome.lock().unwrap().is_none(), "FORMERR triggers a downgrade resend, not a terminal callback");
    assert_eq!(resolver.pending_query_count(), 1);

    // Same server, same socket (UDP connections are reused), so the resend's
    // qid is read out of the bytes appended after the original send.
    let resent = net.sent_to(socket0);
    let qid1 = DnsMessage::decode(&resent[sent_before_resend..]).unwrap().id;
    assert_ne!(qid1, qid0, "resend must use a fresh qid");
    let good = response_for(qid1, &qname, DnsResponseCode::NoError, false);
    net.push_udp_response(socket0, &good);
    resolver.process(&[socket0], &[], Timeval::ZERO);

    let (status, _, _) = outcome.lock().unwrap().take().expect("callback fired");
    assert_eq!(status, Status::Success);
}

#[test]
fn rotate_flag_uses_random_server_selection() {
    let net = FakeNetwork::new();
    let mut config = ChannelConfig::default();
    config.set_flags(ChannelFlags::ROTATE);
    let resolver = ChannelBuilder::new(config, net.io(), net.opener())
        .with_rng(Box::new(CountingRandomSource::starting_at(1)))
        .build();
    resolver.register_server(addr(53));
    resolver.register_server(addr(54));

    let qname = DomainName::from_ascii("example.com").unwrap();
    let (outcome, cb) = capture();
    resolver.submit_query_at(qname.clone(), RecordType::A, ClassType::IN, false, cb, Timeval::ZERO);

    // CountingRandomSource::next_byte always returns 0, so rotation always
    // lands on the first server regardless of the ROTATE flag being set.
    let socket = 1;
    let qid = wire_qid(&net, socket);
    let good = response_for(qid, &qname, DnsResponseCode::NoError, false);
    net.push_udp_response(socket, &good);
    resolver.process(&[socket], &[], Timeval::ZERO);

    let (status, _, _) = outcome.lock().unwrap().take().expect("callback fired");
    assert_eq!(status, Status::Success);
}
