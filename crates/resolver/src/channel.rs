//! The channel: the root object all engine state hangs off. Owns the server
//! registry, query indices, injected collaborators, and configuration.
//!
//! Concurrency: every public entry point takes the channel-wide lock before
//! touching any state (§5). We use `parking_lot::Mutex` and `try_lock`
//! rather than a blocking `lock`, so that a callback which re-enters the
//! channel fails fast with a clear panic instead of deadlocking silently —
//! callbacks run with the lock held and must not call back into the
//! `Resolver`.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;

use resolv_dns::builder::DnsMessageBuilder;
use resolv_dns::domain_name::DomainName;
use resolv_dns::message::{ClassType, DnsFlags, DnsOpcode, DnsQuestion, Edns, RecordType};

use crate::config::{ChannelConfig, ChannelFlags};
use crate::connection::SocketHandle;
use crate::dispatch::send_query;
use crate::keys::{ConnKey, QueryKey, ServerKey};
use crate::ports::{ConnectionIo, ConnectionOpener, CookieValidator, Metrics, QueryCache, RandomSource, ServerStateEvent, SystemRandomSource};
use crate::query::{QueryCallback, QueryRegistry};
use crate::server::ServerRegistry;
use crate::time::Timeval;

/// Advertised UDP payload size on an EDNS OPT record attached to outgoing
/// queries, per current flag-day guidance (RFC 6891 suggests 4096, but
/// 1232 keeps responses under the common path MTU without fragmentation).
const EDNS_UDP_PAYLOAD_SIZE: u16 = 1232;

/// Root mutable state of the engine. Not `Sync`; access is always mediated
/// by [`Resolver`]'s lock.
pub struct Channel {
    pub config: ChannelConfig,
    pub servers: ServerRegistry,
    pub queries: QueryRegistry,
    pub connnode_by_socket: HashMap<SocketHandle, (ServerKey, ConnKey)>,
    pub rng: Box<dyn RandomSource>,
    pub io: Box<dyn ConnectionIo>,
    pub opener: Box<dyn ConnectionOpener>,
    pub cache: Option<Box<dyn QueryCache>>,
    pub cookie: Option<Box<dyn CookieValidator>>,
    pub metrics: Option<Box<dyn Metrics>>,
    pub notify_pending_write: bool,
    pub pending_write_callback: Option<Box<dyn FnMut() + Send>>,
    pub server_state_callback: Option<Box<dyn FnMut(ServerStateEvent) + Send>>,
    pub queue_empty_callback: Option<Box<dyn FnMut() + Send>>,
}

impl Channel {
    /// Invoked after a query is fully freed; notifies "the queue may now be
    /// empty" per §4.8 (after the free, not before, so a callback that
    /// enqueues new work is observed correctly).
    pub fn notify_if_empty(&mut self) {
        if self.queries.is_empty() {
            if let Some(cb) = self.queue_empty_callback.as_mut() {
                cb();
            }
        }
    }

    pub fn register_server(&mut self, addr: SocketAddr) -> ServerKey {
        self.servers.register(addr)
    }

    pub(crate) fn emit_server_state(&mut self, event: ServerStateEvent) {
        if let Some(cb) = self.server_state_callback.as_mut() {
            cb(event);
        }
    }

    /// Build a query's wire message and hand it to the dispatcher.
    fn submit(
        &mut self,
        qname: DomainName,
        qtype: RecordType,
        qclass: ClassType,
        no_retries: bool,
        callback: QueryCallback,
    ) -> QueryKey {
        self.submit_at(qname, qtype, qclass, no_retries, callback, crate::time::now())
    }

    /// As [`Self::submit`], but with an explicit submission time — used by
    /// tests driving the engine against a simulated clock.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_at(
        &mut self,
        qname: DomainName,
        qtype: RecordType,
        qclass: ClassType,
        no_retries: bool,
        callback: QueryCallback,
        now: Timeval,
    ) -> QueryKey {
        let qid = self.queries.allocate_qid(&mut *self.rng);
        let question = DnsQuestion::new(qname.clone(), qtype, qclass);
        let mut message = DnsMessageBuilder::new()
            .with_id(qid)
            .with_flags(DnsFlags {
                qr: false,
                opcode: DnsOpcode::Query,
                aa: false,
                tc: false,
                rd: true,
                ra: false,
                z: false,
                ad: false,
                cd: false,
                rcode_low: 0,
            })
            .add_question(question)
            .build();

        if self.config.flags().contains(ChannelFlags::EDNS) {
            message.set_edns(Some(Edns {
                udp_payload_size: EDNS_UDP_PAYLOAD_SIZE,
                ..Edns::default()
            }));
        }

        let key = self
            .queries
            .insert(qid, qname, qtype, qclass, message, no_retries, now, callback);
        send_query(self, key, now);
        key
    }
}

/// Builds a [`Resolver`] with its injected collaborators.
pub struct ChannelBuilder {
    config: ChannelConfig,
    io: Option<Box<dyn ConnectionIo>>,
    opener: Option<Box<dyn ConnectionOpener>>,
    rng: Option<Box<dyn RandomSource>>,
    cache: Option<Box<dyn QueryCache>>,
    cookie: Option<Box<dyn CookieValidator>>,
    metrics: Option<Box<dyn Metrics>>,
    pending_write_callback: Option<Box<dyn FnMut() + Send>>,
    server_state_callback: Option<Box<dyn FnMut(ServerStateEvent) + Send>>,
    queue_empty_callback: Option<Box<dyn FnMut() + Send>>,
}

impl ChannelBuilder {
    pub fn new(config: ChannelConfig, io: Box<dyn ConnectionIo>, opener: Box<dyn ConnectionOpener>) -> Self {
        Self {
            config,
            io: Some(io),
            opener: Some(opener),
            rng: None,
            cache: None,
            cookie: None,
            metrics: None,
            pending_write_callback: None,
            server_state_callback: None,
            queue_empty_callback: None,
        }
    }

    pub fn with_rng(mut self, rng: Box<dyn RandomSource>) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn with_cache(mut self, cache: Box<dyn QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_cookie_validator(mut self, cookie: Box<dyn CookieValidator>) -> Self {
        self.cookie = Some(cookie);
        self
    }

    pub fn with_metrics(mut self, metrics: Box<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_pending_write_callback(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.pending_write_callback = Some(Box::new(cb));
        self
    }

    pub fn with_server_state_callback(mut self, cb: impl FnMut(ServerStateEvent) + Send + 'static) -> Self {
        self.server_state_callback = Some(Box::new(cb));
        self
    }

    pub fn with_queue_empty_callback(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.queue_empty_callback = Some(Box::new(cb));
        self
    }

    pub fn build(self) -> Resolver {
        let channel = Channel {
            config: self.config,
            servers: ServerRegistry::new(),
            queries: QueryRegistry::new(),
            connnode_by_socket: HashMap::new(),
            rng: self.rng.unwrap_or_else(|| Box::new(SystemRandomSource)),
            io: self.io.expect("ConnectionIo is required"),
            opener: self.opener.expect("ConnectionOpener is required"),
            cache: self.cache,
            cookie: self.cookie,
            metrics: self.metrics,
            notify_pending_write: false,
            pending_write_callback: self.pending_write_callback,
            server_state_callback: self.server_state_callback,
            queue_empty_callback: self.queue_empty_callback,
        };
        Resolver { inner: Mutex::new(channel) }
    }
}

/// The resolver instance. All public operations acquire the channel lock for
/// their duration; see the module docs for the reentrancy policy.
pub struct Resolver {
    pub(crate) inner: Mutex<Channel>,
}

impl Resolver {
    /// Register an upstream server, returning a handle used for diagnostics.
    pub fn register_server(&self, addr: SocketAddr) -> ServerKey {
        let mut guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        guard.register_server(addr)
    }

    pub fn server_count(&self) -> usize {
        let guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        guard.servers.len()
    }

    /// Introspection hook for the invariants in §8: a server's current
    /// consecutive-failure count, or `None` if the key is unknown.
    pub fn consec_failures(&self, server: ServerKey) -> Option<u32> {
        let guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        guard.servers.get(server).map(|s| s.consec_failures)
    }

    /// Number of queries still outstanding.
    pub fn pending_query_count(&self) -> usize {
        let guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        guard.queries.len()
    }

    /// Submit a new question. `callback` fires exactly once, with the lock
    /// held, when the query reaches a terminal status.
    pub fn submit_query(
        &self,
        qname: DomainName,
        qtype: RecordType,
        qclass: ClassType,
        no_retries: bool,
        callback: impl FnOnce(crate::error::Status, u16, Option<resolv_dns::message::DnsMessage>) + Send + 'static,
    ) -> QueryKey {
        let mut guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        guard.submit(qname, qtype, qclass, no_retries, Box::new(callback))
    }

    /// As [`Self::submit_query`], but against a caller-supplied submission
    /// time rather than the real clock — used by tests driving the engine
    /// against a simulated clock.
    #[cfg(test)]
    pub(crate) fn submit_query_at(
        &self,
        qname: DomainName,
        qtype: RecordType,
        qclass: ClassType,
        no_retries: bool,
        callback: impl FnOnce(crate::error::Status, u16, Option<resolv_dns::message::DnsMessage>) + Send + 'static,
        now: Timeval,
    ) -> QueryKey {
        let mut guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        guard.submit_at(qname, qtype, qclass, no_retries, Box::new(callback), now)
    }

    /// Drive the engine on socket readiness, per §4.9.
    pub fn process(&self, readable: &[SocketHandle], writable: &[SocketHandle], now: crate::time::Timeval) {
        let mut guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        crate::events::process(&mut guard, readable, writable, now);
    }

    /// Drive the engine for a single socket reported ready for reading,
    /// writing, or both.
    pub fn process_fd(&self, read_fd: Option<SocketHandle>, write_fd: Option<SocketHandle>, now: crate::time::Timeval) {
        let mut guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        crate::events::process_fd(&mut guard, read_fd, write_fd, now);
    }

    /// Flush any connection still holding buffered writes.
    pub fn process_pending_write(&self) {
        let mut guard = self
            .inner
            .try_lock()
            .expect("channel re-entered: called from within a query/callback");
        crate::events::process_pending_write(&mut guard);
    }
}
