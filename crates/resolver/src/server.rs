//! Upstream server registry (component C2).

use std::collections::BTreeSet;
use std::net::SocketAddr;

use slab::Slab;

use crate::connection::Connection;
use crate::keys::{ConnKey, ServerKey};
use crate::time::Timeval;

/// An upstream DNS endpoint with health-tracking state.
///
/// `index` is the server's fixed registration priority (lower = preferred)
/// and never changes; `consec_failures` and the derived registry ordering do.
pub struct Server {
    pub addr: SocketAddr,
    pub index: usize,
    pub consec_failures: u32,
    pub next_retry_time: Timeval,
    pub connections: Slab<Connection>,
    /// At most one TCP connection per server; non-null iff present in
    /// `connections`.
    pub tcp_conn: Option<ConnKey>,
}

impl Server {
    fn new(addr: SocketAddr, index: usize) -> Self {
        Self {
            addr,
            index,
            consec_failures: 0,
            next_retry_time: Timeval::ZERO,
            connections: Slab::new(),
            tcp_conn: None,
        }
    }

    fn sort_key(&self, key: ServerKey) -> (u32, usize, ServerKey) {
        (self.consec_failures, self.index, key)
    }

    /// `fetch_connection` (§4.3): an existing connection this query can ride,
    /// or `None` meaning the dispatcher must open a new one.
    pub fn fetch_connection(&self, using_tcp: bool, udp_max_queries: u32) -> Option<ConnKey> {
        if using_tcp {
            return self.tcp_conn;
        }
        let (raw_key, conn) = self.connections.iter().next()?;
        if conn.is_udp() && (udp_max_queries == 0 || (conn.queries_to_conn.len() as u32) < udp_max_queries) {
            Some(ConnKey(raw_key))
        } else {
            None
        }
    }
}

/// Order-maintaining collection of servers, sorted by `(consec_failures ASC,
/// index ASC)` at all observable points (invariant §3.4).
#[derive(Default)]
pub struct ServerRegistry {
    servers: Slab<Server>,
    order: BTreeSet<(u32, usize, ServerKey)>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, addr: SocketAddr) -> ServerKey {
        let index = self.servers.len();
        let key = ServerKey(self.servers.insert(Server::new(addr, index)));
        self.order.insert((0, index, key));
        key
    }

    pub fn get(&self, key: ServerKey) -> Option<&Server> {
        self.servers.get(key.0)
    }

    pub fn get_mut(&mut self, key: ServerKey) -> Option<&mut Server> {
        self.servers.get_mut(key.0)
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Servers in ascending `(consec_failures, index)` order: best first.
    pub fn iter_in_order(&self) -> impl Iterator<Item = ServerKey> + '_ {
        self.order.iter().map(|(_, _, key)| *key)
    }

    pub fn first(&self) -> Option<ServerKey> {
        self.order.iter().next().map(|(_, _, key)| *key)
    }

    pub fn last(&self) -> Option<ServerKey> {
        self.order.iter().next_back().map(|(_, _, key)| *key)
    }

    /// `increment_failures`: bump the counter, reinsert, arm `next_retry_time`.
    /// No-op if the server was removed concurrently.
    pub fn increment_failures(&mut self, key: ServerKey, now: Timeval, retry_delay_ms: u64) {
        let Some(server) = self.servers.get(key.0) else {
            return;
        };
        let old_key = server.sort_key(key);
        self.order.remove(&old_key);

        let server = self.servers.get_mut(key.0).unwrap();
        server.consec_failures += 1;
        server.next_retry_time = now.plus_millis(retry_delay_ms);
        self.order.insert(server.sort_key(key));
    }

    /// `set_good`: if the failure count was nonzero, reset it and reinsert.
    /// No-op if the server was removed concurrently.
    pub fn set_good(&mut self, key: ServerKey) {
        let Some(server) = self.servers.get(key.0) else {
            return;
        };
        if server.consec_failures == 0 {
            return;
        }
        let old_key = server.sort_key(key);
        self.order.remove(&old_key);

        let server = self.servers.get_mut(key.0).unwrap();
        server.consec_failures = 0;
        server.next_retry_time = Timeval::ZERO;
        self.order.insert(server.sort_key(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn registry_sorts_by_failures_then_index() {
        let mut reg = ServerRegistry::new();
        let s0 = reg.register(addr(1));
        let s1 = reg.register(addr(2));

        assert_eq!(reg.iter_in_order().collect::<Vec<_>>(), vec![s0, s1]);

        reg.increment_failures(s0, Timeval::ZERO, 1000);
        assert_eq!(reg.iter_in_order().collect::<Vec<_>>(), vec![s1, s0]);

        reg.set_good(s0);
        assert_eq!(reg.iter_in_order().collect::<Vec<_>>(), vec![s0, s1]);
    }

    #[test]
    fn set_good_is_noop_when_already_healthy() {
        let mut reg = ServerRegistry::new();
        let s0 = reg.register(addr(1));
        reg.set_good(s0);
        assert_eq!(reg.get(s0).unwrap().consec_failures, 0);
    }
}
