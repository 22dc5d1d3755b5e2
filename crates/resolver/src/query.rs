//! Outstanding queries and the three indices over them (component C4).

use std::collections::{BTreeSet, HashMap};

use resolv_dns::message::DnsMessage;

use crate::error::Status;
use crate::keys::{ConnKey, QueryKey, ServerKey};
use crate::ports::RandomSource;
use crate::time::Timeval;

/// Invoked exactly once, when a query reaches a terminal status.
pub type QueryCallback = Box<dyn FnOnce(Status, u16, Option<DnsMessage>) + Send>;

/// One outstanding question awaiting an answer or terminal status.
pub struct Query {
    pub qid: u16,
    /// The question as originally submitted; immutable.
    pub question_qtype: resolv_dns::message::RecordType,
    pub question_qclass: resolv_dns::message::ClassType,
    pub question_qname: resolv_dns::domain_name::DomainName,
    /// The full request message, possibly mutated (EDNS stripped, qid
    /// rewritten on resend) between attempts.
    pub message: DnsMessage,
    pub using_tcp: bool,
    pub no_retries: bool,
    pub try_count: u16,
    pub timeouts: u16,
    pub ts: Timeval,
    pub timeout: Timeval,
    pub error_status: Status,
    /// Current connection, or `None` while awaiting dispatch.
    pub conn: Option<(ServerKey, ConnKey)>,
    /// The server the most recent attempt was sent to, kept around after
    /// `conn` is cleared on detach so `end_query` can still attribute a
    /// metrics record to it.
    pub last_server: Option<ServerKey>,
    callback: Option<QueryCallback>,
}

/// Outstanding queries indexed by qid, by timeout deadline, and (via
/// [`crate::connection::Connection::queries_to_conn`]) by owning connection.
#[derive(Default)]
pub struct QueryRegistry {
    queries: slab::Slab<Query>,
    by_qid: HashMap<u16, QueryKey>,
    by_timeout: BTreeSet<(Timeval, u16, QueryKey)>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a qid unique among live queries, retrying on collision.
    pub fn allocate_qid(&self, rng: &mut dyn RandomSource) -> u16 {
        loop {
            let candidate = rng.next_u16();
            if !self.by_qid.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        qid: u16,
        question_qname: resolv_dns::domain_name::DomainName,
        question_qtype: resolv_dns::message::RecordType,
        question_qclass: resolv_dns::message::ClassType,
        message: DnsMessage,
        no_retries: bool,
        ts: Timeval,
        callback: QueryCallback,
    ) -> QueryKey {
        let query = Query {
            qid,
            question_qtype,
            question_qclass,
            question_qname,
            message,
            using_tcp: false,
            no_retries,
            try_count: 0,
            timeouts: 0,
            ts,
            timeout: ts,
            error_status: Status::Success,
            conn: None,
            last_server: None,
            callback: Some(callback),
        };
        let key = QueryKey(self.queries.insert(query));
        self.by_qid.insert(qid, key);
        key
    }

    pub fn get(&self, key: QueryKey) -> Option<&Query> {
        self.queries.get(key.0)
    }

    pub fn get_mut(&mut self, key: QueryKey) -> Option<&mut Query> {
        self.queries.get_mut(key.0)
    }

    pub fn by_qid(&self, qid: u16) -> Option<QueryKey> {
        self.by_qid.get(&qid).copied()
    }

    /// Re-point the qid index after a query's qid is rewritten for a resend.
    pub fn rekey_qid(&mut self, key: QueryKey, old_qid: u16, new_qid: u16) {
        self.by_qid.remove(&old_qid);
        self.by_qid.insert(new_qid, key);
    }

    pub fn peek_min_timeout(&self) -> Option<QueryKey> {
        self.by_timeout.iter().next().map(|(_, _, key)| *key)
    }

    /// Arm (or rearm) the timeout-ordered index entry for `key` at
    /// `query.timeout`. Caller must have already set `query.timeout`.
    pub fn link_timeout(&mut self, key: QueryKey) {
        if let Some(q) = self.queries.get(key.0) {
            self.by_timeout.insert((q.timeout, q.qid, key));
        }
    }

    pub fn unlink_timeout(&mut self, key: QueryKey, timeout: Timeval) {
        if let Some(q) = self.queries.get(key.0) {
            self.by_timeout.remove(&(timeout, q.qid, key));
        }
    }

    /// Detach `key` from its connection and from the timeout index, leaving
    /// it present in `by_qid` until [`Self::free`] is called. Idempotent.
    pub fn unlink_from_connection_and_timeout(&mut self, key: QueryKey) {
        if let Some(q) = self.queries.get_mut(key.0) {
            let old_timeout = q.timeout;
            q.conn = None;
            self.by_timeout.remove(&(old_timeout, q.qid, key));
        }
    }

    /// Fully remove a query from every index and return it. Idempotent:
    /// calling twice on the same key is safe, the second call returns `None`.
    pub fn free(&mut self, key: QueryKey) -> Option<Query> {
        let q = self.queries.try_remove(key.0)?;
        self.by_qid.remove(&q.qid);
        self.by_timeout.remove(&(q.timeout, q.qid, key));
        Some(q)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

impl Query {
    pub fn take_callback(&mut self) -> Option<QueryCallback> {
        self.callback.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemRandomSource;
    use resolv_dns::builder::DnsMessageBuilder;
    use resolv_dns::domain_name::DomainName;
    use resolv_dns::message::{ClassType, RecordType};

    fn dummy_message() -> DnsMessage {
        DnsMessageBuilder::new().build()
    }

    #[test]
    fn free_is_idempotent() {
        let mut reg = QueryRegistry::new();
        let mut rng = SystemRandomSource::default();
        let qid = reg.allocate_qid(&mut rng);
        let key = reg.insert(
            qid,
            DomainName::from_ascii("example.com").unwrap(),
            RecordType::A,
            ClassType::IN,
            dummy_message(),
            false,
            Timeval::ZERO,
            Box::new(|_, _, _| {}),
        );
        reg.link_timeout(key);

        assert!(reg.free(key).is_some());
        assert!(reg.free(key).is_none());
        assert!(reg.by_qid(qid).is_none());
        assert!(reg.peek_min_timeout().is_none());
    }

    #[test]
    fn qid_allocation_avoids_collisions() {
        let mut reg = QueryRegistry::new();
        let mut rng = SystemRandomSource::default();
        let qid = reg.allocate_qid(&mut rng);
        reg.insert(
            qid,
            DomainName::from_ascii("example.com").unwrap(),
            RecordType::A,
            ClassType::IN,
            dummy_message(),
            false,
            Timeval::ZERO,
            Box::new(|_, _, _| {}),
        );
        // Force the RNG to always hand back the already-used qid once, then a fresh one.
        struct Fixed {
            calls: std::cell::Cell<u32>,
            used: u16,
        }
        impl RandomSource for Fixed {
            fn next_u16(&mut self) -> u16 {
                let n = self.calls.get();
                self.calls.set(n + 1);
                if n == 0 { self.used } else { self.used.wrapping_add(1) }
            }
            fn next_byte(&mut self) -> u8 {
                0
            }
        }
        let mut fixed = Fixed {
            calls: std::cell::Cell::new(0),
            used: qid,
        };
        let new_qid = reg.allocate_qid(&mut fixed);
        assert_ne!(new_qid, qid);
    }
}
