//! Query dispatch and response processing core for a stub DNS resolver:
//! server selection, connection multiplexing, timeout/retry, and response
//! validation. Socket I/O, the wire codec, caching, cookies and metrics are
//! all externally supplied through the traits in [`ports`].

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod keys;
pub mod ports;
pub mod query;
pub mod readpath;
pub mod response;
pub mod server;
pub mod time;
pub mod timeout_engine;

pub use channel::{Channel, ChannelBuilder, Resolver};
pub use config::{ChannelConfig, ChannelFlags};
pub use connection::{ConnKind, SocketHandle};
pub use error::Status;
pub use keys::{ConnKey, QueryKey, ServerKey};
pub use ports::{ConnectionIo, ConnectionOpener, CookieValidator, IoOutcome, Metrics, QueryCache, RandomSource, ServerStateEvent, SystemRandomSource};
pub use time::{now, timedout, Timeval};

#[cfg(test)]
pub mod testutil;

#[cfg(test)]
mod tests;
