#![deny(unsafe_code)]

//! Connection-pooled, multiplexing IPC client for the crosstalk protocol.
//!
//! A [`Client`] keeps one long-lived connection per `(peer, identity)` and
//! interleaves any number of in-flight calls on it, correlated by call id.
//! Each connection runs a dedicated reader task that routes responses to
//! their callers in arrival order, evicts the connection after a configured
//! idle window, and turns read timeouts on a healthy connection into
//! keepalive pings. Connects retry with a bounded policy; a connection that
//! fails takes only its own in-flight calls down with it.
//!
//! The client is generic over the response value type (any [`Payload`]) and
//! over how sockets are made (any [`Connector`]); region servers and the
//! master are just peers at different addresses.

mod call;
mod client;
mod config;
mod connection;
mod connector;
mod errors;
mod parallel;
mod pool;

pub use client::Client;
pub use config::{
    ClientConfig, KEY_MAX_IDLE_TIME, KEY_MAX_RETRIES, KEY_PING_INTERVAL, KEY_TCP_NODELAY,
};
pub use connector::{Connector, TcpConnector};
pub use errors::{CallError, RemoteError};
pub use pool::IdentityHandle;

pub use crosstalk_wire::{Identity, Payload, RawBytes};
