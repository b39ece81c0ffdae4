//! # harmony-client
//!
//! The networked half of the Harmony hub power-off client.
//!
//! A run is a short-lived session: find the hub, pair anonymously to get a
//! session token, reconnect with that token, and tell the hub to stop the
//! current activity (the power-off action).  The module layout mirrors that
//! flow:
//!
//! - **`net`** – the connector seam: a factory trait producing byte streams,
//!   with a TCP implementation for production.
//! - **`transport`** – one streaming-XML connection per phase: stream open,
//!   SASL PLAIN, resource bind, stanza exchange, guaranteed disconnect.
//! - **`oa_channel`** – the request/reply layer: envelopes, reply
//!   correlation, continuation skipping, one exchange in flight per
//!   connection.
//! - **`discovery`** – UDP broadcast plus an ephemeral TCP listener that
//!   hubs call back on.
//! - **`session`** – the state machine tying it together, with progress
//!   reporting and cooperative cancellation.
//! - **`virtual_net`** – scripted in-memory sockets for tests; plugs into
//!   the same connector seam as real TCP.
//! - **`config`** – TOML configuration for the CLI binary.

pub mod config;
pub mod discovery;
pub mod net;
pub mod oa_channel;
pub mod session;
pub mod transport;
pub mod virtual_net;

pub use net::{Connection, Connector, TcpConnector};
pub use session::{Outcome, PowerOffSession, SessionConfig, SessionError};
