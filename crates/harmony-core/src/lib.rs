//! # harmony-core
//!
//! Shared protocol library for the Harmony hub power-off client.
//!
//! This crate holds everything about the hub's command protocol that does not
//! touch a socket:
//!
//! - **`payload`** – the colon-delimited `key=value` text codec, including the
//!   nested `{k=v, k=v}` mapping grammar used inside reply fields.
//! - **`oa`** – the OA request/reply message schemas (pairing,
//!   start-activity), their mime discriminators, and the status-code policy.
//! - **`hub`** – the record a hub sends back during LAN discovery.
//! - **`progress`** – the ordered step enumeration a run reports through.
//!
//! The networked pieces (transport, discovery loops, the session state
//! machine) live in `harmony-client` and depend on this crate.

pub mod hub;
pub mod oa;
pub mod payload;
pub mod progress;

pub use hub::DiscoveredHub;
pub use oa::{OaReply, OaRequest, ProtocolError, STOP_CURRENT_ACTIVITY};
pub use payload::{Payload, PayloadError, Value};
pub use progress::ProgressStep;
