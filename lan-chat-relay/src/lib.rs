//! Local-network chat relay.
//!
//! Clients find the relay with a UDP broadcast, connect over TCP, send a
//! display name and then plain text. Each module owns one responsibility:
//!
//! - [`discovery`] answers `DISCOVER_CHAT_SERVER` datagrams and provides the
//!   matching client-side lookup.
//! - [`registry`] holds the set of active sessions behind a single lock.
//! - [`router`] fans a line out to every session but the sender and prunes
//!   peers that cannot keep up.
//! - [`session`] drives one connection from naming to teardown.
//! - [`relay`] accepts TCP connections and spawns session handlers.
//! - [`protocol`] defines the wire tokens, notice formats and framing.
//! - [`cli`] parses the command line.

pub mod cli;
pub mod discovery;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
