//! Line-delimited broadcast over TCP or Unix domain sockets.
//!
//! A [`host::Host`] accepts any number of connections and writes every
//! outbound message to each of them. A [`client::Client`] dials a host,
//! redials whenever the connection drops, and hands each received line to
//! its registered handlers. Messages are text terminated by a single `\n`.
//!
//! - [`transport`] describes where to listen or dial and wraps both socket
//!   families behind one stream type.
//! - [`framer`] turns arbitrary read chunks into whole lines.
//! - [`registry`] owns the live peer and handler sets; every change goes
//!   through one loop.
//! - [`peer`] is a single accepted connection with a write deadline.
//! - [`host`] and [`client`] run the accept, broadcast, receive and dispatch
//!   loops on Tokio, all stopped through one cancellation token.
//! - [`cli`] parses the command line of the bundled binary.

pub mod cli;
pub mod client;
pub mod error;
pub mod framer;
pub mod host;
pub mod peer;
pub mod registry;
pub mod transport;

pub use client::{Client, ClientConfig, Handler, HandlerRef};
pub use error::RelayError;
pub use host::{Host, HostConfig, HostSender};
pub use transport::{ConnectionInfo, Transport};
