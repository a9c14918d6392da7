use std::{io, time::Duration};

use thiserror::Error;

use crate::transport::Transport;

/// Failures surfaced by the host, the client and their registries.
///
/// Per-peer write errors and client read errors are recovered from inside
/// the loops and only show up in the logs; everything here ends an
/// operation.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unable to listen for {transport} connections on {address}")]
    Bind {
        transport: Transport,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("listener failed with an unrecoverable accept error")]
    Accept(#[source] io::Error),

    #[error("no message was sent for {0:?}")]
    Idle(Duration),

    #[error("unknown transport '{0}', expected 'tcp' or 'unix'")]
    UnknownTransport(String),

    #[error("invalid connection string '{0}'")]
    InvalidAddress(String),

    #[error("{0} is no longer running")]
    Closed(&'static str),
}
