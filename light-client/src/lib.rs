//! Client for the boblight protocol: a plain text, line based protocol for
//! driving lights attached to a boblight server.
//!
//! [`BoblightClient`] is the entry point. It connects, discovers the lights
//! the server exposes, and sends color, speed, interpolation and priority
//! updates for them.

mod client;
mod config;
mod connector;
mod dispatch;
mod protocol;
mod transport;

#[cfg(test)]
mod test_server;

use thiserror::Error;

pub use boblight_model::{Color, Light, RangeError, NAMED_COLORS};
pub use client::BoblightClient;
pub use config::{ClientConfig, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_PRIORITY};
pub use connector::{ConnectionState, Connector};
pub use protocol::{Command, Response, ResponseShape, MAX_PRIORITY};
pub use transport::{
    BoxedStream, LineStream, LineTransport, StreamOpener, TcpOpener, TransportEvent,
};

#[derive(Debug, Error)]
pub enum LightClientError {
    #[error("could not reach boblight server: {reason}")]
    ConnectionFailed { reason: String },

    #[error("connection to boblight server closed")]
    ConnectionClosed,

    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    #[error(transparent)]
    Validation(#[from] RangeError),

    #[error("not connected (connection is {state})")]
    NotConnected { state: ConnectionState },

    #[error("no response to `{command}` in time")]
    Timeout { command: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}
