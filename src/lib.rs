#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

mod client_message;
mod connection;
mod executor;
mod handler;
mod hooks;
mod keep_alive;
mod server_message;
mod session;

use std::time::Duration;

pub use self::{
    client_message::{ClientMessage, GraphQLRequest, OperationMessage, ProtocolError, Variables},
    connection::Connection,
    executor::SubscriptionExecutor,
    handler::SubscriptionProtocolHandler,
    hooks::{HookError, NoopHooks, SubscriptionHooks},
    server_message::{ConnectionErrorPayload, GraphQLError, GraphQLResponse, ServerMessage},
    session::{Session, Transport},
};

/// ConnectionConfig is used to configure a connection once it is accepted.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionConfig {
    /// Interval at which to send keep-alives.
    ///
    /// `None` (the default) disables keep-alives; so does a zero interval.
    pub keep_alive_interval: Option<Duration>,
}

impl ConnectionConfig {
    /// Constructs a configuration with keep-alives disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Specifies the interval at which to send keep-alives.
    #[must_use]
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }
}
