// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! `AmqpError` represents every failure the routing layer can produce, from
//! topology assertion at startup to a request that never got its reply.
//! Each variant belongs to one [`ErrorKind`], which is what callers use to
//! decide whether a failure is fatal, a programming mistake or recoverable.

use thiserror::Error;

/// Coarse classification of an [`AmqpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Exchange, queue or binding assertion failed. Fatal at startup.
    Topology,
    /// The pattern has no destination. A caller bug.
    Routing,
    /// Connection or channel failure. Recoverable, the channel is rebuilt.
    Transport,
    /// No reply arrived within the deadline.
    Timeout,
    /// A remote or local message handler failed.
    Handler,
    /// A payload could not be encoded or decoded. Affects that message only.
    Payload,
    /// Invalid configuration.
    Config,
}

/// Represents errors that can occur while routing, publishing or consuming messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel was closed by the broker or by a previous failure
    #[error("channel is closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// An entity already exists with different parameters
    #[error("topology mismatch: {0}")]
    TopologyMismatch(String),

    /// The pattern could not be split into a service key
    #[error("invalid pattern `{0}`")]
    InvalidPattern(String),

    /// The leading segment of the pattern is not in the routing table
    #[error("no service registered for `{0}`")]
    UnknownService(String),

    /// No binding of the consuming queue matches the pattern
    #[error("pattern `{0}` is not routed to queue `{1}`")]
    UnroutablePattern(String, String),

    /// Two handlers were registered for the same pattern
    #[error("handler already registered for `{0}`")]
    DuplicateHandler(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker refused the publish twice in a row
    #[error("broker applied back-pressure")]
    BackPressure,

    /// Error serializing a payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The remote handler answered with an error
    #[error("remote handler failed: {0}")]
    RemoteError(String),

    /// No reply within the request deadline
    #[error("no reply for `{pattern}` after {after_ms}ms")]
    Timeout { pattern: String, after_ms: u128 },

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AmqpError {
    /// Returns the taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::DeclareExchangeError(_)
            | AmqpError::DeclareQueueError(_)
            | AmqpError::BindingExchangeToQueueError(_, _)
            | AmqpError::TopologyMismatch(_) => ErrorKind::Topology,

            AmqpError::InvalidPattern(_)
            | AmqpError::UnknownService(_)
            | AmqpError::UnroutablePattern(_, _)
            | AmqpError::DuplicateHandler(_) => ErrorKind::Routing,

            AmqpError::Timeout { .. } => ErrorKind::Timeout,

            AmqpError::RemoteError(_) => ErrorKind::Handler,

            AmqpError::InvalidConfig(_) => ErrorKind::Config,

            AmqpError::SerializationError(_) | AmqpError::ParsePayloadError(_) => {
                ErrorKind::Payload
            }

            AmqpError::InternalError(_)
            | AmqpError::ConnectionError(_)
            | AmqpError::ChannelError(_)
            | AmqpError::ChannelClosed
            | AmqpError::PublishingError(_)
            | AmqpError::BackPressure
            | AmqpError::AckMessageError
            | AmqpError::NackMessageError
            | AmqpError::QoSDeclarationError(_)
            | AmqpError::ConsumerDeclarationError(_)
            | AmqpError::ConsumerError(_) => ErrorKind::Transport,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// True when the connection or channel behind the failure is gone.
    /// Back-pressure and payload errors leave the channel usable.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::ChannelClosed
                | AmqpError::PublishingError(_)
        )
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert_eq!(
            AmqpError::DeclareQueueError("q".into()).kind(),
            ErrorKind::Topology
        );
        assert_eq!(
            AmqpError::UnknownService("city".into()).kind(),
            ErrorKind::Routing
        );
        assert_eq!(AmqpError::BackPressure.kind(), ErrorKind::Transport);
        assert_eq!(
            AmqpError::Timeout {
                pattern: "user.findById".into(),
                after_ms: 10
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert!(AmqpError::ChannelClosed.is_transport());
        assert!(!AmqpError::RemoteError("boom".into()).is_transport());
    }

    #[test]
    fn payload_errors_are_not_connection_loss() {
        let parse = AmqpError::ParsePayloadError("expected u32".into());
        assert_eq!(parse.kind(), ErrorKind::Payload);
        assert!(!parse.is_connection_loss());
        assert_eq!(
            AmqpError::SerializationError("key must be a string".into()).kind(),
            ErrorKind::Payload
        );

        assert!(!AmqpError::BackPressure.is_connection_loss());
        assert!(AmqpError::ChannelClosed.is_connection_loss());
        assert!(AmqpError::ConnectionError("reset".into()).is_connection_loss());
        assert!(AmqpError::PublishingError("no route".into()).is_connection_loss());
    }
}
