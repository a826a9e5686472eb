//! # Error Types
//!
//! This module defines the error types used throughout the client, from wire-level
//! protocol violations up to the per-operation errors returned by [`crate::MqttClient`].

use core::fmt;

/// Errors raised while encoding or decoding MQTT control packets, and protocol
/// violations detected while processing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// The fixed header names a packet type that does not exist in MQTT 3.1.1.
    InvalidPacketType(u8),
    /// The reserved flag bits of the fixed header do not match the packet type.
    InvalidFlags(u8),
    /// The remaining-length field used more than four bytes.
    MalformedRemainingLength,
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// A QoS field carried a value outside `0..=2`.
    InvalidQoS(u8),
    /// A string was not valid UTF-8.
    InvalidUtf8String,
    /// A string, payload or packet exceeds what the wire format or local storage allows.
    PayloadTooLarge,
    /// The output buffer is too small for the encoded packet.
    BufferTooSmall,
    /// A packet of this type is not valid in the current connection state.
    UnexpectedPacket(u8),
    /// The broker sent more unreleased QoS 2 messages than the client can hold.
    ReceiveLimitExceeded,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPacketType(t) => write!(f, "invalid packet type {}", t),
            Self::InvalidFlags(t) => write!(f, "invalid fixed header flags for packet type {}", t),
            Self::MalformedRemainingLength => f.write_str("remaining length longer than 4 bytes"),
            Self::MalformedPacket => f.write_str("malformed packet"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS {}", q),
            Self::InvalidUtf8String => f.write_str("invalid UTF-8 string"),
            Self::PayloadTooLarge => f.write_str("payload too large"),
            Self::BufferTooSmall => f.write_str("buffer too small"),
            Self::UnexpectedPacket(t) => write!(f, "unexpected packet type {}", t),
            Self::ReceiveLimitExceeded => f.write_str("too many QoS 2 messages awaiting release"),
        }
    }
}

/// Represents the return codes of a `CONNACK` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    /// The connection was accepted.
    Accepted,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// A code outside the range defined by MQTT 3.1.1.
    Other(u8),
}

impl ConnectReturnCode {
    /// Whether a reconnect with the same options can succeed later.
    ///
    /// Only a temporarily unavailable broker is worth retrying. Credential,
    /// identifier and protocol refusals would fail again identically.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ServerUnavailable)
    }
}

impl From<u8> for ConnectReturnCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUserNameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Other(val) => val,
        }
    }
}

/// Connection-level failures seen by the event loop.
///
/// It is generic over the transport error type `T`, so the concrete error of the
/// underlying network stack (TCP, TLS, UART) is preserved.
#[derive(Debug)]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// A protocol-level error occurred.
    Protocol(ProtocolError),
    /// The peer closed the connection.
    ConnectionClosed,
    /// A connect, ack or keep-alive deadline passed.
    Timeout,
}

impl<T> From<ProtocolError> for MqttError<T> {
    fn from(err: ProtocolError) -> Self {
        MqttError::Protocol(err)
    }
}

impl<T: fmt::Debug> fmt::Display for MqttError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {:?}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::ConnectionClosed => f.write_str("connection closed by peer"),
            Self::Timeout => f.write_str("timed out"),
        }
    }
}

/// Failure of [`crate::MqttClient::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectError {
    /// The transport could not reach the broker.
    Network,
    /// The broker answered with a non-zero `CONNACK` return code.
    Refused(ConnectReturnCode),
    /// No `CONNACK` arrived within the connect timeout.
    Timeout,
    /// The broker answered with something other than a valid `CONNACK`.
    Protocol(ProtocolError),
    /// An empty client identifier requires a clean session.
    InvalidClientId,
    /// The client is already connected or a connect is in progress.
    AlreadyConnected,
}

impl ConnectError {
    /// Whether the supervisor may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network | Self::Timeout | Self::Protocol(_) => true,
            Self::Refused(code) => code.is_retryable(),
            Self::InvalidClientId | Self::AlreadyConnected => false,
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("broker unreachable"),
            Self::Refused(code) => write!(f, "connection refused: {:?}", code),
            Self::Timeout => f.write_str("no CONNACK within connect timeout"),
            Self::Protocol(e) => write!(f, "protocol error during connect: {}", e),
            Self::InvalidClientId => f.write_str("empty client id requires a clean session"),
            Self::AlreadyConnected => f.write_str("already connected"),
        }
    }
}

/// Failure of [`crate::MqttClient::publish`] or of awaiting its [`crate::DeliveryToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishError {
    /// The client is not connected.
    NotConnected,
    /// No acknowledgment after the configured number of retransmissions.
    RetryExhausted,
    /// The connection dropped and the session will not resume the exchange.
    ConnectionLost,
    /// The session was torn down by a user disconnect.
    Cancelled,
    /// Topic names must be non-empty and free of wildcards.
    InvalidTopic,
    /// Topic or payload do not fit into a single frame.
    PayloadTooLarge,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotConnected => "not connected",
            Self::RetryExhausted => "no acknowledgment after all retransmissions",
            Self::ConnectionLost => "connection lost",
            Self::Cancelled => "cancelled by disconnect",
            Self::InvalidTopic => "invalid topic name",
            Self::PayloadTooLarge => "payload too large",
        })
    }
}

/// Failure of [`crate::MqttClient::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubscribeError {
    /// The client is not connected.
    NotConnected,
    /// The broker answered `0x80` for the filter.
    Rejected,
    /// No `SUBACK` within the ack timeout.
    Timeout,
    /// The topic filter is malformed.
    InvalidFilter,
    /// The connection dropped before the `SUBACK`.
    ConnectionLost,
    /// The session was torn down by a user disconnect.
    Cancelled,
    /// The `SUBACK` did not match the request.
    Protocol(ProtocolError),
}

impl fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => f.write_str("not connected"),
            Self::Rejected => f.write_str("broker rejected the filter"),
            Self::Timeout => f.write_str("no SUBACK within ack timeout"),
            Self::InvalidFilter => f.write_str("invalid topic filter"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::Cancelled => f.write_str("cancelled by disconnect"),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

/// Failure of [`crate::MqttClient::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UnsubscribeError {
    /// The client is not connected.
    NotConnected,
    /// No `UNSUBACK` within the ack timeout.
    Timeout,
    /// The topic filter is malformed.
    InvalidFilter,
    /// The connection dropped before the `UNSUBACK`.
    ConnectionLost,
    /// The session was torn down by a user disconnect.
    Cancelled,
}

impl fmt::Display for UnsubscribeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotConnected => "not connected",
            Self::Timeout => "no UNSUBACK within ack timeout",
            Self::InvalidFilter => "invalid topic filter",
            Self::ConnectionLost => "connection lost",
            Self::Cancelled => "cancelled by disconnect",
        })
    }
}

/// A value passed to [`crate::MqttOptions`] does not fit or is not valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OptionsError {
    /// The client identifier exceeds the inline capacity.
    ClientIdTooLong,
    /// Username or password exceed the inline capacity.
    CredentialsTooLong,
    /// A topic is too long or contains wildcards where none are allowed.
    InvalidTopic,
    /// The last-will message exceeds the inline capacity.
    WillTooLarge,
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ClientIdTooLong => "client id too long",
            Self::CredentialsTooLong => "credentials too long",
            Self::InvalidTopic => "invalid topic",
            Self::WillTooLarge => "last-will message too large",
        })
    }
}
