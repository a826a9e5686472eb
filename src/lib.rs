//! # Reliable MQTT Client for Embedded Systems
//!
//! `mqtt-reliable` is a `no_std`, allocation-free MQTT v3.1.1 client built on the
//! [Embassy](https://embassy.dev/) async ecosystem.
//!
//! ## Core Features
//!
//! - **QoS 0, 1 and 2:** Outbound exchanges are tracked until acknowledged and
//!   retransmitted with the DUP flag. Inbound QoS 2 messages are delivered exactly once.
//! - **Persistent sessions:** With `clean_session = false`, unacknowledged publishes
//!   survive a reconnect and are replayed in their original order.
//! - **Keep-alive and reconnection:** PINGREQ is sent when the link is idle; a lost
//!   connection is re-established with exponential backoff and jitter.
//! - **Single writer:** Any number of tasks share a `Copy` [`MqttClient`] handle while
//!   one [`MqttEventLoop`] owns the transport.
//! - **Transport Agnostic:** The [`MqttTransport`] trait lets the client run over any
//!   reliable, ordered byte stream. [`TcpTransport`] covers `embassy-net`.
//!
//! ## Architecture
//!
//! ```ignore
//! let state = STATE.init(MqttState::new());
//! let mut event_loop = MqttEventLoop::<_, 1024>::new(transport, state);
//! let client = MqttClient::new(state);
//!
//! // in one task
//! event_loop.run().await;
//!
//! // in another
//! client.connect(MqttOptions::new("sensor-01")?).await?;
//! client.subscribe("cmd/#", QoS::AtLeastOnce).await?;
//! client.publish("sensors/1/temp", b"21.5", QoS::ExactlyOnce, false).await?.wait().await?;
//! let message = client.receive().await;
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod client;
pub mod error;
pub mod message;
pub mod packet;
pub mod runtime;
pub(crate) mod session;
pub mod topic;
pub mod transport;
pub mod util;

// Re-export key types for easier access at the crate root.
pub use client::{
    DeliveryToken, LastWillOptions, MqttClient, MqttEvent, MqttOptions, ReconnectOptions,
};
pub use error::{
    ConnectError, ConnectReturnCode, MqttError, OptionsError, ProtocolError, PublishError,
    SubscribeError, UnsubscribeError,
};
pub use message::{MAX_PAYLOAD_LEN, MAX_TOPIC_LEN, Message, Payload, Topic};
pub use packet::QoS;
pub use runtime::{MqttEventLoop, MqttState};
pub use session::{ConnectionState, MAX_FRAME_LEN};
pub use transport::{DEFAULT_PORT, DEFAULT_TLS_PORT, MqttTransport, TcpTransport, TcpTransportError};
