//! MQTT Runtime Module
//!
//! The runtime is the half of the client that does I/O.
//!
//! # Overview
//!
//! [`MqttState`] is shared by the [`MqttClient`](crate::MqttClient) handles and one
//! [`MqttEventLoop`]. The event loop owns the transport and is its only writer, so
//! frames from concurrent publishers never interleave on the wire. It also drives
//! the keep-alive, retransmits unacknowledged packets and reconnects with
//! exponential backoff when the connection drops.
//!
//! # Example
//!
//! ```ignore
//! static STATE: StaticCell<MqttState> = StaticCell::new();
//!
//! let state = STATE.init(MqttState::new());
//! let transport = TcpTransport::new(socket, (broker_ip, DEFAULT_PORT), Duration::from_secs(5));
//! spawner.spawn(mqtt_task(MqttEventLoop::new(transport, state)))?;
//!
//! let client = MqttClient::new(state);
//! client.connect(MqttOptions::new("sensor-01")?).await?;
//! client.subscribe("sensors/+/temp", QoS::AtLeastOnce).await?;
//! ```

pub(crate) mod backoff;
pub(crate) mod event_loop;
pub(crate) mod state;


pub use event_loop::MqttEventLoop;
pub use state::{EVENT_QUEUE_DEPTH, MESSAGE_QUEUE_DEPTH, MqttState};
