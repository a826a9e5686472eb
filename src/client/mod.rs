//! # MQTT Client
//!
//! [`MqttClient`] is the application's handle. It never touches the network:
//! requests are queued in the shared session and the event loop writes them out.
//! The handle is `Copy`, so any number of tasks may publish and subscribe through
//! it concurrently.

pub mod options;

pub use options::{
    ClientId, DEFAULT_CLIENT_ID_PREFIX, DEFAULT_KEEP_ALIVE_SECS, DEFAULT_TOPIC, LastWillOptions,
    MAX_CLIENT_ID_LEN, MAX_CREDENTIAL_LEN, MAX_WILL_LEN, MqttOptions, ReconnectOptions,
};

use core::future::poll_fn;
use core::task::Poll;

use heapless::Vec;

use crate::error::{ConnectError, ProtocolError, PublishError, SubscribeError, UnsubscribeError};
use crate::message::{Message, Topic, copy_str};
use crate::packet::QoS;
use crate::runtime::MqttState;
use crate::runtime::state::Command;
use crate::session::{ConnectionState, Enqueue, MAX_SUBSCRIPTIONS, Outcome, Session, Ticket};

/// Connection lifecycle notifications, read with [`MqttClient::next_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttEvent {
    /// A CONNACK accepted the connection.
    Connected { session_present: bool },
    /// The connection dropped; the supervisor is about to reconnect.
    ConnectionLost,
    /// A reconnect attempt is scheduled after `delay_ms`.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Reconnecting was given up. The client is disconnected.
    ReconnectFailed,
    /// The client disconnected on request.
    Disconnected,
}

/// Handle to a connection driven by an [`MqttEventLoop`](crate::MqttEventLoop).
#[derive(Clone, Copy)]
pub struct MqttClient<'a> {
    state: &'a MqttState,
}

impl<'a> MqttClient<'a> {
    pub fn new(state: &'a MqttState) -> Self {
        Self { state }
    }

    /// Opens the session and waits for the broker's CONNACK.
    ///
    /// Once connected, the event loop reconnects on its own after a connection loss
    /// until [`disconnect`](Self::disconnect) is called or the reconnect policy gives up.
    pub async fn connect(&self, options: MqttOptions) -> Result<(), ConnectError> {
        let _guard = self.state.control.lock().await;
        self.state.with_session(|s| s.begin_connect(options))?;
        self.state.connect_result.reset();
        self.state.commands.send(Command::Connect).await;
        self.state.connect_result.wait().await
    }

    /// Sends DISCONNECT and closes the connection.
    ///
    /// Every pending delivery token and subscribe request fails with `Cancelled`.
    /// Calling this while disconnected does nothing.
    pub async fn disconnect(&self) {
        let _guard = self.state.control.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.state.disconnected.reset();
        self.state.commands.send(Command::Disconnect).await;
        self.state.disconnected.wait().await;
    }

    /// Queues a PUBLISH.
    ///
    /// Waits only for queue space; the returned token completes once the broker
    /// acknowledged the message (immediately for QoS 0).
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<DeliveryToken<'a>, PublishError> {
        let ticket = self
            .enqueue(|s| s.try_publish(topic, payload, qos, retain))
            .await?;
        Ok(DeliveryToken {
            packet_id: ticket.map(|t| t.packet_id),
            pending: ticket.map(|ticket| Pending::new(self.state, ticket)),
        })
    }

    /// Subscribes to `filter` and returns the QoS the broker granted.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<QoS, SubscribeError> {
        let ticket = self.enqueue(|s| s.try_subscribe(filter, qos)).await?;
        match Pending::new(self.state, ticket).outcome().await {
            Outcome::Granted(granted) => Ok(granted),
            Outcome::Failed(failure) => Err(failure.into()),
            _ => Err(SubscribeError::Protocol(ProtocolError::MalformedPacket)),
        }
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), UnsubscribeError> {
        let ticket = self.enqueue(|s| s.try_unsubscribe(filter)).await?;
        match Pending::new(self.state, ticket).outcome().await {
            Outcome::Failed(failure) => Err(failure.into()),
            _ => Ok(()),
        }
    }

    /// Publishes to the default topic with the default QoS.
    pub async fn publish_default(&self, payload: &[u8]) -> Result<DeliveryToken<'a>, PublishError> {
        let (topic, qos) = self
            .state
            .with_session(|s| (s.options().default_topic.clone(), s.options().default_qos));
        self.publish(&topic, payload, qos, false).await
    }

    /// Subscribes to the default topic with the default QoS.
    pub async fn subscribe_default(&self) -> Result<QoS, SubscribeError> {
        let (topic, qos) = self
            .state
            .with_session(|s| (s.options().default_topic.clone(), s.options().default_qos));
        self.subscribe(&topic, qos).await
    }

    /// Waits for the next inbound application message.
    pub async fn receive(&self) -> Message {
        self.state.messages.receive().await
    }

    pub fn try_receive(&self) -> Option<Message> {
        self.state.messages.try_receive().ok()
    }

    /// Waits for the next connection event.
    pub async fn next_event(&self) -> MqttEvent {
        self.state.events.receive().await
    }

    pub fn try_next_event(&self) -> Option<MqttEvent> {
        self.state.events.try_receive().ok()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.with_session(|s| s.state())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// QoS granted for an active subscription to exactly `filter`.
    pub fn granted_qos(&self, filter: &str) -> Option<QoS> {
        self.state.with_session(|s| s.subscriptions().granted(filter))
    }

    /// Snapshot of every filter the broker has granted in this session.
    pub fn subscriptions(&self) -> Vec<(Topic, QoS), MAX_SUBSCRIPTIONS> {
        self.state.with_session(|s| {
            s.subscriptions()
                .iter()
                .filter_map(|(filter, qos)| Some((copy_str(filter)?, qos)))
                .collect()
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.state.with_session(|s| s.subscriptions().len())
    }

    /// Runs `try_queue` until it finds room, then wakes the writer.
    async fn enqueue<T, E>(
        &self,
        mut try_queue: impl FnMut(&mut Session) -> Result<Enqueue<T>, E>,
    ) -> Result<T, E> {
        let queued = poll_fn(|cx| {
            self.state.with_session(|s| match try_queue(s) {
                Ok(Enqueue::Queued(value)) => Poll::Ready(Ok(value)),
                Ok(Enqueue::Full) => {
                    s.register_waiter(cx.waker());
                    Poll::Pending
                }
                Err(e) => Poll::Ready(Err(e)),
            })
        })
        .await?;
        self.state.outbound.signal(());
        Ok(queued)
    }
}

/// Interest in a running exchange. Dropping it before the outcome is known lets the
/// exchange finish unobserved.
struct Pending<'a> {
    state: &'a MqttState,
    ticket: Ticket,
    done: bool,
}

impl<'a> Pending<'a> {
    fn new(state: &'a MqttState, ticket: Ticket) -> Self {
        Self {
            state,
            ticket,
            done: false,
        }
    }

    async fn outcome(&mut self) -> Outcome {
        let outcome = poll_fn(|cx| {
            self.state.with_session(|s| match s.poll_outcome(&self.ticket) {
                Some(outcome) => Poll::Ready(outcome),
                None => {
                    s.register_waiter(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await;
        self.done = true;
        outcome
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.state.with_session(|s| s.detach(&self.ticket));
        }
    }
}

/// Completion handle of a publish.
///
/// Await [`wait`](Self::wait) to learn whether the broker took the message. The
/// token may also be dropped; the publish is still retried and completed in the
/// background.
pub struct DeliveryToken<'a> {
    pending: Option<Pending<'a>>,
    packet_id: Option<u16>,
}

impl DeliveryToken<'_> {
    /// Packet identifier of a QoS 1/2 publish. `None` for QoS 0.
    pub fn packet_id(&self) -> Option<u16> {
        self.packet_id
    }

    /// Waits for PUBACK (QoS 1) or PUBCOMP (QoS 2). QoS 0 completes at once.
    pub async fn wait(mut self) -> Result<(), PublishError> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        match pending.outcome().await {
            Outcome::Delivered => Ok(()),
            Outcome::Failed(failure) => Err(failure.into()),
            _ => Err(PublishError::ConnectionLost),
        }
    }
}
