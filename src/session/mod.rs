//! # Session State
//!
//! The protocol state machine for one client. It covers connection lifecycle,
//! identifier allocation, the in-flight table, the outbound queue, inbound QoS 2
//! messages awaiting release, and granted subscriptions.
//!
//! `Session` does no I/O. The façade queues work into it and the event loop pulls
//! frames out of it, feeds it decoded packets and ticks its timers. Both sides hold
//! the same lock while they touch it.

pub(crate) mod inflight;
pub(crate) mod keep_alive;
pub(crate) mod subscriptions;

use core::task::Waker;

use embassy_sync::waitqueue::MultiWakerRegistration;
use embassy_time::{Duration, Instant};
use heapless::{Deque, Vec};

use crate::client::MqttOptions;
use crate::error::{ConnectError, ProtocolError, PublishError, SubscribeError, UnsubscribeError};
use crate::message::{MAX_PAYLOAD_LEN, MAX_TOPIC_LEN, Message, copy_str};
use crate::packet::{
    self, Connect, EncodePacket, LastWill, MqttPacket, PubAck, PubComp, PubRec, PubRel, Publish,
    SubAckReturnCode, Subscribe, Unsubscribe,
};
use crate::QoS;
use crate::topic::{is_valid_topic_filter, is_valid_topic_name};

use inflight::{Exchange, ExchangeKind, Frame, InFlightTable, MAX_INFLIGHT, PublishStage};
use subscriptions::SubscriptionTable;

pub use inflight::{Failure, MAX_FRAME_LEN, Outcome, Ticket};
pub use keep_alive::{KeepAlive, KeepAliveAction};
pub use subscriptions::MAX_SUBSCRIPTIONS;

/// QoS 0 frames queued ahead of the writer.
pub const OUTBOX_DEPTH: usize = 8;

/// Inbound QoS 2 messages that may await PUBREL at once.
///
/// A broker that exceeds it gets its connection closed. The unanswered PUBLISH is
/// sent again when a persistent session resumes.
pub const MAX_PENDING_RELEASE: usize = 4;

const MAX_WAITERS: usize = 8;

/// Lifecycle of the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The connection dropped and the supervisor is waiting out a backoff delay
    /// or re-establishing the session.
    Reconnecting,
    Disconnecting,
}

/// Result of trying to queue work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue<T> {
    Queued(T),
    /// No room right now; retry once a waiter is woken.
    Full,
}

/// What the event loop has to do after the session processed an inbound packet.
#[derive(Debug)]
pub enum Inbound {
    Nothing,
    Reply(MqttPacket<'static>),
    /// Hand the message to the application, then send the acknowledgment.
    Deliver(Message, Option<MqttPacket<'static>>),
    /// Send the acknowledgment, then hand the message to the application.
    Release(MqttPacket<'static>, Message),
    /// The packet cannot be honoured on this connection. Nothing was acknowledged.
    Fault(ProtocolError),
}

struct Queued {
    seq: u64,
    frame: Frame,
}

/// An inbound QoS 2 publish that has been answered with PUBREC.
struct PendingRelease {
    packet_id: u16,
    message: Message,
}

pub struct Session {
    state: ConnectionState,
    options: MqttOptions,
    inflight: InFlightTable,
    outbox: Deque<Queued, OUTBOX_DEPTH>,
    next_seq: u64,
    pending_release: Vec<PendingRelease, MAX_PENDING_RELEASE>,
    subscriptions: SubscriptionTable,
    waiters: MultiWakerRegistration<MAX_WAITERS>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            options: MqttOptions::default(),
            inflight: InFlightTable::new(),
            outbox: Deque::new(),
            next_seq: 0,
            pending_release: Vec::new(),
            subscriptions: SubscriptionTable::new(),
            waiters: MultiWakerRegistration::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// Wakes `waker` the next time an exchange completes or queue space frees up.
    pub fn register_waiter(&mut self, waker: &Waker) {
        self.waiters.register(waker);
    }

    fn wake_waiters(&mut self) {
        self.waiters.wake();
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    // --- Lifecycle ---

    /// Accepts `options` for a new connection attempt.
    pub fn begin_connect(&mut self, options: MqttOptions) -> Result<(), ConnectError> {
        if self.state != ConnectionState::Disconnected {
            return Err(ConnectError::AlreadyConnected);
        }
        if options.client_id.is_empty() && !options.clean_session {
            return Err(ConnectError::InvalidClientId);
        }
        if options.clean_session != self.options.clean_session
            || options.client_id != self.options.client_id
        {
            self.subscriptions.clear();
            self.pending_release.clear();
        }
        self.options = options;
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    pub fn encode_connect(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let options = &self.options;
        let mut connect = Connect::new(
            &options.client_id,
            options.keep_alive_secs,
            options.clean_session,
        );
        connect.username = options.username.as_deref();
        connect.password = options.password.as_deref();
        connect.will = options.last_will.as_ref().map(|will| LastWill {
            topic: &will.topic,
            message: &will.message,
            qos: will.qos,
            retain: will.retain,
        });
        connect.encode(buf)
    }

    /// Moves to `Connected` after an accepted CONNACK.
    ///
    /// When the broker kept no state for us, or we asked for a clean session, the
    /// subscription table and inbound QoS 2 state start over. With a persistent
    /// session every exchange that already went out is queued for replay: PUBLISH
    /// frames get the DUP flag, the second QoS 2 stage resends PUBREL. Replays keep
    /// their original enqueue order and precede anything queued later.
    pub fn on_connack(&mut self, session_present: bool) {
        self.state = ConnectionState::Connected;
        if self.options.clean_session || !session_present {
            self.subscriptions.clear();
            self.pending_release.clear();
        }
        if self.options.clean_session {
            return;
        }
        let mut replayed = 0u32;
        for (_, exchange) in self.inflight.active_mut() {
            if exchange.sent {
                exchange.sent = false;
                packet::mark_duplicate(&mut exchange.frame);
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!("session resumed, replaying {} exchanges", replayed);
        }
    }

    /// Applies the loss of the connection.
    ///
    /// Subscribe and unsubscribe requests fail, since their acks cannot arrive on a
    /// new connection. Publishes survive for a persistent session and fail
    /// otherwise. Queued QoS 0 frames are dropped.
    pub fn connection_lost(&mut self) {
        self.state = ConnectionState::Reconnecting;
        self.outbox.clear();
        let clean = self.options.clean_session;
        self.inflight.fail_where(Failure::ConnectionLost, |exchange| {
            clean || !matches!(exchange.kind, ExchangeKind::Publish { .. })
        });
        if clean {
            self.pending_release.clear();
        }
        self.wake_waiters();
    }

    /// Tears the session down. Every waiter gets `failure`.
    pub fn shutdown(&mut self, failure: Failure) {
        self.state = ConnectionState::Disconnected;
        self.outbox.clear();
        self.inflight.fail_where(failure, |_| true);
        self.pending_release.clear();
        self.subscriptions.clear();
        self.wake_waiters();
    }

    // --- Queuing (façade side) ---

    pub fn try_publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Enqueue<Option<Ticket>>, PublishError> {
        if self.state != ConnectionState::Connected {
            return Err(PublishError::NotConnected);
        }
        if !is_valid_topic_name(topic) || topic.len() > MAX_TOPIC_LEN {
            return Err(PublishError::InvalidTopic);
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PublishError::PayloadTooLarge);
        }
        let mut publish = Publish {
            topic,
            qos,
            dup: false,
            retain,
            payload,
            packet_id: None,
        };

        if qos == QoS::AtMostOnce {
            if self.outbox.is_full() {
                return Ok(Enqueue::Full);
            }
            let frame = encode_frame(&publish).map_err(|_| PublishError::PayloadTooLarge)?;
            let seq = self.next_seq();
            let _ = self.outbox.push_back(Queued { seq, frame });
            return Ok(Enqueue::Queued(None));
        }

        let stage = if qos == QoS::AtLeastOnce {
            PublishStage::AwaitingAck
        } else {
            PublishStage::AwaitingRec
        };
        let seq = self.next_seq + 1;
        let ticket = self
            .inflight
            .insert(seq, ExchangeKind::Publish { stage }, |packet_id| {
                publish.packet_id = Some(packet_id);
                encode_frame(&publish)
            })
            .map_err(|_| PublishError::PayloadTooLarge)?;
        match ticket {
            Some(ticket) => {
                self.next_seq = seq;
                debug!("queued publish id={} qos={}", ticket.packet_id, qos as u8);
                Ok(Enqueue::Queued(Some(ticket)))
            }
            None => Ok(Enqueue::Full),
        }
    }

    pub fn try_subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
    ) -> Result<Enqueue<Ticket>, SubscribeError> {
        if self.state != ConnectionState::Connected {
            return Err(SubscribeError::NotConnected);
        }
        if !is_valid_topic_filter(filter) {
            return Err(SubscribeError::InvalidFilter);
        }
        let owned = copy_str(filter).ok_or(SubscribeError::InvalidFilter)?;
        let seq = self.next_seq + 1;
        let kind = ExchangeKind::Subscribe { filter: owned };
        let ticket = self
            .inflight
            .insert(seq, kind, |packet_id| {
                encode_frame(&Subscribe::new(packet_id, filter, qos))
            })
            .map_err(|_| SubscribeError::InvalidFilter)?;
        Ok(self.queued(seq, ticket))
    }

    pub fn try_unsubscribe(&mut self, filter: &str) -> Result<Enqueue<Ticket>, UnsubscribeError> {
        if self.state != ConnectionState::Connected {
            return Err(UnsubscribeError::NotConnected);
        }
        if !is_valid_topic_filter(filter) {
            return Err(UnsubscribeError::InvalidFilter);
        }
        let owned = copy_str(filter).ok_or(UnsubscribeError::InvalidFilter)?;
        let seq = self.next_seq + 1;
        let ticket = self
            .inflight
            .insert(seq, ExchangeKind::Unsubscribe { filter: owned }, |packet_id| {
                encode_frame(&Unsubscribe::new(packet_id, filter))
            })
            .map_err(|_| UnsubscribeError::InvalidFilter)?;
        Ok(self.queued(seq, ticket))
    }

    fn queued(&mut self, seq: u64, ticket: Option<Ticket>) -> Enqueue<Ticket> {
        match ticket {
            Some(ticket) => {
                self.next_seq = seq;
                Enqueue::Queued(ticket)
            }
            None => Enqueue::Full,
        }
    }

    /// Outcome of the exchange behind `ticket`, or `None` while it is running.
    pub fn poll_outcome(&mut self, ticket: &Ticket) -> Option<Outcome> {
        let outcome = self.inflight.take_outcome(ticket);
        if outcome.is_some() {
            // A slot was freed.
            self.wake_waiters();
        }
        outcome
    }

    pub fn detach(&mut self, ticket: &Ticket) {
        self.inflight.detach(ticket);
        self.wake_waiters();
    }

    // --- Writer side ---

    /// Copies the next frame due for transmission into `buf` and marks it sent.
    ///
    /// Frames go out in enqueue order. Exchanges that are due for retransmission
    /// or replay count with their original position.
    pub fn next_outgoing(&mut self, buf: &mut [u8], now: Instant) -> Option<usize> {
        let exchange = self
            .inflight
            .active()
            .filter(|(_, e)| !e.sent)
            .min_by_key(|(_, e)| e.seq)
            .map(|(slot, e)| (slot, e.seq));
        let queued = self.outbox.front().map(|q| q.seq);

        match (exchange, queued) {
            (Some((slot, seq)), queued) if queued.is_none_or(|q| seq < q) => {
                let exchange = self.inflight.get_mut(slot)?;
                let len = exchange.frame.len();
                buf.get_mut(..len)?.copy_from_slice(&exchange.frame);
                exchange.sent = true;
                exchange.last_sent = now;
                Some(len)
            }
            (_, Some(_)) => {
                let queued = self.outbox.pop_front()?;
                let len = queued.frame.len();
                buf.get_mut(..len)?.copy_from_slice(&queued.frame);
                self.wake_waiters();
                Some(len)
            }
            _ => None,
        }
    }

    /// Retransmits overdue publishes and expires overdue subscribe/unsubscribe
    /// requests.
    pub fn tick(&mut self, now: Instant) {
        let retry_interval = self.options.retry_interval;
        let ack_timeout = self.options.ack_timeout;
        let max_retries = self.options.max_retries;
        let mut ended: Vec<(usize, Failure), MAX_INFLIGHT> = Vec::new();

        for (slot, exchange) in self.inflight.active_mut() {
            if !exchange.sent {
                continue;
            }
            let is_publish = matches!(exchange.kind, ExchangeKind::Publish { .. });
            let timeout = if is_publish { retry_interval } else { ack_timeout };
            if !is_due(exchange.last_sent, timeout, now) {
                continue;
            }
            if !is_publish {
                warn!("no ack for packet id={}", exchange.packet_id);
                let _ = ended.push((slot, Failure::Timeout));
            } else if exchange.retries >= max_retries {
                warn!(
                    "publish id={} unacknowledged after {} retries",
                    exchange.packet_id,
                    exchange.retries
                );
                let _ = ended.push((slot, Failure::RetryExhausted));
            } else {
                exchange.retries += 1;
                exchange.sent = false;
                packet::mark_duplicate(&mut exchange.frame);
                debug!(
                    "retransmitting id={} attempt {}",
                    exchange.packet_id,
                    exchange.retries
                );
            }
        }

        if !ended.is_empty() {
            for (slot, failure) in ended {
                self.inflight.complete(slot, Outcome::Failed(failure));
            }
            self.wake_waiters();
        }
    }

    /// Whether frames are waiting for the writer.
    pub fn has_outgoing(&self) -> bool {
        !self.outbox.is_empty() || self.inflight.active().any(|(_, e)| !e.sent)
    }

    /// Earliest instant at which [`tick`](Self::tick) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inflight
            .active()
            .filter(|(_, e)| e.sent)
            .filter_map(|(_, e)| {
                let timeout = match e.kind {
                    ExchangeKind::Publish { .. } => self.options.retry_interval,
                    _ => self.options.ack_timeout,
                };
                e.last_sent.checked_add(timeout)
            })
            .min()
    }

    // --- Reader side ---

    /// Applies one packet received from the broker.
    pub fn handle_packet(&mut self, packet: MqttPacket<'_>, now: Instant) -> Inbound {
        match packet {
            MqttPacket::Publish(publish) => self.on_publish(&publish),
            MqttPacket::PubAck(ack) => {
                self.finish_publish(ack.packet_id, PublishStage::AwaitingAck, "PUBACK");
                Inbound::Nothing
            }
            MqttPacket::PubRec(rec) => self.on_pubrec(rec.packet_id, now),
            MqttPacket::PubRel(rel) => {
                let comp = MqttPacket::PubComp(PubComp {
                    packet_id: rel.packet_id,
                });
                match self
                    .pending_release
                    .iter()
                    .position(|p| p.packet_id == rel.packet_id)
                {
                    Some(index) => {
                        let pending = self.pending_release.swap_remove(index);
                        Inbound::Release(comp, pending.message)
                    }
                    None => {
                        debug!("PUBREL for unknown id={}", rel.packet_id);
                        Inbound::Reply(comp)
                    }
                }
            }
            MqttPacket::PubComp(comp) => {
                self.finish_publish(comp.packet_id, PublishStage::AwaitingComp, "PUBCOMP");
                Inbound::Nothing
            }
            MqttPacket::SubAck(suback) => {
                let Some(slot) = self.inflight.find(suback.packet_id) else {
                    warn!("SUBACK for unknown id={}", suback.packet_id);
                    return Inbound::Nothing;
                };
                let Some(Exchange {
                    kind: ExchangeKind::Subscribe { filter },
                    ..
                }) = self.inflight.get_mut(slot)
                else {
                    warn!("SUBACK for non-subscribe id={}", suback.packet_id);
                    return Inbound::Nothing;
                };
                let outcome = match suback.return_codes.as_slice() {
                    [SubAckReturnCode::Success(granted)] => {
                        if !self.subscriptions.insert(filter, *granted) {
                            warn!("subscription table full, filter not tracked");
                        }
                        Outcome::Granted(*granted)
                    }
                    [SubAckReturnCode::Failure] => Outcome::Failed(Failure::Rejected),
                    _ => {
                        warn!(
                            "SUBACK id={} carries {} return codes",
                            suback.packet_id,
                            suback.return_codes.len()
                        );
                        Outcome::Failed(Failure::Protocol(ProtocolError::MalformedPacket))
                    }
                };
                self.inflight.complete(slot, outcome);
                self.wake_waiters();
                Inbound::Nothing
            }
            MqttPacket::UnsubAck(unsuback) => {
                let Some(slot) = self.inflight.find(unsuback.packet_id) else {
                    warn!("UNSUBACK for unknown id={}", unsuback.packet_id);
                    return Inbound::Nothing;
                };
                let Some(Exchange {
                    kind: ExchangeKind::Unsubscribe { filter },
                    ..
                }) = self.inflight.get_mut(slot)
                else {
                    warn!("UNSUBACK for non-unsubscribe id={}", unsuback.packet_id);
                    return Inbound::Nothing;
                };
                self.subscriptions.remove(filter);
                self.inflight.complete(slot, Outcome::Unsubscribed);
                self.wake_waiters();
                Inbound::Nothing
            }
            MqttPacket::PingResp => Inbound::Nothing,
            other => {
                warn!("unexpected packet type {}", other.packet_type());
                Inbound::Nothing
            }
        }
    }

    fn on_publish(&mut self, publish: &Publish<'_>) -> Inbound {
        if !self.subscriptions.matches(publish.topic) {
            debug!("publish on {} matches no local subscription", publish.topic);
        }
        let Some(message) = Message::from_publish(publish) else {
            return match publish.packet_id {
                None => {
                    warn!("QoS 0 message on {} exceeds inline storage, dropped", publish.topic);
                    Inbound::Nothing
                }
                // Acknowledging would confirm a message the application never sees.
                Some(packet_id) => {
                    error!("message id={} on {} exceeds inline storage", packet_id, publish.topic);
                    Inbound::Fault(ProtocolError::PayloadTooLarge)
                }
            };
        };

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) | (_, None) => Inbound::Deliver(message, None),
            (QoS::AtLeastOnce, Some(packet_id)) => {
                Inbound::Deliver(message, Some(MqttPacket::PubAck(PubAck { packet_id })))
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                let rec = MqttPacket::PubRec(PubRec { packet_id });
                if self.pending_release.iter().any(|p| p.packet_id == packet_id) {
                    debug!("duplicate QoS 2 publish id={}", packet_id);
                    return Inbound::Reply(rec);
                }
                if self
                    .pending_release
                    .push(PendingRelease { packet_id, message })
                    .is_err()
                {
                    error!("more than {} QoS 2 messages awaiting release", MAX_PENDING_RELEASE);
                    return Inbound::Fault(ProtocolError::ReceiveLimitExceeded);
                }
                Inbound::Reply(rec)
            }
        }
    }

    fn on_pubrec(&mut self, packet_id: u16, now: Instant) -> Inbound {
        let rel = MqttPacket::PubRel(PubRel { packet_id });
        let Some(exchange) = self
            .inflight
            .find(packet_id)
            .and_then(|slot| self.inflight.get_mut(slot))
        else {
            warn!("PUBREC for unknown id={}", packet_id);
            return Inbound::Nothing;
        };
        match &mut exchange.kind {
            ExchangeKind::Publish {
                stage: stage @ PublishStage::AwaitingRec,
            } => {
                let Ok(frame) = encode_frame(&rel) else {
                    return Inbound::Nothing;
                };
                *stage = PublishStage::AwaitingComp;
                exchange.frame = frame;
                exchange.retries = 0;
                exchange.sent = true;
                exchange.last_sent = now;
                Inbound::Reply(rel)
            }
            ExchangeKind::Publish {
                stage: PublishStage::AwaitingComp,
            } => {
                exchange.last_sent = now;
                Inbound::Reply(rel)
            }
            _ => {
                warn!("PUBREC for id={} in wrong state", packet_id);
                Inbound::Nothing
            }
        }
    }

    fn finish_publish(&mut self, packet_id: u16, expected: PublishStage, kind: &str) {
        let slot = self.inflight.find(packet_id).filter(|slot| {
            self.inflight
                .get(*slot)
                .is_some_and(|e| e.kind == ExchangeKind::Publish { stage: expected })
        });
        match slot {
            Some(slot) => {
                debug!("{} id={}, delivery complete", kind, packet_id);
                self.inflight.complete(slot, Outcome::Delivered);
                self.wake_waiters();
            }
            None => warn!("{} for unknown id={}", kind, packet_id),
        }
    }
}

fn is_due(last_sent: Instant, timeout: Duration, now: Instant) -> bool {
    last_sent.checked_add(timeout).is_none_or(|due| now >= due)
}

fn encode_frame(packet: &impl EncodePacket) -> Result<Frame, ProtocolError> {
    let mut frame = Frame::new();
    frame
        .resize(MAX_FRAME_LEN, 0)
        .map_err(|_| ProtocolError::BufferTooSmall)?;
    let len = packet.encode(&mut frame)?;
    frame.truncate(len);
    Ok(frame)
}
