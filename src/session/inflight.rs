//! In-flight exchange table.
//!
//! Every QoS 1/2 publish and every SUBSCRIBE/UNSUBSCRIBE occupies one slot from the
//! moment it is queued until its final acknowledgment. The slot keeps the encoded
//! frame for retransmission and, once the exchange finishes, its outcome until the
//! waiting caller collects it.

use embassy_time::Instant;
use heapless::Vec;

use crate::QoS;
use crate::error::{ProtocolError, PublishError, SubscribeError, UnsubscribeError};
use crate::message::{MAX_PAYLOAD_LEN, MAX_TOPIC_LEN, Topic};

/// Maximum number of exchanges awaiting acknowledgment at once.
pub const MAX_INFLIGHT: usize = 8;

/// Largest frame the client ever queues: a PUBLISH with a full-length topic and payload.
pub const MAX_FRAME_LEN: usize = 1 + 4 + 2 + MAX_TOPIC_LEN + 2 + MAX_PAYLOAD_LEN;

/// An encoded control packet.
pub type Frame = Vec<u8, MAX_FRAME_LEN>;

/// Where a QoS 1/2 publish is in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishStage {
    /// QoS 1, PUBLISH sent.
    AwaitingAck,
    /// QoS 2, PUBLISH sent.
    AwaitingRec,
    /// QoS 2, PUBREL sent.
    AwaitingComp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    Publish { stage: PublishStage },
    Subscribe { filter: Topic },
    Unsubscribe { filter: Topic },
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub packet_id: u16,
    /// Enqueue order. Replays and first transmissions follow it.
    pub seq: u64,
    pub kind: ExchangeKind,
    /// The frame to (re)transmit for the current stage.
    pub frame: Frame,
    /// `false` until the writer has taken the frame, and again when it is due for
    /// retransmission.
    pub sent: bool,
    pub last_sent: Instant,
    /// Retransmissions so far in the current stage.
    pub retries: u8,
    token: u32,
    detached: bool,
}

/// Why an exchange ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Failure {
    RetryExhausted,
    Timeout,
    ConnectionLost,
    Cancelled,
    Rejected,
    Protocol(ProtocolError),
}

/// Final result of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Delivered,
    Granted(QoS),
    Unsubscribed,
    Failed(Failure),
}

/// Handle held by the caller that queued an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ticket {
    pub slot: usize,
    pub token: u32,
    pub packet_id: u16,
}

#[derive(Debug)]
enum Slot {
    Free,
    Active(Exchange),
    Done { token: u32, outcome: Outcome },
}

pub struct InFlightTable {
    slots: [Slot; MAX_INFLIGHT],
    last_packet_id: u16,
    next_token: u32,
}

impl Default for InFlightTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InFlightTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { Slot::Free }; MAX_INFLIGHT],
            last_packet_id: 0,
            next_token: 0,
        }
    }

    /// Reserves a slot and a packet identifier for a new exchange.
    ///
    /// Returns `None` when every slot is taken. Identifiers cycle through
    /// `1..=65535` and skip any that an active exchange still holds.
    pub fn insert(
        &mut self,
        seq: u64,
        kind: ExchangeKind,
        encode: impl FnOnce(u16) -> Result<Frame, ProtocolError>,
    ) -> Result<Option<Ticket>, ProtocolError> {
        let Some(slot) = self.slots.iter().position(|s| matches!(s, Slot::Free)) else {
            return Ok(None);
        };
        let packet_id = self.allocate_packet_id();
        let frame = encode(packet_id)?;
        self.last_packet_id = packet_id;
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;
        self.slots[slot] = Slot::Active(Exchange {
            packet_id,
            seq,
            kind,
            frame,
            sent: false,
            last_sent: Instant::from_ticks(0),
            retries: 0,
            token,
            detached: false,
        });
        Ok(Some(Ticket {
            slot,
            token,
            packet_id,
        }))
    }

    fn allocate_packet_id(&self) -> u16 {
        let mut candidate = self.last_packet_id;
        loop {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            if self.find(candidate).is_none() {
                return candidate;
            }
        }
    }

    /// Index of the active exchange holding `packet_id`.
    pub fn find(&self, packet_id: u16) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Slot::Active(e) if e.packet_id == packet_id))
    }

    pub fn get(&self, slot: usize) -> Option<&Exchange> {
        match self.slots.get(slot) {
            Some(Slot::Active(exchange)) => Some(exchange),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Exchange> {
        match self.slots.get_mut(slot) {
            Some(Slot::Active(exchange)) => Some(exchange),
            _ => None,
        }
    }

    pub fn active_mut(&mut self) -> impl Iterator<Item = (usize, &mut Exchange)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Active(exchange) => Some((i, exchange)),
                _ => None,
            })
    }

    pub fn active(&self) -> impl Iterator<Item = (usize, &Exchange)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Active(exchange) => Some((i, exchange)),
                _ => None,
            })
    }

    /// Ends the exchange in `slot`. A detached exchange frees its slot right away.
    pub fn complete(&mut self, slot: usize, outcome: Outcome) {
        let Some(Slot::Active(exchange)) = self.slots.get(slot) else {
            return;
        };
        self.slots[slot] = if exchange.detached {
            Slot::Free
        } else {
            Slot::Done {
                token: exchange.token,
                outcome,
            }
        };
    }

    /// Ends every active exchange that `select` picks. Returns how many ended.
    pub fn fail_where(&mut self, failure: Failure, select: impl Fn(&Exchange) -> bool) -> usize {
        let mut ended = 0;
        for slot in 0..MAX_INFLIGHT {
            if let Slot::Active(exchange) = &self.slots[slot]
                && select(exchange)
            {
                self.complete(slot, Outcome::Failed(failure));
                ended += 1;
            }
        }
        ended
    }

    /// Collects the outcome for `ticket` and frees its slot.
    ///
    /// Returns `None` while the exchange is still running.
    pub fn take_outcome(&mut self, ticket: &Ticket) -> Option<Outcome> {
        match &self.slots[ticket.slot] {
            Slot::Active(exchange) if exchange.token == ticket.token => None,
            Slot::Done { token, outcome } if *token == ticket.token => {
                let outcome = *outcome;
                self.slots[ticket.slot] = Slot::Free;
                Some(outcome)
            }
            _ => Some(Outcome::Failed(Failure::Cancelled)),
        }
    }

    /// Gives up interest in `ticket`. A running exchange keeps going but its outcome
    /// is discarded.
    pub fn detach(&mut self, ticket: &Ticket) {
        match &mut self.slots[ticket.slot] {
            Slot::Active(exchange) if exchange.token == ticket.token => exchange.detached = true,
            Slot::Done { token, .. } if *token == ticket.token => {
                self.slots[ticket.slot] = Slot::Free;
            }
            _ => {}
        }
    }
}

impl From<Failure> for PublishError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::RetryExhausted | Failure::Timeout => PublishError::RetryExhausted,
            Failure::Cancelled => PublishError::Cancelled,
            Failure::ConnectionLost | Failure::Rejected | Failure::Protocol(_) => {
                PublishError::ConnectionLost
            }
        }
    }
}

impl From<Failure> for SubscribeError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::RetryExhausted | Failure::Timeout => SubscribeError::Timeout,
            Failure::ConnectionLost => SubscribeError::ConnectionLost,
            Failure::Cancelled => SubscribeError::Cancelled,
            Failure::Rejected => SubscribeError::Rejected,
            Failure::Protocol(e) => SubscribeError::Protocol(e),
        }
    }
}

impl From<Failure> for UnsubscribeError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::RetryExhausted | Failure::Timeout => UnsubscribeError::Timeout,
            Failure::Cancelled => UnsubscribeError::Cancelled,
            Failure::ConnectionLost | Failure::Rejected | Failure::Protocol(_) => {
                UnsubscribeError::ConnectionLost
            }
        }
    }
}
