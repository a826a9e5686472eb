//! # MQTT Packet Structures and Serialization
//!
//! This module defines the MQTT v3.1.1 control packets and the traits for encoding and
//! decoding them to and from a byte buffer.
//!
//! Decoded packets borrow their strings and payloads from the receive buffer, so
//! decoding never copies. [`decode`] works on a partially filled buffer: it returns
//! `Ok(None)` until the whole frame announced by the fixed header is present.

use crate::error::{ConnectReturnCode, ProtocolError};
use crate::util::{
    self, HEADER_RESERVE, VarInt, read_binary, read_u16, read_utf8_string, write_binary,
    write_bytes, write_u8, write_u16, write_utf8_string,
};
use heapless::Vec;

/// Maximum number of topic filters carried by one SUBSCRIBE or UNSUBSCRIBE packet.
pub const MAX_TOPICS_PER_PACKET: usize = 8;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

// Fixed header packet types (upper nibble).
const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

// PUBLISH fixed-header flag bits.
const DUP_FLAG: u8 = 0x08;
const RETAIN_FLAG: u8 = 0x01;

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQoS(val)),
        }
    }
}

/// A trait for packets that can be encoded into a byte buffer.
pub trait EncodePacket {
    /// Writes the complete frame (fixed header included) to the start of `buf`
    /// and returns its length.
    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError>;
}

/// A trait for packets that can be decoded from the body of a frame.
pub trait DecodePacket<'a>: Sized {
    /// Decodes the packet from its variable header and payload. `flags` is the
    /// lower nibble of the fixed header.
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError>;
}

/// An enumeration of all MQTT v3.1.1 control packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MqttPacket<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    Subscribe(Subscribe<'a>),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe<'a>),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl MqttPacket<'_> {
    /// The packet type number from the fixed header.
    pub fn packet_type(&self) -> u8 {
        match self {
            MqttPacket::Connect(_) => CONNECT,
            MqttPacket::ConnAck(_) => CONNACK,
            MqttPacket::Publish(_) => PUBLISH,
            MqttPacket::PubAck(_) => PUBACK,
            MqttPacket::PubRec(_) => PUBREC,
            MqttPacket::PubRel(_) => PUBREL,
            MqttPacket::PubComp(_) => PUBCOMP,
            MqttPacket::Subscribe(_) => SUBSCRIBE,
            MqttPacket::SubAck(_) => SUBACK,
            MqttPacket::Unsubscribe(_) => UNSUBSCRIBE,
            MqttPacket::UnsubAck(_) => UNSUBACK,
            MqttPacket::PingReq => PINGREQ,
            MqttPacket::PingResp => PINGRESP,
            MqttPacket::Disconnect => DISCONNECT,
        }
    }
}

impl EncodePacket for MqttPacket<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        match self {
            MqttPacket::Connect(p) => p.encode(buf),
            MqttPacket::ConnAck(p) => p.encode(buf),
            MqttPacket::Publish(p) => p.encode(buf),
            MqttPacket::PubAck(p) => p.encode(buf),
            MqttPacket::PubRec(p) => p.encode(buf),
            MqttPacket::PubRel(p) => p.encode(buf),
            MqttPacket::PubComp(p) => p.encode(buf),
            MqttPacket::Subscribe(p) => p.encode(buf),
            MqttPacket::SubAck(p) => p.encode(buf),
            MqttPacket::Unsubscribe(p) => p.encode(buf),
            MqttPacket::UnsubAck(p) => p.encode(buf),
            MqttPacket::PingReq => encode_empty(buf, PINGREQ << 4),
            MqttPacket::PingResp => encode_empty(buf, PINGRESP << 4),
            MqttPacket::Disconnect => encode_empty(buf, DISCONNECT << 4),
        }
    }
}

/// Returns the total length of the frame at the start of `buf`, or `None` while the
/// fixed header itself is still incomplete.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    Ok(fixed_header(buf)?.map(|(header_len, remaining)| header_len + remaining))
}

/// Splits the fixed header into its own length and the announced remaining length.
fn fixed_header(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    match util::read_variable_byte_integer(&buf[1..])? {
        VarInt::Complete(remaining, len_bytes) => Ok(Some((1 + len_bytes, remaining))),
        VarInt::Incomplete => Ok(None),
    }
}

/// Decodes the first complete frame in `buf`.
///
/// Returns the packet and the number of bytes it consumed, or `Ok(None)` when fewer
/// bytes are available than the fixed header declares.
pub fn decode(buf: &[u8]) -> Result<Option<(MqttPacket<'_>, usize)>, ProtocolError> {
    let Some((header_len, remaining)) = fixed_header(buf)? else {
        return Ok(None);
    };
    let total = header_len + remaining;
    if buf.len() < total {
        return Ok(None);
    }

    let packet_type = buf[0] >> 4;
    let flags = buf[0] & 0x0F;
    let body = &buf[header_len..total];

    let expected_flags = match packet_type {
        PUBLISH => flags,
        PUBREL | SUBSCRIBE | UNSUBSCRIBE => 0x02,
        CONNECT..=DISCONNECT => 0x00,
        _ => return Err(ProtocolError::InvalidPacketType(packet_type)),
    };
    if flags != expected_flags {
        return Err(ProtocolError::InvalidFlags(packet_type));
    }

    let packet = match packet_type {
        CONNECT => MqttPacket::Connect(Connect::decode(flags, body)?),
        CONNACK => MqttPacket::ConnAck(ConnAck::decode(flags, body)?),
        PUBLISH => MqttPacket::Publish(Publish::decode(flags, body)?),
        PUBACK => MqttPacket::PubAck(PubAck::decode(flags, body)?),
        PUBREC => MqttPacket::PubRec(PubRec::decode(flags, body)?),
        PUBREL => MqttPacket::PubRel(PubRel::decode(flags, body)?),
        PUBCOMP => MqttPacket::PubComp(PubComp::decode(flags, body)?),
        SUBSCRIBE => MqttPacket::Subscribe(Subscribe::decode(flags, body)?),
        SUBACK => MqttPacket::SubAck(SubAck::decode(flags, body)?),
        UNSUBSCRIBE => MqttPacket::Unsubscribe(Unsubscribe::decode(flags, body)?),
        UNSUBACK => MqttPacket::UnsubAck(UnsubAck::decode(flags, body)?),
        PINGREQ => decode_empty(body, MqttPacket::PingReq)?,
        PINGRESP => decode_empty(body, MqttPacket::PingResp)?,
        _ => decode_empty(body, MqttPacket::Disconnect)?,
    };

    Ok(Some((packet, total)))
}

/// Sets the DUP flag on an already encoded PUBLISH frame.
pub(crate) fn mark_duplicate(frame: &mut [u8]) {
    if let Some(header) = frame.first_mut()
        && *header >> 4 == PUBLISH
    {
        *header |= DUP_FLAG;
    }
}

fn encode_empty(buf: &mut [u8], header: u8) -> Result<usize, ProtocolError> {
    if buf.len() < 2 {
        return Err(ProtocolError::BufferTooSmall);
    }
    buf[0] = header;
    buf[1] = 0x00;
    Ok(2)
}

fn decode_empty<'a>(body: &[u8], packet: MqttPacket<'a>) -> Result<MqttPacket<'a>, ProtocolError> {
    if body.is_empty() {
        Ok(packet)
    } else {
        Err(ProtocolError::MalformedPacket)
    }
}

fn ensure_consumed(cursor: usize, body: &[u8]) -> Result<(), ProtocolError> {
    if cursor == body.len() {
        Ok(())
    } else {
        Err(ProtocolError::MalformedPacket)
    }
}

fn read_packet_id(cursor: &mut usize, body: &[u8]) -> Result<u16, ProtocolError> {
    match read_u16(cursor, body)? {
        0 => Err(ProtocolError::MalformedPacket),
        id => Ok(id),
    }
}

// --- CONNECT Packet ---

/// Last-will message registered with the broker in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub message: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect<'a> {
    pub client_id: &'a str,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    pub will: Option<LastWill<'a>>,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
            username: None,
            password: None,
            will: None,
        }
    }
}

impl EncodePacket for Connect<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        if self.password.is_some() && self.username.is_none() {
            // MQTT 3.1.1 forbids a password without a username.
            return Err(ProtocolError::MalformedPacket);
        }
        let mut cursor = HEADER_RESERVE;
        write_utf8_string(&mut cursor, buf, PROTOCOL_NAME)?;
        write_u8(&mut cursor, buf, PROTOCOL_LEVEL)?;

        let mut flags = 0;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &self.will {
            flags |= 0x04 | ((will.qos as u8) << 3);
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        write_u8(&mut cursor, buf, flags)?;
        write_u16(&mut cursor, buf, self.keep_alive)?;

        write_utf8_string(&mut cursor, buf, self.client_id)?;
        if let Some(will) = &self.will {
            write_utf8_string(&mut cursor, buf, will.topic)?;
            write_binary(&mut cursor, buf, will.message)?;
        }
        if let Some(username) = self.username {
            write_utf8_string(&mut cursor, buf, username)?;
        }
        if let Some(password) = self.password {
            write_binary(&mut cursor, buf, password)?;
        }
        util::finish_frame(buf, CONNECT << 4, cursor)
    }
}

impl<'a> DecodePacket<'a> for Connect<'a> {
    fn decode(_flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut cursor = 0;
        if read_utf8_string(&mut cursor, body)? != PROTOCOL_NAME {
            return Err(ProtocolError::MalformedPacket);
        }
        let level = *body.get(cursor).ok_or(ProtocolError::MalformedPacket)?;
        let connect_flags = *body.get(cursor + 1).ok_or(ProtocolError::MalformedPacket)?;
        cursor += 2;
        if level != PROTOCOL_LEVEL || connect_flags & 0x01 != 0 {
            return Err(ProtocolError::MalformedPacket);
        }
        let keep_alive = read_u16(&mut cursor, body)?;
        let client_id = read_utf8_string(&mut cursor, body)?;

        let will = if connect_flags & 0x04 != 0 {
            let qos = QoS::try_from((connect_flags >> 3) & 0x03)?;
            let topic = read_utf8_string(&mut cursor, body)?;
            let message = read_binary(&mut cursor, body)?;
            Some(LastWill {
                topic,
                message,
                qos,
                retain: connect_flags & 0x20 != 0,
            })
        } else if connect_flags & 0x38 != 0 {
            return Err(ProtocolError::MalformedPacket);
        } else {
            None
        };
        let username = if connect_flags & 0x80 != 0 {
            Some(read_utf8_string(&mut cursor, body)?)
        } else {
            None
        };
        let password = if connect_flags & 0x40 != 0 {
            Some(read_binary(&mut cursor, body)?)
        } else {
            None
        };
        ensure_consumed(cursor, body)?;

        Ok(Self {
            client_id,
            keep_alive,
            clean_session: connect_flags & 0x02 != 0,
            username,
            password,
            will,
        })
    }
}

// --- CONNACK Packet ---
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: ConnectReturnCode,
}

impl EncodePacket for ConnAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut cursor = HEADER_RESERVE;
        write_u8(&mut cursor, buf, self.session_present as u8)?;
        write_u8(&mut cursor, buf, self.return_code.into())?;
        util::finish_frame(buf, CONNACK << 4, cursor)
    }
}

impl<'a> DecodePacket<'a> for ConnAck {
    fn decode(_flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let [ack_flags, code] = body else {
            return Err(ProtocolError::MalformedPacket);
        };
        if ack_flags & 0xFE != 0 {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            return_code: ConnectReturnCode::from(*code),
        })
    }
}

// --- PUBLISH Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub dup: bool,
    pub retain: bool,
    pub payload: &'a [u8],
    pub packet_id: Option<u16>,
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let qos = QoS::try_from((flags >> 1) & 0x03)?;
        let dup = flags & DUP_FLAG != 0;
        if qos == QoS::AtMostOnce && dup {
            return Err(ProtocolError::InvalidFlags(PUBLISH));
        }

        let mut cursor = 0;
        let topic = read_utf8_string(&mut cursor, body)?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(read_packet_id(&mut cursor, body)?)
        } else {
            None
        };

        Ok(Publish {
            topic,
            qos,
            dup,
            retain: flags & RETAIN_FLAG != 0,
            payload: &body[cursor..],
            packet_id,
        })
    }
}

impl EncodePacket for Publish<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut header = (PUBLISH << 4) | ((self.qos as u8) << 1);
        if self.dup {
            header |= DUP_FLAG;
        }
        if self.retain {
            header |= RETAIN_FLAG;
        }

        let mut cursor = HEADER_RESERVE;
        write_utf8_string(&mut cursor, buf, self.topic)?;
        match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, None) => {}
            (QoS::AtMostOnce, Some(_)) | (_, None) | (_, Some(0)) => {
                return Err(ProtocolError::MalformedPacket);
            }
            (_, Some(id)) => write_u16(&mut cursor, buf, id)?,
        }
        write_bytes(&mut cursor, buf, self.payload)?;
        util::finish_frame(buf, header, cursor)
    }
}

// --- PUBACK / PUBREC / PUBREL / PUBCOMP / UNSUBACK Packets ---
//
// All five carry nothing but a packet identifier.
macro_rules! id_only_packet {
    ($(#[$meta:meta])* $name:ident, $packet_type:expr, $flags:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
        }

        impl EncodePacket for $name {
            fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
                if buf.len() < 4 {
                    return Err(ProtocolError::BufferTooSmall);
                }
                buf[0] = ($packet_type << 4) | $flags;
                buf[1] = 0x02;
                buf[2..4].copy_from_slice(&self.packet_id.to_be_bytes());
                Ok(4)
            }
        }

        impl<'a> DecodePacket<'a> for $name {
            fn decode(_flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
                let mut cursor = 0;
                let packet_id = read_packet_id(&mut cursor, body)?;
                ensure_consumed(cursor, body)?;
                Ok(Self { packet_id })
            }
        }
    };
}

id_only_packet!(
    /// QoS 1 publish acknowledgment.
    PubAck, PUBACK, 0x00
);
id_only_packet!(
    /// QoS 2 publish received (first step).
    PubRec, PUBREC, 0x00
);
id_only_packet!(
    /// QoS 2 publish release (second step).
    PubRel, PUBREL, 0x02
);
id_only_packet!(
    /// QoS 2 publish complete (third step).
    PubComp, PUBCOMP, 0x00
);
id_only_packet!(
    /// Unsubscribe acknowledgment.
    UnsubAck, UNSUBACK, 0x00
);

// --- SUBSCRIBE Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe<'a> {
    pub packet_id: u16,
    pub topics: Vec<(&'a str, QoS), MAX_TOPICS_PER_PACKET>,
}

impl<'a> Subscribe<'a> {
    /// Creates a new Subscribe packet with a single topic.
    pub fn new(packet_id: u16, topic: &'a str, qos: QoS) -> Self {
        let mut topics = Vec::new();
        let _ = topics.push((topic, qos));
        Self { packet_id, topics }
    }
}

impl<'a> DecodePacket<'a> for Subscribe<'a> {
    fn decode(_flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut cursor = 0;
        let packet_id = read_packet_id(&mut cursor, body)?;
        let mut topics = Vec::new();
        while cursor < body.len() {
            let topic = read_utf8_string(&mut cursor, body)?;
            let requested = *body.get(cursor).ok_or(ProtocolError::MalformedPacket)?;
            cursor += 1;
            if requested & 0xFC != 0 {
                return Err(ProtocolError::MalformedPacket);
            }
            topics
                .push((topic, QoS::try_from(requested)?))
                .map_err(|_| ProtocolError::PayloadTooLarge)?;
        }
        if topics.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(Subscribe { packet_id, topics })
    }
}

impl EncodePacket for Subscribe<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        if self.topics.is_empty() || self.packet_id == 0 {
            return Err(ProtocolError::MalformedPacket);
        }
        let mut cursor = HEADER_RESERVE;
        write_u16(&mut cursor, buf, self.packet_id)?;
        for (topic, qos) in &self.topics {
            write_utf8_string(&mut cursor, buf, topic)?;
            write_u8(&mut cursor, buf, *qos as u8)?;
        }
        util::finish_frame(buf, (SUBSCRIBE << 4) | 0x02, cursor)
    }
}

// --- SUBACK Packet ---

/// Per-filter result carried in a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SubAckReturnCode {
    /// The subscription was accepted with this maximum QoS.
    Success(QoS),
    /// The broker refused the filter (`0x80`).
    Failure,
}

impl TryFrom<u8> for SubAckReturnCode {
    type Error = ProtocolError;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        match val {
            0x80 => Ok(SubAckReturnCode::Failure),
            0..=2 => Ok(SubAckReturnCode::Success(QoS::try_from(val)?)),
            _ => Err(ProtocolError::MalformedPacket),
        }
    }
}

impl From<SubAckReturnCode> for u8 {
    fn from(code: SubAckReturnCode) -> Self {
        match code {
            SubAckReturnCode::Success(qos) => qos as u8,
            SubAckReturnCode::Failure => 0x80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<SubAckReturnCode, MAX_TOPICS_PER_PACKET>,
}

impl<'a> DecodePacket<'a> for SubAck {
    fn decode(_flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut cursor = 0;
        let packet_id = read_packet_id(&mut cursor, body)?;
        let mut return_codes = Vec::new();
        for code in &body[cursor..] {
            return_codes
                .push(SubAckReturnCode::try_from(*code)?)
                .map_err(|_| ProtocolError::PayloadTooLarge)?;
        }
        if return_codes.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(SubAck {
            packet_id,
            return_codes,
        })
    }
}

impl EncodePacket for SubAck {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut cursor = HEADER_RESERVE;
        write_u16(&mut cursor, buf, self.packet_id)?;
        for code in &self.return_codes {
            write_u8(&mut cursor, buf, (*code).into())?;
        }
        util::finish_frame(buf, SUBACK << 4, cursor)
    }
}

// --- UNSUBSCRIBE Packet ---
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe<'a> {
    pub packet_id: u16,
    pub topics: Vec<&'a str, MAX_TOPICS_PER_PACKET>,
}

impl<'a> Unsubscribe<'a> {
    /// Creates a new Unsubscribe packet with a single topic.
    pub fn new(packet_id: u16, topic: &'a str) -> Self {
        let mut topics = Vec::new();
        let _ = topics.push(topic);
        Self { packet_id, topics }
    }
}

impl<'a> DecodePacket<'a> for Unsubscribe<'a> {
    fn decode(_flags: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let mut cursor = 0;
        let packet_id = read_packet_id(&mut cursor, body)?;
        let mut topics = Vec::new();
        while cursor < body.len() {
            topics
                .push(read_utf8_string(&mut cursor, body)?)
                .map_err(|_| ProtocolError::PayloadTooLarge)?;
        }
        if topics.is_empty() {
            return Err(ProtocolError::MalformedPacket);
        }
        Ok(Unsubscribe { packet_id, topics })
    }
}

impl EncodePacket for Unsubscribe<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        if self.topics.is_empty() || self.packet_id == 0 {
            return Err(ProtocolError::MalformedPacket);
        }
        let mut cursor = HEADER_RESERVE;
        write_u16(&mut cursor, buf, self.packet_id)?;
        for topic in &self.topics {
            write_utf8_string(&mut cursor, buf, topic)?;
        }
        util::finish_frame(buf, (UNSUBSCRIBE << 4) | 0x02, cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_vec(packet: &MqttPacket<'_>) -> std::vec::Vec<u8> {
        let mut buf = [0u8; 512];
        let n = packet.encode(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    fn sample_packets() -> std::vec::Vec<MqttPacket<'static>> {
        let mut connect = Connect::new("sensor-01", 60, false);
        connect.username = Some("user");
        connect.password = Some(b"secret");
        connect.will = Some(LastWill {
            topic: "sensors/status",
            message: b"offline",
            qos: QoS::AtLeastOnce,
            retain: true,
        });

        let mut subscribe = Subscribe::new(7, "sensors/+/temp", QoS::AtLeastOnce);
        subscribe.topics.push(("alerts/#", QoS::ExactlyOnce)).unwrap();

        let mut suback_codes = Vec::new();
        suback_codes.push(SubAckReturnCode::Success(QoS::AtLeastOnce)).unwrap();
        suback_codes.push(SubAckReturnCode::Failure).unwrap();

        std::vec![
            MqttPacket::Connect(connect),
            MqttPacket::Connect(Connect::new("", 0, true)),
            MqttPacket::ConnAck(ConnAck {
                session_present: true,
                return_code: ConnectReturnCode::Accepted,
            }),
            MqttPacket::Publish(Publish {
                topic: "sensors/room1/temp",
                qos: QoS::AtMostOnce,
                dup: false,
                retain: true,
                payload: b"{\"id\":1}",
                packet_id: None,
            }),
            MqttPacket::Publish(Publish {
                topic: "sensors/room1/temp",
                qos: QoS::ExactlyOnce,
                dup: true,
                retain: false,
                payload: b"",
                packet_id: Some(65535),
            }),
            MqttPacket::PubAck(PubAck { packet_id: 1 }),
            MqttPacket::PubRec(PubRec { packet_id: 2 }),
            MqttPacket::PubRel(PubRel { packet_id: 3 }),
            MqttPacket::PubComp(PubComp { packet_id: 4 }),
            MqttPacket::Subscribe(subscribe),
            MqttPacket::SubAck(SubAck {
                packet_id: 7,
                return_codes: suback_codes,
            }),
            MqttPacket::Unsubscribe(Unsubscribe::new(8, "sensors/+/temp")),
            MqttPacket::UnsubAck(UnsubAck { packet_id: 8 }),
            MqttPacket::PingReq,
            MqttPacket::PingResp,
            MqttPacket::Disconnect,
        ]
    }

    #[test]
    fn every_packet_type_round_trips() {
        for packet in sample_packets() {
            let bytes = encode_to_vec(&packet);
            let (decoded, consumed) = decode(&bytes).unwrap().unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn every_strict_prefix_is_incomplete() {
        for packet in sample_packets() {
            let bytes = encode_to_vec(&packet);
            for end in 0..bytes.len() {
                assert_eq!(decode(&bytes[..end]), Ok(None), "prefix {} of {:?}", end, packet);
            }
        }
    }

    #[test]
    fn trailing_bytes_are_left_for_the_next_frame() {
        let mut bytes = encode_to_vec(&MqttPacket::PubAck(PubAck { packet_id: 9 }));
        bytes.extend_from_slice(&[0xD0, 0x00]);
        let (packet, consumed) = decode(&bytes).unwrap().unwrap();
        assert_eq!(packet, MqttPacket::PubAck(PubAck { packet_id: 9 }));
        assert_eq!(consumed, 4);
        assert_eq!(decode(&bytes[consumed..]).unwrap().unwrap().0, MqttPacket::PingResp);
    }

    #[test]
    fn publish_encoding_is_bit_exact() {
        let packet = Publish {
            topic: "a/b",
            qos: QoS::AtLeastOnce,
            dup: true,
            retain: true,
            payload: b"hi",
            packet_id: Some(10),
        };
        let mut buf = [0u8; 32];
        let n = packet.encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..n],
            &[0x3B, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x0A, b'h', b'i']
        );
    }

    #[test]
    fn large_payload_uses_multi_byte_length() {
        let payload = [0x55u8; 300];
        let packet = MqttPacket::Publish(Publish {
            topic: "t",
            qos: QoS::AtMostOnce,
            dup: false,
            retain: false,
            payload: &payload,
            packet_id: None,
        });
        let bytes = encode_to_vec(&packet);
        // remaining length = 2 + 1 + 300 = 303 = 0xAF 0x02
        assert_eq!(&bytes[..3], &[0x30, 0xAF, 0x02]);
        assert_eq!(decode(&bytes).unwrap().unwrap().0, packet);
    }

    #[test]
    fn publish_with_qos_three_is_rejected() {
        let bytes = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
        assert_eq!(decode(&bytes), Err(ProtocolError::InvalidQoS(3)));
    }

    #[test]
    fn five_byte_remaining_length_is_rejected() {
        let bytes = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert_eq!(decode(&bytes), Err(ProtocolError::MalformedRemainingLength));
    }

    #[test]
    fn reserved_flags_are_validated() {
        // PUBREL must carry 0b0010.
        assert_eq!(
            decode(&[0x60, 0x02, 0x00, 0x01]),
            Err(ProtocolError::InvalidFlags(PUBREL))
        );
        // PUBACK must carry 0b0000.
        assert_eq!(
            decode(&[0x41, 0x02, 0x00, 0x01]),
            Err(ProtocolError::InvalidFlags(PUBACK))
        );
        assert_eq!(decode(&[0xF0, 0x00]), Err(ProtocolError::InvalidPacketType(15)));
        assert_eq!(decode(&[0x00, 0x00]), Err(ProtocolError::InvalidPacketType(0)));
    }

    #[test]
    fn zero_packet_id_is_malformed() {
        assert_eq!(decode(&[0x40, 0x02, 0x00, 0x00]), Err(ProtocolError::MalformedPacket));
        let qos1_without_id = Publish {
            topic: "t",
            qos: QoS::AtLeastOnce,
            dup: false,
            retain: false,
            payload: b"",
            packet_id: None,
        };
        let mut buf = [0u8; 16];
        assert_eq!(qos1_without_id.encode(&mut buf), Err(ProtocolError::MalformedPacket));
    }

    #[test]
    fn suback_rejects_unknown_return_code() {
        assert_eq!(
            decode(&[0x90, 0x03, 0x00, 0x01, 0x03]),
            Err(ProtocolError::MalformedPacket)
        );
    }

    #[test]
    fn mark_duplicate_only_touches_publish() {
        let mut publish = [0x32, 0x00];
        mark_duplicate(&mut publish);
        assert_eq!(publish[0], 0x3A);

        let mut pubrel = [0x62, 0x02, 0x00, 0x01];
        mark_duplicate(&mut pubrel);
        assert_eq!(pubrel[0], 0x62);
    }

    #[test]
    fn encode_reports_small_buffer() {
        let packet = Publish {
            topic: "sensors/room1/temp",
            qos: QoS::AtMostOnce,
            dup: false,
            retain: false,
            payload: b"payload",
            packet_id: None,
        };
        let mut buf = [0u8; 10];
        assert_eq!(packet.encode(&mut buf), Err(ProtocolError::BufferTooSmall));
    }
}
