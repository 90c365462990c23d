//! MQTT Packet Decoder
//!
//! Decodes MQTT v3.1.1 packets from a byte buffer that may hold partial or
//! multiple packets.

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, Publish, QoS, SubAck,
    Subscribe, Subscription, PROTOCOL_LEVEL_V311, PROTOCOL_NAME,
};

/// MQTT Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the front of the buffer.
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold a complete
    /// packet, otherwise the packet and the number of bytes it occupied.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => Self::decode_connect(flags, body)?,
            2 => Self::decode_connack(flags, body)?,
            3 => Self::decode_publish(flags, body)?,
            4 => Self::decode_puback(flags, body)?,
            8 => Self::decode_subscribe(flags, body)?,
            9 => Self::decode_suback(flags, body)?,
            12 => Self::empty(flags, body, Packet::PingReq)?,
            13 => Self::empty(flags, body, Packet::PingResp)?,
            14 => Self::empty(flags, body, Packet::Disconnect)?,
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    fn empty(flags: u8, body: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if !body.is_empty() {
            return Err(DecodeError::MalformedPacket("unexpected payload"));
        }
        Ok(packet)
    }

    fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let (protocol_name, mut pos) = read_string(body)?;
        if protocol_name != PROTOCOL_NAME {
            return Err(DecodeError::InvalidProtocolName);
        }

        let header = body
            .get(pos..pos + 4)
            .ok_or(DecodeError::InsufficientData)?;
        let level = header[0];
        if level != PROTOCOL_LEVEL_V311 {
            return Err(DecodeError::InvalidProtocolVersion(level));
        }
        let connect_flags = header[1];
        let keep_alive = u16::from_be_bytes([header[2], header[3]]);
        pos += 4;

        // Reserved bit must be 0, and this codec carries no will message
        if (connect_flags & 0x01) != 0 || (connect_flags & 0x3C) != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let clean_session = (connect_flags & 0x02) != 0;
        let password_flag = (connect_flags & 0x40) != 0;
        let username_flag = (connect_flags & 0x80) != 0;

        let (client_id, len) = read_string(&body[pos..])?;
        pos += len;

        let username = if username_flag {
            let (s, len) = read_string(&body[pos..])?;
            pos += len;
            Some(s.to_string())
        } else {
            None
        };

        let password = if password_flag {
            let (data, _) = read_binary(&body[pos..])?;
            Some(Bytes::copy_from_slice(data))
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username,
            password,
        })))
    }

    fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let [acknowledge_flags, code] = body else {
            return Err(DecodeError::MalformedPacket("CONNACK must be 2 bytes"));
        };

        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let return_code =
            ConnectReturnCode::from_u8(*code).ok_or(DecodeError::InvalidReturnCode(*code))?;

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            return_code,
        }))
    }

    fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(body)?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&body[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&body[pos..]),
        }))
    }

    fn decode_puback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.len() != 2 {
            return Err(DecodeError::MalformedPacket("PUBACK must be 2 bytes"));
        }
        Ok(Packet::PubAck(PubAck {
            packet_id: read_u16(body)?,
        }))
    }

    fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0x02 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;
        let mut pos = 2;
        let mut subscriptions = Vec::new();

        while pos < body.len() {
            let (filter, len) = read_string(&body[pos..])?;
            pos += len;
            let options = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
            pos += 1;
            if options & 0xFC != 0 {
                return Err(DecodeError::MalformedPacket("reserved subscription bits set"));
            }
            let qos = QoS::from_u8(options).ok_or(DecodeError::InvalidQoS(options))?;
            subscriptions.push(Subscription {
                filter: filter.to_string(),
                qos,
            });
        }

        if subscriptions.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBSCRIBE without topic filters"));
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions,
        }))
    }

    fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(body)?;
        let return_codes = body[2..].to_vec();
        if return_codes.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBACK without return codes"));
        }
        if let Some(code) = return_codes
            .iter()
            .find(|&&c| c > 2 && c != crate::protocol::SUBACK_FAILURE)
        {
            return Err(DecodeError::InvalidReturnCode(*code));
        }

        Ok(Packet::SubAck(SubAck {
            packet_id,
            return_codes,
        }))
    }
}
