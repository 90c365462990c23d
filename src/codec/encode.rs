//! MQTT Packet Encoder
//!
//! Encodes MQTT v3.1.1 packets. Each variable header and payload is written
//! into a scratch buffer first, then framed with the fixed header.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, PROTOCOL_LEVEL_V311,
    PROTOCOL_NAME,
};

/// MQTT Packet Encoder
#[derive(Debug, Default)]
pub struct Encoder {
    scratch: BytesMut,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a packet to the buffer
    pub fn encode(&mut self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.scratch.clear();

        let first_byte = match packet {
            Packet::Connect(p) => {
                Self::connect_body(p, &mut self.scratch)?;
                0x10
            }
            Packet::ConnAck(p) => {
                Self::connack_body(p, &mut self.scratch);
                0x20
            }
            Packet::Publish(p) => Self::publish_body(p, &mut self.scratch)?,
            Packet::PubAck(p) => {
                self.scratch.put_u16(p.packet_id);
                0x40
            }
            Packet::Subscribe(p) => {
                Self::subscribe_body(p, &mut self.scratch)?;
                // SUBSCRIBE fixed header flags are reserved as 0b0010
                0x82
            }
            Packet::SubAck(p) => {
                Self::suback_body(p, &mut self.scratch);
                0x90
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        buf.reserve(self.scratch.len() + 5);
        buf.put_u8(first_byte);
        write_variable_int(buf, self.scratch.len() as u32)?;
        buf.put_slice(&self.scratch);
        Ok(())
    }

    fn connect_body(packet: &Connect, out: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(out, PROTOCOL_NAME)?;
        out.put_u8(PROTOCOL_LEVEL_V311);

        let mut flags: u8 = 0;
        if packet.clean_session {
            flags |= 0x02;
        }
        if packet.password.is_some() {
            flags |= 0x40;
        }
        if packet.username.is_some() {
            flags |= 0x80;
        }
        out.put_u8(flags);
        out.put_u16(packet.keep_alive);

        write_string(out, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(out, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(out, password)?;
        }
        Ok(())
    }

    fn connack_body(packet: &ConnAck, out: &mut BytesMut) {
        out.put_u8(u8::from(packet.session_present));
        out.put_u8(packet.return_code as u8);
    }

    fn publish_body(packet: &Publish, out: &mut BytesMut) -> Result<u8, EncodeError> {
        if packet.topic.is_empty() || packet.topic.contains(['+', '#']) {
            return Err(EncodeError::InvalidTopicName);
        }
        if packet.qos == QoS::ExactlyOnce {
            return Err(EncodeError::UnsupportedQoS(packet.qos as u8));
        }

        let mut first_byte: u8 = 0x30;
        if packet.dup {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }

        write_string(out, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            let packet_id = packet.packet_id.ok_or(EncodeError::MissingPacketId)?;
            out.put_u16(packet_id);
        }
        out.put_slice(&packet.payload);
        Ok(first_byte)
    }

    fn subscribe_body(packet: &Subscribe, out: &mut BytesMut) -> Result<(), EncodeError> {
        out.put_u16(packet.packet_id);
        for subscription in &packet.subscriptions {
            write_string(out, &subscription.filter)?;
            out.put_u8(subscription.qos as u8);
        }
        Ok(())
    }

    fn suback_body(packet: &SubAck, out: &mut BytesMut) {
        out.put_u16(packet.packet_id);
        out.put_slice(&packet.return_codes);
    }
}
