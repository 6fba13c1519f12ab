//! MQTT Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT v3.1.1 Packet Encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(id) => self.encode_ack(0x40, *id, buf),
            Packet::PubRec(id) => self.encode_ack(0x50, *id, buf),
            Packet::PubRel(id) => self.encode_ack(0x62, *id, buf),
            Packet::PubComp(id) => self.encode_ack(0x70, *id, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::SubAck(p) => self.encode_suback(p, buf),
            Packet::Unsubscribe(p) => self.encode_unsubscribe(p, buf),
            Packet::UnsubAck(id) => self.encode_ack(0xB0, *id, buf),
            Packet::PingReq => {
                buf.put_slice(&[0xC0, 0x00]);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_slice(&[0xD0, 0x00]);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_slice(&[0xE0, 0x00]);
                Ok(())
            }
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Protocol name + level + flags + keep alive
        let mut remaining_length = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);

        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        write_string(buf, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }
        Ok(())
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20);
        buf.put_u8(0x02);
        buf.put_u8(packet.session_present as u8);
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len() + packet.payload.len();
        if packet.qos != QoS::AtMostOnce {
            if packet.packet_id.is_none() {
                return Err(EncodeError::MissingPacketId);
            }
            remaining_length += 2;
        }

        let mut first = 0x30 | ((packet.qos as u8) << 1);
        if packet.dup {
            first |= 0x08;
        }
        if packet.retain {
            first |= 0x01;
        }
        buf.put_u8(first);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, &packet.topic)?;
        if packet.qos != QoS::AtMostOnce {
            if let Some(id) = packet.packet_id {
                buf.put_u16(id);
            }
        }
        buf.put_slice(&packet.payload);
        Ok(())
    }

    fn encode_ack(&self, first: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(first);
        buf.put_u8(0x02);
        buf.put_u16(packet_id);
        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if packet.filters.is_empty() {
            return Err(EncodeError::EmptySubscription);
        }
        let remaining_length = 2 + packet
            .filters
            .iter()
            .map(|(filter, _)| 2 + filter.len() + 1)
            .sum::<usize>();

        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for (filter, qos) in &packet.filters {
            write_string(buf, filter)?;
            buf.put_u8(*qos as u8);
        }
        Ok(())
    }

    fn encode_suback(&self, packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x90);
        write_variable_int(buf, (2 + packet.return_codes.len()) as u32)?;
        buf.put_u16(packet.packet_id);
        for code in &packet.return_codes {
            buf.put_u8(code.map(|qos| qos as u8).unwrap_or(0x80));
        }
        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        packet: &Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if packet.filters.is_empty() {
            return Err(EncodeError::EmptySubscription);
        }
        let remaining_length = 2 + packet
            .filters
            .iter()
            .map(|filter| 2 + filter.len())
            .sum::<usize>();

        buf.put_u8(0xA2);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        for filter in &packet.filters {
            write_string(buf, filter)?;
        }
        Ok(())
    }
}
