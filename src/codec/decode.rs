//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, Publish, QoS, SubAck,
    Subscribe, Unsubscribe, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT v3.1.1 Packet Decoder
pub struct Decoder {
    /// Maximum remaining length accepted
    max_packet_size: usize,
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

    /// Decode a packet from the buffer
    /// Returns `Ok(None)` until a complete frame is buffered, then
    /// (packet, bytes_consumed)
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let flags = first_byte & 0x0F;
        let packet_type = PacketType::from_u8(first_byte >> 4)
            .ok_or(DecodeError::InvalidPacketType(first_byte >> 4))?;

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
            PacketType::Connect => {
                expect_flags(flags, 0)?;
                decode_connect(body)?
            }
            PacketType::ConnAck => {
                expect_flags(flags, 0)?;
                decode_connack(body)?
            }
            PacketType::Publish => decode_publish(flags, body)?,
            PacketType::PubAck => {
                expect_flags(flags, 0)?;
                Packet::PubAck(decode_packet_id(body)?)
            }
            PacketType::PubRec => {
                expect_flags(flags, 0)?;
                Packet::PubRec(decode_packet_id(body)?)
            }
            PacketType::PubRel => {
                expect_flags(flags, 0x02)?;
                Packet::PubRel(decode_packet_id(body)?)
            }
            PacketType::PubComp => {
                expect_flags(flags, 0)?;
                Packet::PubComp(decode_packet_id(body)?)
            }
            PacketType::Subscribe => {
                expect_flags(flags, 0x02)?;
                decode_subscribe(body)?
            }
            PacketType::SubAck => {
                expect_flags(flags, 0)?;
                decode_suback(body)?
            }
            PacketType::Unsubscribe => {
                expect_flags(flags, 0x02)?;
                decode_unsubscribe(body)?
            }
            PacketType::UnsubAck => {
                expect_flags(flags, 0)?;
                Packet::UnsubAck(decode_packet_id(body)?)
            }
            PacketType::PingReq => {
                expect_flags(flags, 0)?;
                Packet::PingReq
            }
            PacketType::PingResp => {
                expect_flags(flags, 0)?;
                Packet::PingResp
            }
            PacketType::Disconnect => {
                expect_flags(flags, 0)?;
                Packet::Disconnect
            }
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags == expected {
        Ok(())
    } else {
        Err(DecodeError::InvalidFlags)
    }
}

fn decode_packet_id(body: &[u8]) -> Result<u16, DecodeError> {
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("acknowledgement length"));
    }
    read_u16(body)
}

fn decode_connect(body: &[u8]) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    let (name, used) = read_string(body)?;
    if name != PROTOCOL_NAME {
        return Err(DecodeError::InvalidProtocolName);
    }
    pos += used;

    let level = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::InvalidProtocolVersion(level));
    }
    pos += 1;

    let connect_flags = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
    if connect_flags & 0x01 != 0 {
        return Err(DecodeError::MalformedPacket("reserved connect flag set"));
    }
    if connect_flags & 0x04 != 0 {
        return Err(DecodeError::MalformedPacket("will messages are not supported"));
    }
    pos += 1;

    let keep_alive = read_u16(&body[pos..])?;
    pos += 2;

    let (client_id, used) = read_string(&body[pos..])?;
    pos += used;

    let username = if connect_flags & 0x80 != 0 {
        let (username, used) = read_string(&body[pos..])?;
        pos += used;
        Some(username.to_string())
    } else {
        None
    };

    let password = if connect_flags & 0x40 != 0 {
        let (password, used) = read_binary(&body[pos..])?;
        pos += used;
        Some(Bytes::copy_from_slice(password))
    } else {
        None
    };

    if pos != body.len() {
        return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
    }

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session: connect_flags & 0x02 != 0,
        keep_alive,
        username,
        password,
    })))
}

fn decode_connack(body: &[u8]) -> Result<Packet, DecodeError> {
    if body.len() != 2 {
        return Err(DecodeError::MalformedPacket("CONNACK length"));
    }
    let return_code =
        ConnectReturnCode::from_u8(body[1]).ok_or(DecodeError::InvalidReturnCode(body[1]))?;
    Ok(Packet::ConnAck(ConnAck {
        session_present: body[0] & 0x01 != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let qos_bits = (flags >> 1) & 0x03;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;

    let (topic, mut pos) = read_string(body)?;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
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

fn decode_subscribe(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < body.len() {
        let (filter, used) = read_string(&body[pos..])?;
        pos += used;
        let qos_byte = *body.get(pos).ok_or(DecodeError::InsufficientData)?;
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
        pos += 1;
        filters.push((filter.to_string(), qos));
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket("SUBSCRIBE without filters"));
    }

    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let return_codes = body[2..]
        .iter()
        .map(|&code| match code {
            0x80 => Ok(None),
            other => QoS::from_u8(other)
                .map(Some)
                .ok_or(DecodeError::InvalidReturnCode(other)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(body: &[u8]) -> Result<Packet, DecodeError> {
    let packet_id = read_u16(body)?;
    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < body.len() {
        let (filter, used) = read_string(&body[pos..])?;
        pos += used;
        filters.push(filter.to_string());
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket("UNSUBSCRIBE without filters"));
    }

    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
