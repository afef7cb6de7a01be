//! The slice of MQTT 3.1.1 a configuration subscriber needs: connect,
//! subscribe at QoS 0, receive publishes, disconnect.

use crate::error::{ApiError, ApiResult};

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const SUBSCRIBE: u8 = 0x82;
const SUBACK: u8 = 0x90;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;
const HAS_PASSWORD: u8 = 0x40;
const HAS_USERNAME: u8 = 0x80;

pub const SUBACK_FAILURE: u8 = 0x80;

/// Packets a subscriber receives from the broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    ConnAck { return_code: u8 },
    SubAck { packet_id: u16, return_codes: Vec<u8> },
    Publish { topic: String, payload: Vec<u8> },
    PingResp,
    /// Anything else, identified by its packet type nibble.
    Other(u8),
}

pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub username: &'a str,
    pub password: &'a str,
    pub keep_alive: u16,
}

pub fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_str(value: &str, out: &mut Vec<u8>) -> ApiResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| ApiError::validation("MQTT string longer than 65535 bytes"))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn frame(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(header);
    encode_remaining_length(body.len(), &mut out);
    out.extend_from_slice(body);
    out
}

pub fn encode_connect(opts: &ConnectOptions) -> ApiResult<Vec<u8>> {
    let mut flags = CLEAN_SESSION;
    if !opts.username.is_empty() {
        flags |= HAS_USERNAME;
        if !opts.password.is_empty() {
            flags |= HAS_PASSWORD;
        }
    }

    let mut body = vec![];
    put_str("MQTT", &mut body)?;
    body.push(PROTOCOL_LEVEL);
    body.push(flags);
    body.extend_from_slice(&opts.keep_alive.to_be_bytes());
    put_str(opts.client_id, &mut body)?;
    if flags & HAS_USERNAME != 0 {
        put_str(opts.username, &mut body)?;
    }
    if flags & HAS_PASSWORD != 0 {
        put_str(opts.password, &mut body)?;
    }

    Ok(frame(CONNECT, &body))
}

pub fn encode_subscribe(packet_id: u16, topics: &[String]) -> ApiResult<Vec<u8>> {
    let mut body = packet_id.to_be_bytes().to_vec();
    for topic in topics {
        put_str(topic, &mut body)?;
        body.push(0);
    }
    Ok(frame(SUBSCRIBE, &body))
}

#[must_use]
pub fn encode_disconnect() -> Vec<u8> {
    vec![DISCONNECT, 0]
}

fn read_u16(buf: &[u8], at: usize) -> ApiResult<u16> {
    buf.get(at..at + 2)
        .map(|x| u16::from_be_bytes([x[0], x[1]]))
        .ok_or_else(|| ApiError::InvalidFormat("truncated MQTT packet".to_string()))
}

impl Packet {
    /// Decodes the first packet of `buf`. Returns the packet and the number
    /// of bytes it used, or `None` when `buf` holds only part of a packet.
    pub fn decode(buf: &[u8]) -> ApiResult<Option<(Self, usize)>> {
        let Some(&header) = buf.first() else {
            return Ok(None);
        };

        let mut len = 0usize;
        let mut shift = 0;
        let mut pos = 1;
        loop {
            let Some(&byte) = buf.get(pos) else {
                return Ok(None);
            };
            len |= usize::from(byte & 0x7F) << shift;
            pos += 1;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 21 {
                return Err(ApiError::InvalidFormat(
                    "MQTT remaining length too long".to_string(),
                ));
            }
        }

        let end = pos + len;
        let Some(body) = buf.get(pos..end) else {
            return Ok(None);
        };

        let packet = match header & 0xF0 {
            CONNACK => Self::ConnAck {
                return_code: body.get(1).copied().unwrap_or(0xFF),
            },
            SUBACK => Self::SubAck {
                packet_id: read_u16(body, 0)?,
                return_codes: body.get(2..).unwrap_or_default().to_vec(),
            },
            PUBLISH => {
                let topic_len = usize::from(read_u16(body, 0)?);
                let topic = body.get(2..2 + topic_len).ok_or_else(|| {
                    ApiError::InvalidFormat("truncated MQTT topic".to_string())
                })?;
                let qos = (header >> 1) & 0x03;
                let payload_at = 2 + topic_len + if qos > 0 { 2 } else { 0 };
                Self::Publish {
                    topic: String::from_utf8_lossy(topic).into_owned(),
                    payload: body.get(payload_at..).unwrap_or_default().to_vec(),
                }
            }
            PINGRESP => Self::PingResp,
            other => Self::Other(other >> 4),
        };

        Ok(Some((packet, end)))
    }
}
