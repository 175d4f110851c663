// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Default binary wire format, protocol version 0.
//!
//! Frame layout before escaping:
//!
//! `[version:1][header_len:1][flags:1][name][id:8 if FLAG_ID][rid:8 if FLAG_RID][payload]`
//!
//! `header_len` counts everything up to the payload. Ids are little-endian u64.
//! Every `0xFF` and `0xFE` of header and payload is written as `0xFE, byte ^ 0x40`,
//! then the frame is terminated by a bare `0xFF`.

use std::ops::Range;

use bytes::{BufMut, BytesMut};

use super::codec::{MessageDecoder, MessageEncoder};
use super::{Message, MessageHeader, MessageId};
use crate::{AppError, AppResult};

pub const BINARY_VERSION: u8 = 0;
pub const FRAME_END: u8 = 0xFF;
pub const ESCAPE: u8 = 0xFE;
pub const HEADER_MIN_LEN: usize = 3;
pub const MAX_HEADER_LEN: usize = u8::MAX as usize;

const ESCAPE_MASK: u8 = 0x40;
const FLAG_ID: u8 = 0x01;
const FLAG_RID: u8 = 0x02;
const ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl MessageEncoder for BinaryCodec {
    fn encode(&self, message: &dyn Message, header: &MessageHeader) -> AppResult<BytesMut> {
        let plain = serialize(message, header)?;
        let mut frame = BytesMut::with_capacity(plain.len() + plain.len() / 16 + 1);
        escape_into(&plain, &mut frame);
        frame.put_u8(FRAME_END);
        Ok(frame)
    }
}

impl MessageDecoder for BinaryCodec {
    fn find_frame(&self, buffer: &[u8]) -> Option<Range<usize>> {
        buffer
            .iter()
            .position(|b| *b == FRAME_END)
            .map(|pos| 0..pos + 1)
    }

    fn decode_frame(&self, raw: &[u8]) -> AppResult<BytesMut> {
        match raw.split_last() {
            Some((&FRAME_END, body)) => unescape(body),
            _ => Err(AppError::FrameDecode(
                "frame is not terminated by the end marker".to_string(),
            )),
        }
    }

    fn extract_type_name(&self, decoded: &[u8]) -> AppResult<String> {
        let header = parse_header(decoded)?;
        Ok(header.name.to_string())
    }

    fn read_message(&self, decoded: &[u8], message: &mut dyn Message) -> AppResult<()> {
        let header = parse_header(decoded)?;
        if header.name != message.name() {
            return Err(AppError::FrameDecode(format!(
                "message identifier is invalid, wanted: {}, got: {}",
                message.name(),
                header.name
            )));
        }
        {
            let target = message.header_mut();
            target.id = header.id;
            target.rid = header.rid;
        }
        message.deserialize_payload(&decoded[header.len..])
    }
}

/// Header and payload of `message`, not yet escaped.
pub fn serialize(message: &dyn Message, header: &MessageHeader) -> AppResult<BytesMut> {
    let name = message.name().as_bytes();
    let header_len = HEADER_MIN_LEN
        + name.len()
        + header.id.map_or(0, |_| ID_LEN)
        + header.rid.map_or(0, |_| ID_LEN);
    if header_len > MAX_HEADER_LEN {
        return Err(AppError::SerializationRange(format!(
            "binary header of {} bytes exceeds {} for message {}",
            header_len,
            MAX_HEADER_LEN,
            message.name()
        )));
    }

    let mut flags = 0u8;
    if header.id.is_some() {
        flags |= FLAG_ID;
    }
    if header.rid.is_some() {
        flags |= FLAG_RID;
    }

    let mut buf = BytesMut::with_capacity(header_len + 64);
    buf.put_u8(BINARY_VERSION);
    buf.put_u8(header_len as u8);
    buf.put_u8(flags);
    buf.put_slice(name);
    if let Some(id) = header.id {
        buf.put_u64_le(id.get());
    }
    if let Some(rid) = header.rid {
        buf.put_u64_le(rid.get());
    }
    message.serialize_payload(&mut buf)?;
    Ok(buf)
}

pub fn escape_into(src: &[u8], dst: &mut BytesMut) {
    for &b in src {
        if b == FRAME_END || b == ESCAPE {
            dst.put_u8(ESCAPE);
            dst.put_u8(b ^ ESCAPE_MASK);
        } else {
            dst.put_u8(b);
        }
    }
}

pub fn unescape(src: &[u8]) -> AppResult<BytesMut> {
    let mut out = BytesMut::with_capacity(src.len());
    let mut bytes = src.iter();
    while let Some(&b) = bytes.next() {
        match b {
            ESCAPE => match bytes.next() {
                Some(&escaped) if matches!(escaped ^ ESCAPE_MASK, FRAME_END | ESCAPE) => {
                    out.put_u8(escaped ^ ESCAPE_MASK)
                }
                Some(&escaped) => {
                    return Err(AppError::FrameDecode(format!(
                        "invalid escape sequence 0xfe 0x{:02x}",
                        escaped
                    )))
                }
                None => {
                    return Err(AppError::FrameDecode(
                        "dangling escape byte at frame end".to_string(),
                    ))
                }
            },
            FRAME_END => {
                return Err(AppError::FrameDecode(
                    "unescaped end marker inside frame".to_string(),
                ))
            }
            _ => out.put_u8(b),
        }
    }
    Ok(out)
}

#[derive(Debug)]
struct ParsedHeader<'a> {
    name: &'a str,
    id: Option<MessageId>,
    rid: Option<MessageId>,
    len: usize,
}

fn parse_header(decoded: &[u8]) -> AppResult<ParsedHeader<'_>> {
    if decoded.len() < HEADER_MIN_LEN {
        return Err(AppError::FrameDecode(
            "incomplete header received".to_string(),
        ));
    }
    if decoded[0] != BINARY_VERSION {
        return Err(AppError::FrameDecode(format!(
            "illegal version {}",
            decoded[0]
        )));
    }
    let header_len = decoded[1] as usize;
    if header_len > decoded.len() {
        return Err(AppError::FrameDecode(format!(
            "header length {} exceeds frame length {}",
            header_len,
            decoded.len()
        )));
    }
    let flags = decoded[2];
    if flags & !(FLAG_ID | FLAG_RID) != 0 {
        return Err(AppError::FrameDecode(format!(
            "unknown header flags 0x{:02x}",
            flags
        )));
    }
    let ids_len = ((flags & FLAG_ID != 0) as usize + (flags & FLAG_RID != 0) as usize) * ID_LEN;
    if header_len < HEADER_MIN_LEN + ids_len {
        return Err(AppError::FrameDecode(format!(
            "header length {} too small for flags 0x{:02x}",
            header_len, flags
        )));
    }

    let name_end = header_len - ids_len;
    let name = std::str::from_utf8(&decoded[HEADER_MIN_LEN..name_end])
        .map_err(|e| AppError::FrameDecode(format!("type name is not utf-8: {}", e)))?;

    let mut offset = name_end;
    let mut read_id = |present: bool| -> AppResult<Option<MessageId>> {
        if !present {
            return Ok(None);
        }
        let mut raw = [0u8; ID_LEN];
        raw.copy_from_slice(&decoded[offset..offset + ID_LEN]);
        offset += ID_LEN;
        MessageId::new(u64::from_le_bytes(raw))
            .map(Some)
            .ok_or_else(|| AppError::FrameDecode("present identifier is zero".to_string()))
    };
    let id = read_id(flags & FLAG_ID != 0)?;
    let rid = read_id(flags & FLAG_RID != 0)?;

    Ok(ParsedHeader {
        name,
        id,
        rid,
        len: header_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageFactory, RawMessage};
    use rstest::rstest;

    fn header(id: u64, rid: u64) -> MessageHeader {
        MessageHeader {
            id: MessageId::new(id),
            rid: MessageId::new(rid),
            priority: None,
        }
    }

    #[test]
    fn escape_covers_marker_and_escape_bytes() {
        let mut out = BytesMut::new();
        escape_into(&[0x01, 0xFF, 0xFE, 0x02], &mut out);
        assert_eq!(out.as_ref(), &[0x01, 0xFE, 0xBF, 0xFE, 0xBE, 0x02]);
        assert_eq!(unescape(&out).unwrap().as_ref(), &[0x01, 0xFF, 0xFE, 0x02]);
    }

    #[test]
    fn header_layout_matches_wire_format() {
        let message = RawMessage::with_payload("ab", &b"xy"[..]);
        let plain = serialize(&message, &header(1, 0)).unwrap();
        assert_eq!(plain[0], BINARY_VERSION);
        assert_eq!(plain[1] as usize, 3 + 2 + 8);
        assert_eq!(plain[2], FLAG_ID);
        assert_eq!(&plain[3..5], b"ab");
        assert_eq!(&plain[5..13], &1u64.to_le_bytes());
        assert_eq!(&plain[13..], b"xy");
    }

    #[rstest]
    #[case::no_ids(0, 0)]
    #[case::id_only(42, 0)]
    #[case::rid_only(0, 0xFFFF_FFFF_FFFF_FFFF)]
    #[case::both(0xFEFE, 0xFF)]
    fn decode_restores_name_ids_and_payload(#[case] id: u64, #[case] rid: u64) {
        let payload: Vec<u8> = vec![0xFF, 0x00, 0xFE, 0xFE, 0x40, 0xFF];
        let message = RawMessage::with_payload("ping", payload.clone());
        let frame = BinaryCodec.encode(&message, &header(id, rid)).unwrap();
        assert_eq!(frame.iter().filter(|b| **b == FRAME_END).count(), 1);
        assert_eq!(*frame.last().unwrap(), FRAME_END);

        let factory = MessageFactory::with_raw_fallback();
        let decoded = BinaryCodec.decode(&frame, &factory).unwrap();
        assert_eq!(decoded.name(), "ping");
        assert_eq!(decoded.id(), MessageId::new(id));
        assert_eq!(decoded.rid(), MessageId::new(rid));
        let raw = decoded.downcast_ref::<RawMessage>().unwrap();
        assert_eq!(raw.payload().as_ref(), payload.as_slice());
    }

    #[test]
    fn oversized_header_is_range_error() {
        let name = "n".repeat(MAX_HEADER_LEN);
        let err = BinaryCodec
            .encode(&RawMessage::new(name), &MessageHeader::default())
            .unwrap_err();
        assert!(matches!(err, AppError::SerializationRange(_)));
    }

    #[test]
    fn largest_header_still_fits() {
        let name = "n".repeat(MAX_HEADER_LEN - HEADER_MIN_LEN - 2 * ID_LEN);
        assert!(BinaryCodec
            .encode(&RawMessage::new(name), &header(1, 2))
            .is_ok());
    }

    #[test]
    fn find_frame_stops_at_first_marker() {
        let factory = MessageFactory::with_raw_fallback();
        let mut buffer = BinaryCodec
            .encode(&RawMessage::new("one"), &MessageHeader::default())
            .unwrap();
        let first_len = buffer.len();
        let second = BinaryCodec
            .encode(&RawMessage::new("two"), &MessageHeader::default())
            .unwrap();
        buffer.extend_from_slice(&second[..second.len() - 1]);

        let range = BinaryCodec.find_frame(&buffer).unwrap();
        assert_eq!(range, 0..first_len);
        let message = BinaryCodec.decode(&buffer[range], &factory).unwrap();
        assert_eq!(message.name(), "one");

        assert!(BinaryCodec.find_frame(&buffer[first_len..]).is_none());
    }

    #[rstest]
    #[case::too_short(vec![0x00, 0x03])]
    #[case::bad_version(vec![0x01, 0x03, 0x00])]
    #[case::header_beyond_frame(vec![0x00, 0x20, 0x00, b'a'])]
    #[case::header_smaller_than_ids(vec![0x00, 0x04, 0x01, b'a'])]
    #[case::unknown_flags(vec![0x00, 0x04, 0x80, b'a'])]
    #[case::zero_id(vec![0x00, 0x0C, 0x01, b'a', 0, 0, 0, 0, 0, 0, 0, 0])]
    fn malformed_headers_are_decode_errors(#[case] plain: Vec<u8>) {
        let err = BinaryCodec.extract_type_name(&plain).unwrap_err();
        assert!(err.is_decode_error(), "{:?}", err);
    }

    #[rstest]
    #[case::invalid_escape(vec![0x00, 0xFE, 0x10, FRAME_END])]
    #[case::dangling_escape(vec![0x00, 0xFE, FRAME_END])]
    #[case::missing_marker(vec![0x00, 0x03, 0x00])]
    fn bad_framing_is_decode_error(#[case] raw: Vec<u8>) {
        assert!(BinaryCodec.decode_frame(&raw).unwrap_err().is_decode_error());
    }
}
