//! Wire codec for the Miniserver binary protocol.
//!
//! Pure functions converting between raw WebSocket payloads and typed
//! values: frame headers, device identifiers, and the two event table
//! layouts (value states and text states). Nothing in here holds state.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// First byte of every binary frame header.
pub const FRAME_MARKER: u8 = 0x03;

/// Length of a binary frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Header info flag set when the length is only an estimate.
const INFO_ESTIMATED: u8 = 0x80;

/// Value event record: 16-byte UUID + little-endian f64.
const VALUE_EVENT_LEN: usize = 24;

/// Fixed part of a text event record: UUID + icon UUID + u32 length.
const TEXT_EVENT_FIXED_LEN: usize = 36;

/// Error types for wire decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Header does not start with the frame marker.
    #[error("malformed frame header (marker 0x{0:02x})")]
    MalformedFrame(u8),

    /// Input has the wrong number of bytes for the requested layout.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Textual identifier does not contain exactly 32 hex digits.
    #[error("invalid identifier format: {0:?}")]
    InvalidFormat(String),

    /// HMAC key from the Miniserver is not valid hex.
    #[error("invalid key encoding")]
    InvalidKeyEncoding,
}

/// Payload kind announced by a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    BinaryFile,
    ValueEvents,
    TextEvents,
    DaytimerEvents,
    OutOfService,
    Keepalive,
    WeatherEvents,
    Unknown(u8),
}

impl From<u8> for FrameKind {
    fn from(value: u8) -> Self {
        match value {
            0 => FrameKind::Text,
            1 => FrameKind::BinaryFile,
            2 => FrameKind::ValueEvents,
            3 => FrameKind::TextEvents,
            4 => FrameKind::DaytimerEvents,
            5 => FrameKind::OutOfService,
            6 => FrameKind::Keepalive,
            7 => FrameKind::WeatherEvents,
            other => FrameKind::Unknown(other),
        }
    }
}

impl FrameKind {
    /// Whether a payload message follows a header of this kind.
    pub fn has_payload(self) -> bool {
        !matches!(self, FrameKind::Keepalive | FrameKind::OutOfService)
    }
}

/// Decoded 8-byte binary frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// The Miniserver sends an estimated header first for large payloads,
    /// followed by the exact one.
    pub estimated: bool,
    pub length: u32,
}

/// Decode a binary frame header.
///
/// Layout: marker, kind, info flags, reserved, u32 little-endian length.
pub fn decode_frame_header(bytes: &[u8]) -> Result<FrameHeader, CodecError> {
    let header: &[u8; HEADER_LEN] = bytes.try_into().map_err(|_| CodecError::InvalidLength {
        expected: HEADER_LEN,
        actual: bytes.len(),
    })?;

    if header[0] != FRAME_MARKER {
        return Err(CodecError::MalformedFrame(header[0]));
    }

    Ok(FrameHeader {
        kind: FrameKind::from(header[1]),
        estimated: header[2] & INFO_ESTIMATED != 0,
        length: u32::from_le_bytes([header[4], header[5], header[6], header[7]]),
    })
}

/// Check whether a binary message looks like a frame header.
pub fn is_frame_header(bytes: &[u8]) -> bool {
    bytes.len() == HEADER_LEN && bytes[0] == FRAME_MARKER
}

/// 128-bit Miniserver device identifier.
///
/// The Miniserver writes these as `8-4-4-16` hex strings in the structure
/// file and as mixed-endian 16-byte values in event tables. Both forms
/// resolve to the same canonical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(Uuid);

impl DeviceId {
    /// Decode the 16-byte wire form (first three fields little-endian).
    pub fn from_wire(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw: [u8; 16] = bytes.try_into().map_err(|_| CodecError::InvalidLength {
            expected: 16,
            actual: bytes.len(),
        })?;
        Ok(Self(Uuid::from_bytes_le(raw)))
    }

    /// Encode back into the 16-byte wire form.
    pub fn to_wire(self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for DeviceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for DeviceId {
    type Err = CodecError;

    /// Parse any punctuation of the identifier by keeping only hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean: String = s.chars().filter(char::is_ascii_hexdigit).collect();
        if clean.len() != 32 {
            return Err(CodecError::InvalidFormat(s.to_string()));
        }
        Uuid::parse_str(&clean)
            .map(Self)
            .map_err(|_| CodecError::InvalidFormat(s.to_string()))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Value carried by a state change.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Value(f64),
    Text(String),
}

/// A single state change pushed by the Miniserver.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: DeviceId,
    pub value: EventValue,
}

/// Decode a value-state table.
///
/// Consumes 24-byte records until fewer than 24 bytes remain; a short tail
/// is dropped.
pub fn decode_value_events(bytes: &[u8]) -> Vec<Event> {
    bytes
        .chunks_exact(VALUE_EVENT_LEN)
        .filter_map(|record| {
            let (id, value) = record.split_at(16);
            let id = DeviceId::from_wire(id).ok()?;
            let value = f64::from_le_bytes(value.try_into().ok()?);
            Some(Event {
                id,
                value: EventValue::Value(value),
            })
        })
        .collect()
}

/// Decode a text-state table.
///
/// Each record is `uuid(16) + icon uuid(16) + len(4 LE) + text + padding`
/// where padding aligns the text to 4 bytes. Decoding stops at the first
/// record that does not fit in the remaining bytes.
pub fn decode_text_events(bytes: &[u8]) -> Vec<Event> {
    let mut events = Vec::new();
    let mut rest = bytes;

    while rest.len() >= TEXT_EVENT_FIXED_LEN {
        let Ok(id) = DeviceId::from_wire(&rest[..16]) else {
            break;
        };
        // Icon UUID at 16..32 is not bridged.
        let text_len = u32::from_le_bytes([rest[32], rest[33], rest[34], rest[35]]) as usize;
        rest = &rest[TEXT_EVENT_FIXED_LEN..];

        if rest.len() < text_len {
            break;
        }
        let text = String::from_utf8_lossy(&rest[..text_len]).into_owned();
        rest = &rest[text_len..];

        let padding = (4 - text_len % 4) % 4;
        rest = &rest[padding.min(rest.len())..];

        events.push(Event {
            id,
            value: EventValue::Text(text),
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIRE_ID: [u8; 16] = [
        0xA0, 0x94, 0x4F, 0x50, 0x34, 0x12, 0x78, 0x56, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07,
        0x08,
    ];

    fn value_record(id: [u8; 16], value: f64) -> Vec<u8> {
        let mut buf = id.to_vec();
        buf.extend_from_slice(&value.to_le_bytes());
        buf
    }

    fn text_record(id: [u8; 16], text: &str) -> Vec<u8> {
        let mut buf = id.to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&(text.len() as u32).to_le_bytes());
        buf.extend_from_slice(text.as_bytes());
        buf.resize(buf.len() + (4 - text.len() % 4) % 4, 0);
        buf
    }

    #[test]
    fn test_decode_frame_header() {
        let header = decode_frame_header(&[0x03, 0x02, 0x00, 0x00, 0x30, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(header.kind, FrameKind::ValueEvents);
        assert_eq!(header.length, 48);
        assert!(!header.estimated);
    }

    #[test]
    fn test_decode_frame_header_estimated_flag() {
        let header = decode_frame_header(&[0x03, 0x01, 0x80, 0x00, 0x00, 0x10, 0x00, 0x00]).unwrap();
        assert_eq!(header.kind, FrameKind::BinaryFile);
        assert_eq!(header.length, 0x1000);
        assert!(header.estimated);
    }

    #[test]
    fn test_decode_frame_header_rejects_bad_marker() {
        let result = decode_frame_header(&[0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(result, Err(CodecError::MalformedFrame(0x04)));
    }

    #[test]
    fn test_decode_frame_header_rejects_short_input() {
        let result = decode_frame_header(&[0x03, 0x00]);
        assert!(matches!(result, Err(CodecError::InvalidLength { actual: 2, .. })));
    }

    #[test]
    fn test_keepalive_has_no_payload() {
        let header = decode_frame_header(&[0x03, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(header.kind, FrameKind::Keepalive);
        assert!(!header.kind.has_payload());
        assert!(FrameKind::TextEvents.has_payload());
        assert_eq!(FrameKind::from(9), FrameKind::Unknown(9));
    }

    #[test]
    fn test_device_id_from_wire() {
        let id = DeviceId::from_wire(&WIRE_ID).unwrap();
        assert_eq!(id.to_string(), "504f94a0-1234-5678-0102-030405060708");
    }

    #[test]
    fn test_device_id_wire_round_trip() {
        let samples: [[u8; 16]; 3] = [WIRE_ID, [0u8; 16], [0xFF; 16]];
        for bytes in samples {
            assert_eq!(DeviceId::from_wire(&bytes).unwrap().to_wire(), bytes);
        }
    }

    #[test]
    fn test_device_id_from_wire_invalid_length() {
        assert_eq!(
            DeviceId::from_wire(&[0x00]),
            Err(CodecError::InvalidLength {
                expected: 16,
                actual: 1
            })
        );
    }

    #[test]
    fn test_parse_device_id_ignores_punctuation_and_case() {
        let loxone: DeviceId = "10000000-0000-0000-0000000000000001".parse().unwrap();
        let canonical: DeviceId = "10000000-0000-0000-0000-000000000001".parse().unwrap();
        let upper: DeviceId = "0F8A7F5C-0301-10FC-FFFF403FB0C34B9E".parse().unwrap();
        let lower: DeviceId = "0f8a7f5c030110fcffff403fb0c34b9e".parse().unwrap();

        assert_eq!(loxone, canonical);
        assert_eq!(upper, lower);
        assert_eq!(canonical.to_string(), "10000000-0000-0000-0000-000000000001");
    }

    #[test]
    fn test_parse_device_id_matches_wire_form() {
        let from_text: DeviceId = "504f94a0-1234-5678-0102030405060708".parse().unwrap();
        assert_eq!(from_text, DeviceId::from_wire(&WIRE_ID).unwrap());
    }

    #[test]
    fn test_parse_device_id_rejects_wrong_digit_count() {
        assert!(matches!(
            "some-other-uuid".parse::<DeviceId>(),
            Err(CodecError::InvalidFormat(_))
        ));
        assert!("10000000-0000-0000-000000000000001".parse::<DeviceId>().is_err());
        assert!("".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_decode_value_events_single_record() {
        let events = decode_value_events(&value_record(WIRE_ID, 123.456));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.to_string(), "504f94a0-1234-5678-0102-030405060708");
        assert_eq!(events[0].value, EventValue::Value(123.456));
    }

    #[test]
    fn test_decode_value_events_short_buffer() {
        let mut buf = value_record(WIRE_ID, 1.0);
        buf.pop();
        assert!(decode_value_events(&buf).is_empty());
    }

    #[test]
    fn test_decode_value_events_preserves_order_and_drops_tail() {
        let mut buf = value_record(WIRE_ID, 1.0);
        buf.extend(value_record([0x11; 16], 2.0));
        buf.extend_from_slice(&[0xAA; 5]);

        let events = decode_value_events(&buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].value, EventValue::Value(1.0));
        assert_eq!(events[1].value, EventValue::Value(2.0));
        assert_eq!(events[1].id.to_wire(), [0x11; 16]);
    }

    #[test]
    fn test_decode_text_event_with_padding() {
        let mut id = [0u8; 16];
        id[0] = 0xFF;
        let buf = text_record(id, "Hello World");
        assert_eq!(buf.len(), 36 + 11 + 1);

        let events = decode_text_events(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, DeviceId::from_wire(&id).unwrap());
        assert_eq!(events[0].value, EventValue::Text("Hello World".to_string()));
    }

    #[test]
    fn test_decode_text_events_multiple_records() {
        let mut buf = text_record(WIRE_ID, "abc");
        buf.extend(text_record([0x22; 16], "aligned!"));
        buf.extend(text_record([0x33; 16], ""));

        let texts: Vec<_> = decode_text_events(&buf)
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(
            texts,
            vec![
                EventValue::Text("abc".to_string()),
                EventValue::Text("aligned!".to_string()),
                EventValue::Text(String::new()),
            ]
        );
    }

    #[test]
    fn test_decode_text_events_stops_on_truncated_text() {
        let mut buf = text_record(WIRE_ID, "first");
        let mut truncated = text_record([0x44; 16], "this is cut off");
        truncated.truncate(40);
        buf.extend(truncated);

        let events = decode_text_events(&buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, EventValue::Text("first".to_string()));
    }

    #[test]
    fn test_decode_text_events_below_fixed_length() {
        assert!(decode_text_events(&[0u8; 35]).is_empty());
    }
}
