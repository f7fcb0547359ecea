//! Stream frame: the wire unit of the file stream protocol.
//!
//! A frame carries a byte range read out of a followed file, an event
//! notification about that file, or nothing at all (a heartbeat). Payloads
//! use `bytes::Bytes` for cheap sharing between the framer and its sink.
//!
//! # Example
//!
//! ```
//! use allocfs::protocol::StreamFrame;
//! use bytes::Bytes;
//!
//! let frame = StreamFrame::data("task.log", Bytes::from_static(b"hello"), 0);
//! assert!(!frame.is_heartbeat());
//! assert_eq!(frame.len(), 5);
//!
//! assert!(StreamFrame::heartbeat().is_heartbeat());
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Event emitted when the followed file shrinks or is replaced.
pub const TRUNCATE_EVENT: &str = "file truncated";

/// Event emitted when the followed file disappears from the path.
pub const DELETE_EVENT: &str = "file deleted";

/// One wire unit of the stream protocol.
///
/// All four fields are omitted from the JSON encoding when at their zero
/// values, so a heartbeat serializes as `{}`. `data` travels as base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StreamFrame {
    /// Byte position in the source file immediately before `data` was read.
    /// For event-only frames, the offset at which the event was observed.
    #[serde(skip_serializing_if = "offset_is_zero")]
    pub offset: i64,

    /// Raw bytes read from the file; empty for event-only and heartbeat
    /// frames.
    #[serde(with = "base64_bytes", skip_serializing_if = "Bytes::is_empty")]
    pub data: Bytes,

    /// Logical file name, relative to the allocation root.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub file: String,

    /// Event tag: empty, [`TRUNCATE_EVENT`], or [`DELETE_EVENT`].
    #[serde(skip_serializing_if = "String::is_empty")]
    pub event: String,
}

fn offset_is_zero(offset: &i64) -> bool {
    *offset == 0
}

impl StreamFrame {
    /// Create a data frame for `file` starting at `offset`.
    pub fn data(file: &str, data: Bytes, offset: i64) -> Self {
        Self {
            offset,
            data,
            file: file.to_string(),
            event: String::new(),
        }
    }

    /// Create an event-only frame observed at `offset`.
    pub fn event(file: &str, event: &str, offset: i64) -> Self {
        Self {
            offset,
            data: Bytes::new(),
            file: file.to_string(),
            event: event.to_string(),
        }
    }

    /// Create a heartbeat frame (all fields at their zero values).
    pub fn heartbeat() -> Self {
        Self::default()
    }

    /// A frame is a heartbeat iff every field is at its zero value.
    /// Heartbeats must be discarded by any data-consuming reader.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.data.is_empty() && self.file.is_empty() && self.event.is_empty() && self.offset == 0
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame carries no data bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Serde adapter encoding the data field as standard base64.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_all_zero() {
        assert!(StreamFrame::heartbeat().is_heartbeat());
        assert!(StreamFrame::default().is_heartbeat());
    }

    #[test]
    fn test_non_heartbeat_variants() {
        let data = StreamFrame::data("f", Bytes::from_static(b"x"), 0);
        assert!(!data.is_heartbeat());

        let event = StreamFrame::event("f", TRUNCATE_EVENT, 0);
        assert!(!event.is_heartbeat());

        let offset_only = StreamFrame {
            offset: 7,
            ..Default::default()
        };
        assert!(!offset_only.is_heartbeat());

        let file_only = StreamFrame {
            file: "f".to_string(),
            ..Default::default()
        };
        assert!(!file_only.is_heartbeat());
    }

    #[test]
    fn test_heartbeat_serializes_empty() {
        let encoded = serde_json::to_string(&StreamFrame::heartbeat()).unwrap();
        assert_eq!(encoded, "{}");
    }

    #[test]
    fn test_zero_fields_omitted() {
        let frame = StreamFrame::data("task.log", Bytes::from_static(b"hi"), 0);
        let encoded = serde_json::to_string(&frame).unwrap();

        // Offset 0 and the empty event are omitted.
        assert!(!encoded.contains("Offset"));
        assert!(!encoded.contains("Event"));
        assert!(encoded.contains("File"));
        assert!(encoded.contains("Data"));
    }

    #[test]
    fn test_data_is_base64() {
        let frame = StreamFrame::data("f", Bytes::from_static(b"hello"), 10);
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("aGVsbG8="));
    }

    #[test]
    fn test_roundtrip() {
        let frame = StreamFrame::data("task.log", Bytes::from_static(b"hello"), 42);
        let encoded = serde_json::to_vec(&frame).unwrap();
        let decoded: StreamFrame = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_event_frame_roundtrip() {
        let frame = StreamFrame::event("task.log", DELETE_EVENT, 3);
        let decoded: StreamFrame =
            serde_json::from_slice(&serde_json::to_vec(&frame).unwrap()).unwrap();
        assert_eq!(decoded.event, DELETE_EVENT);
        assert_eq!(decoded.offset, 3);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_heartbeat_decodes_from_empty_object() {
        let decoded: StreamFrame = serde_json::from_str("{}").unwrap();
        assert!(decoded.is_heartbeat());
    }
}
