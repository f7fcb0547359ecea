//! Wire codec: concatenated JSON frames.
//!
//! A stream is a back-to-back concatenation of JSON-encoded [`StreamFrame`]
//! values with no delimiters; the decoder consumes one complete value at a
//! time and buffers any trailing partial value until the next push.
//!
//! # Example
//!
//! ```
//! use allocfs::protocol::{encode_frame, FrameDecoder, StreamFrame};
//!
//! let bytes = encode_frame(&StreamFrame::heartbeat()).unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! let frames = decoder.push(&bytes).unwrap();
//! assert_eq!(frames.len(), 1);
//! assert!(frames[0].is_heartbeat());
//! ```

use bytes::{Buf, BytesMut};

use super::frame::StreamFrame;
use crate::error::Result;

/// Encode one frame as a single JSON value, no delimiter.
pub fn encode_frame(frame: &StreamFrame) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(frame)?)
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Handles arbitrary fragmentation: a frame may arrive split across many
/// reads, or many frames may arrive in one read. Partial data is kept in a
/// single `BytesMut` buffer until the value completes.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns the decoded frames, which may be empty while a value is
    /// still incomplete.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered bytes are not valid frame JSON.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<StreamFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            let mut iter =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<StreamFrame>();
            match iter.next() {
                Some(Ok(frame)) => {
                    let consumed = iter.byte_offset();
                    self.buffer.advance(consumed);
                    frames.push(frame);
                }
                // A partial trailing value stays buffered for the next push.
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        Ok(frames)
    }

    /// Number of buffered bytes still waiting for completion.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data_frame(file: &str, data: &'static [u8], offset: i64) -> StreamFrame {
        StreamFrame::data(file, Bytes::from_static(data), offset)
    }

    #[test]
    fn test_single_complete_frame() {
        let frame = data_frame("task.log", b"hello", 10);
        let bytes = encode_frame(&frame).unwrap();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&bytes).unwrap();

        assert_eq!(frames, vec![frame]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut combined = Vec::new();
        combined.extend(encode_frame(&data_frame("a", b"first", 0)).unwrap());
        combined.extend(encode_frame(&StreamFrame::heartbeat()).unwrap());
        combined.extend(encode_frame(&data_frame("b", b"second", 5)).unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&combined).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].file, "a");
        assert!(frames[1].is_heartbeat());
        assert_eq!(frames[2].offset, 5);
    }

    #[test]
    fn test_fragmented_frame() {
        let bytes = encode_frame(&data_frame("task.log", b"fragmented", 0)).unwrap();
        let split = bytes.len() / 2;

        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&bytes[..split]).unwrap().is_empty());
        assert!(decoder.buffered() > 0);

        let frames = decoder.push(&bytes[split..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, Bytes::from_static(b"fragmented"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let bytes = encode_frame(&data_frame("f", b"hi", 1)).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut all = Vec::new();
        for byte in &bytes {
            all.extend(decoder.push(std::slice::from_ref(byte)).unwrap());
        }

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].offset, 1);
    }

    #[test]
    fn test_complete_plus_partial() {
        let first = encode_frame(&data_frame("a", b"one", 0)).unwrap();
        let second = encode_frame(&data_frame("b", b"two", 3)).unwrap();

        let mut push = first.clone();
        push.extend_from_slice(&second[..4]);

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&push).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].file, "a");

        let frames = decoder.push(&second[4..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].file, "b");
    }

    #[test]
    fn test_garbage_rejected() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"not json at all").is_err());
    }
}
