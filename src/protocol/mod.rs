//! Protocol module: the stream frame and its wire codec.
//!
//! The wire format is a concatenation of JSON-encoded frames, back-to-back
//! with no delimiters. All frame fields are omitted when at their zero
//! values, so a heartbeat serializes as `{}`.

mod codec;
mod frame;

pub use codec::{encode_frame, FrameDecoder};
pub use frame::{StreamFrame, DELETE_EVENT, TRUNCATE_EVENT};
