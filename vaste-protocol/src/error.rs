//! Protocol error type.

use thiserror::Error;

/// An error raised while decoding or routing wire traffic.
///
/// The frame-shaped variants all describe a malformed binary frame; the
/// decoder surfaces the first violation it encounters and the caller
/// drops the frame.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The leading frame tag byte is not a known frame type.
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    /// The buffer ended before the advertised content.
    #[error("frame truncated while reading {0}")]
    Truncated(&'static str),
    /// The entry table would read past the end of the frame.
    #[error("entry count {count} exceeds remaining payload")]
    EntryOverrun {
        /// The advertised entry count.
        count: u16,
    },
    /// A sparse entry's local index does not fit a 16^3 chunk.
    #[error("local index {0} out of range")]
    IndexOutOfRange(u16),
    /// An inner frame length field points past the envelope.
    #[error("inner frame length {len} exceeds envelope bound")]
    InnerLengthOutOfBounds {
        /// The advertised inner length.
        len: u32,
    },
    /// A JSON message had an unknown `type` or did not match its schema.
    #[error("malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),
    /// A chunk ack key did not parse as `cx,cy,cz:version:seq`.
    #[error("malformed chunk ack key {0:?}")]
    MalformedAckKey(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(_: std::io::Error) -> Self {
        Self::Truncated("buffer")
    }
}
