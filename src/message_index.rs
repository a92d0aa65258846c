use std::fmt::{Display, Formatter};

/// Sequence number of a message in a stream, `u32` little-endian on the wire.
///
/// NB: The counter is not expected to wrap in practice; behavior after 2^32 messages on a
///  single stream is undefined, and the arithmetic here wraps rather than panic.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageIndex(u32);

impl Display for MessageIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl MessageIndex {
    pub const ZERO: MessageIndex = MessageIndex(0);

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> MessageIndex {
        MessageIndex(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> MessageIndex {
        MessageIndex(self.0.wrapping_sub(1))
    }

    /// distance from `other` up to `self`, for window checks - callers ensure `other <= self`
    pub fn distance_from(&self, other: MessageIndex) -> u32 {
        self.0.wrapping_sub(other.0)
    }

    /// all indexes in `self ..< upper`
    pub fn to(&self, upper: MessageIndex) -> impl Iterator<Item = MessageIndex> {
        (self.0..upper.0).map(MessageIndex)
    }
}
