//! Wire formats for the three frame families. Every frame starts with a one-byte method tag;
//!  all integers are little-endian. Framing is per message - the underlying transport is
//!  expected to preserve message boundaries, so no length prefixes are needed and a frame's
//!  payload simply extends to the end of the buffer.

use crate::message_index::MessageIndex;
use crate::payload_hash::PayloadHash;
use anyhow::anyhow;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum AckFrameKind {
    Data = 0,
    Acknowledge = 1,
}

/// Frames of the fixed-timeout acknowledgement module: either application data, or an
///  acknowledgement carrying the SHA-1 digest of the acknowledged payload.
#[derive(Debug, PartialEq, Eq)]
pub enum AckFrame<'a> {
    Data { payload: &'a [u8] },
    Acknowledge { hash: PayloadHash },
}

impl<'a> AckFrame<'a> {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            AckFrame::Data { payload } => {
                buf.put_u8(AckFrameKind::Data.into());
                buf.put_slice(payload);
            }
            AckFrame::Acknowledge { hash } => {
                buf.put_u8(AckFrameKind::Acknowledge.into());
                buf.put_slice(hash.as_bytes());
            }
        }
    }

    pub fn deser(mut buf: &'a [u8]) -> anyhow::Result<AckFrame<'a>> {
        let tag = buf.try_get_u8()?;
        let kind = AckFrameKind::try_from(tag)
            .map_err(|_| anyhow!("unknown acknowledgement frame tag {}", tag))?;

        match kind {
            AckFrameKind::Data => Ok(AckFrame::Data { payload: buf }),
            AckFrameKind::Acknowledge => Ok(AckFrame::Acknowledge { hash: get_hash(&mut buf)? }),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum DynamicAckFrameKind {
    Data = 0,
    Resend = 1,
    Acknowledge = 2,
}

/// Frames of the adaptive-timeout acknowledgement module. Retransmissions are framed as
///  [DynamicAckFrame::Resend] with an iteration counter (0 = original transmission), and
///  acknowledgements echo that counter so the sender can attribute a round-trip measurement
///  to the exact transmission attempt that triggered it.
#[derive(Debug, PartialEq, Eq)]
pub enum DynamicAckFrame<'a> {
    Data { payload: &'a [u8] },
    Resend { iteration: u8, payload: &'a [u8] },
    Acknowledge { iteration: u8, hash: PayloadHash },
}

impl<'a> DynamicAckFrame<'a> {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            DynamicAckFrame::Data { payload } => {
                buf.put_u8(DynamicAckFrameKind::Data.into());
                buf.put_slice(payload);
            }
            DynamicAckFrame::Resend { iteration, payload } => {
                buf.put_u8(DynamicAckFrameKind::Resend.into());
                buf.put_u8(*iteration);
                buf.put_slice(payload);
            }
            DynamicAckFrame::Acknowledge { iteration, hash } => {
                buf.put_u8(DynamicAckFrameKind::Acknowledge.into());
                buf.put_u8(*iteration);
                buf.put_slice(hash.as_bytes());
            }
        }
    }

    pub fn deser(mut buf: &'a [u8]) -> anyhow::Result<DynamicAckFrame<'a>> {
        let tag = buf.try_get_u8()?;
        let kind = DynamicAckFrameKind::try_from(tag)
            .map_err(|_| anyhow!("unknown acknowledgement frame tag {}", tag))?;

        match kind {
            DynamicAckFrameKind::Data => Ok(DynamicAckFrame::Data { payload: buf }),
            DynamicAckFrameKind::Resend => Ok(DynamicAckFrame::Resend {
                iteration: buf.try_get_u8()?,
                payload: buf,
            }),
            DynamicAckFrameKind::Acknowledge => Ok(DynamicAckFrame::Acknowledge {
                iteration: buf.try_get_u8()?,
                hash: get_hash(&mut buf)?,
            }),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum StreamFrameKind {
    Message = 0,
    Acknowledgement = 1,
    Resend = 2,
}

/// Frames of the sliding-window stream modules (fixed and adaptive timeout share this format).
///
/// [StreamFrame::Acknowledgement] is cumulative: it means "every sequence number up to and
///  including `index` was delivered upward". [StreamFrame::Resend] is the negative counterpart,
///  an explicit list of missing indexes; the list length is implied by the frame length.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamFrame<'a> {
    Message { index: MessageIndex, payload: &'a [u8] },
    Acknowledgement { index: MessageIndex },
    Resend { indexes: Vec<MessageIndex> },
}

impl<'a> StreamFrame<'a> {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            StreamFrame::Message { index, payload } => {
                buf.put_u8(StreamFrameKind::Message.into());
                buf.put_u32_le(index.to_raw());
                buf.put_slice(payload);
            }
            StreamFrame::Acknowledgement { index } => {
                buf.put_u8(StreamFrameKind::Acknowledgement.into());
                buf.put_u32_le(index.to_raw());
            }
            StreamFrame::Resend { indexes } => {
                buf.put_u8(StreamFrameKind::Resend.into());
                for index in indexes {
                    buf.put_u32_le(index.to_raw());
                }
            }
        }
    }

    pub fn deser(mut buf: &'a [u8]) -> anyhow::Result<StreamFrame<'a>> {
        let tag = buf.try_get_u8()?;
        let kind = StreamFrameKind::try_from(tag)
            .map_err(|_| anyhow!("unknown stream frame tag {}", tag))?;

        match kind {
            StreamFrameKind::Message => Ok(StreamFrame::Message {
                index: MessageIndex::from_raw(buf.try_get_u32_le()?),
                payload: buf,
            }),
            StreamFrameKind::Acknowledgement => Ok(StreamFrame::Acknowledgement {
                index: MessageIndex::from_raw(buf.try_get_u32_le()?),
            }),
            StreamFrameKind::Resend => {
                let mut indexes = Vec::with_capacity(buf.remaining() / size_of::<u32>());
                while buf.remaining() >= size_of::<u32>() {
                    indexes.push(MessageIndex::from_raw(buf.get_u32_le()));
                }
                Ok(StreamFrame::Resend { indexes })
            }
        }
    }
}

fn get_hash(buf: &mut &[u8]) -> anyhow::Result<PayloadHash> {
    if buf.remaining() < PayloadHash::SERIALIZED_LEN {
        return Err(anyhow!("truncated payload hash in acknowledgement frame"));
    }
    let mut bytes = [0u8; PayloadHash::SERIALIZED_LEN];
    buf.copy_to_slice(&mut bytes);
    Ok(PayloadHash::from_bytes(bytes))
}
