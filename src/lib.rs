//! A modular packet-processing pipeline that turns a raw, unreliable, possibly lossy and
//!  reordering byte transport into a reliable and/or ordered byte-message channel.
//!
//! ## Design goals
//!
//! * A pipeline is an ordered stack of independent transformers ([pipeline::Module]s); each
//!   module sees whole byte messages, may emit zero, one or many messages toward its
//!   neighbors, and may maintain its own timers and retransmission state
//!   * peers run mirror-image stacks, so what the top of the stack accepts on one side
//!     appears verbatim at the top of the stack on the other side
//!   * modules are independent: each one frames / parses exactly its own header and treats
//!     everything above it as opaque payload
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes) - the underlying transport is expected to preserve
//!   message boundaries, e.g. one frame per datagram
//! * Control traffic (acknowledgements, resend requests, retransmissions) is emitted through
//!   the same downward path as regular data and therefore traverses all lower modules before
//!   leaving the process
//! * Reliability comes in two flavors with a fixed-timeout and an adaptive-timeout variant
//!   each:
//!   * [ack::AckModule] / [dynamic_ack::DynamicAckModule]: at-least-once delivery, keyed by
//!     a SHA-1 digest of the payload; duplicates are possible and are the upper layers'
//!     business
//!   * [stream::StreamModule] / [dynamic_stream::DynamicStreamModule]: exactly-once in-order
//!     delivery with a sliding receive window, cumulative acknowledgements and explicit
//!     resend requests
//! * No congestion control, no flow control beyond the fixed-size reorder window, no
//!   encryption, no fragmentation of oversized payloads - different trade-offs than TCP
//!
//! ## Wire formats
//!
//! All integers are little-endian; every frame starts with a one-byte method tag.
//!
//! Acknowledgement module:
//! ```ascii
//! 0x00 | payload                      Data
//! 0x01 | sha1(payload)                Acknowledge (20-byte digest)
//! ```
//!
//! DynamicAcknowledgement module:
//! ```ascii
//! 0x00 | payload                      Data
//! 0x01 | iteration:u8 | payload       Resend (retransmission attempt number)
//! 0x02 | iteration:u8 | sha1(payload) Acknowledge
//! ```
//!
//! Stream / DynamicStream modules:
//! ```ascii
//! 0x00 | index:u32 | payload          Message
//! 0x01 | index:u32                    Acknowledgement (cumulative: everything <= index)
//! 0x02 | (index:u32){k}               Resend (list of missing indexes, k >= 0)
//! ```

pub mod ack;
pub mod config;
pub mod dynamic_ack;
pub mod dynamic_stream;
pub mod frames;
pub mod message_dispatcher;
pub mod message_index;
pub mod payload_hash;
pub mod pipeline;
pub mod stream;
mod stream_receiver;
pub mod test_util;
pub mod transport_sink;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
