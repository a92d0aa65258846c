use crate::frames::StreamFrame;
use crate::message_index::MessageIndex;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Receive-side state machine shared by the stream modules: in-order delivery with a bounded
///  reorder buffer, cumulative acknowledgements and explicit resend requests for gaps.
///
/// This is pure bookkeeping - the caller owns the lock around it and performs the actual
///  upward / downward emissions described by the returned [ReceiveOutcome].
pub(crate) struct StreamReceiver {
    /// next sequence number expected in order
    receive_index: MessageIndex,
    /// out-of-order payloads whose in-order predecessors have not arrived yet; every key is in
    ///  `(receive_index, receive_index + receive_buffer_size]`
    receive_buffer: BTreeMap<MessageIndex, Vec<u8>>,
    receive_buffer_size: u32,
}

/// control frame to send back to the peer as a result of an inbound message
pub(crate) enum ReceiveResponse {
    /// cumulative: everything up to and including this index was delivered upward
    Acknowledge(MessageIndex),
    /// these indexes are missing; ask the peer to resend them
    RequestResend(Vec<MessageIndex>),
}

impl ReceiveResponse {
    pub fn to_frame_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ReceiveResponse::Acknowledge(index) => {
                StreamFrame::Acknowledgement { index: *index }.ser(&mut buf);
            }
            ReceiveResponse::RequestResend(indexes) => {
                StreamFrame::Resend { indexes: indexes.clone() }.ser(&mut buf);
            }
        }
        buf
    }
}

pub(crate) struct ReceiveOutcome {
    /// payloads to deliver upward, in order
    pub deliveries: Vec<Vec<u8>>,
    pub response: Option<ReceiveResponse>,
}

impl StreamReceiver {
    pub fn new(receive_buffer_size: u32) -> StreamReceiver {
        StreamReceiver {
            receive_index: MessageIndex::ZERO,
            receive_buffer: BTreeMap::default(),
            receive_buffer_size,
        }
    }

    pub fn on_message(&mut self, index: MessageIndex, payload: &[u8]) -> ReceiveOutcome {
        if index < self.receive_index {
            // the sender retransmitted something we already delivered, so our cumulative
            //  acknowledgement was lost or is still in flight - repeat it
            trace!("message #{} was already delivered - re-acknowledging", index);
            return ReceiveOutcome {
                deliveries: Vec::new(),
                response: Some(ReceiveResponse::Acknowledge(self.receive_index.prev())),
            };
        }

        if index.distance_from(self.receive_index) > self.receive_buffer_size {
            debug!("message #{} is beyond the receive window starting at #{} - dropping", index, self.receive_index);
            return ReceiveOutcome { deliveries: Vec::new(), response: None };
        }

        if index == self.receive_index {
            // in order: deliver, then drain buffered messages that became contiguous
            let mut deliveries = vec![payload.to_vec()];
            let mut last_delivered = index;
            while let Some(buffered) = self.receive_buffer.remove(&last_delivered.next()) {
                last_delivered = last_delivered.next();
                deliveries.push(buffered);
            }
            self.receive_index = last_delivered.next();

            return ReceiveOutcome {
                deliveries,
                response: Some(ReceiveResponse::Acknowledge(last_delivered)),
            };
        }

        // a gap: buffer the message and ask for everything still missing below it
        self.receive_buffer.insert(index, payload.to_vec());
        let missing = self
            .receive_index
            .to(index)
            .filter(|idx| !self.receive_buffer.contains_key(idx))
            .collect::<Vec<_>>();
        trace!("message #{} leaves a gap - requesting resend of {:?}", index, missing);

        ReceiveOutcome {
            deliveries: Vec::new(),
            response: Some(ReceiveResponse::RequestResend(missing)),
        }
    }

    pub fn buffered(&self) -> usize {
        self.receive_buffer.len()
    }
}
