use crate::config::StreamConfig;
use crate::frames::StreamFrame;
use crate::message_index::MessageIndex;
use crate::pipeline::{Module, ModuleBinding};
use crate::stream_receiver::StreamReceiver;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// the smallest well-formed frame: method tag plus a sequence number
const MIN_FRAME_LEN: usize = 5;

struct UnacknowledgedPacket {
    framed: Vec<u8>,
    sent_at: Instant,
}

struct StreamModuleInner {
    binding: Option<ModuleBinding>,

    /// next sequence number to assign on outbound messages
    send_index: MessageIndex,
    /// smallest sequence number not yet covered by a cumulative acknowledgement; every key in
    ///  `unacknowledged` is in `[ack_index, send_index)`
    ack_index: MessageIndex,
    unacknowledged: BTreeMap<MessageIndex, UnacknowledgedPacket>,
    last_sent_time: Option<Instant>,

    receiver: StreamReceiver,
}

/// Sequence-numbered sliding-window reliable ordered stream with a fixed retransmission
///  timeout.
///
/// Outbound messages are numbered and retained until covered by a cumulative acknowledgement.
///  Only the most recent packet is timer-driven: a gap in front of it surfaces on the receiver
///  side as an explicit resend request, which retransmits exactly the missing indexes. The
///  receive side delivers strictly in order, buffering out-of-order messages up to the
///  configured window and dropping anything beyond it.
pub struct StreamModule {
    config: Arc<StreamConfig>,
    inner: Arc<RwLock<StreamModuleInner>>,
    timer_handle: Option<JoinHandle<()>>,
}

impl Drop for StreamModule {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }
    }
}

impl StreamModule {
    pub fn new(config: Arc<StreamConfig>) -> StreamModule {
        let inner = StreamModuleInner {
            binding: None,
            send_index: MessageIndex::ZERO,
            ack_index: MessageIndex::ZERO,
            unacknowledged: BTreeMap::default(),
            last_sent_time: None,
            receiver: StreamReceiver::new(config.receive_buffer_size),
        };

        StreamModule {
            config,
            inner: Arc::new(RwLock::new(inner)),
            timer_handle: None,
        }
    }

    pub fn spawn_retransmit_loop(&mut self) {
        if self.timer_handle.is_some() {
            warn!("retransmit loop already spawned");
            return;
        }
        self.timer_handle = Some(tokio::spawn(Self::do_loop(self.config.clone(), self.inner.clone())));
    }

    /// number of packets sent but not yet covered by a cumulative acknowledgement
    pub async fn outstanding(&self) -> usize {
        self.inner.read().await.unacknowledged.len()
    }

    async fn do_loop(config: Arc<StreamConfig>, inner: Arc<RwLock<StreamModuleInner>>) {
        let mut tick = interval(TICK_INTERVAL);
        loop {
            tick.tick().await;

            // only the newest packet is retransmitted on timeout - anything older either left
            //  a gap the receiver will complain about, or was acknowledged cumulatively
            let emission = {
                let mut inner = inner.write().await;
                let now = Instant::now();
                let due = match inner.last_sent_time {
                    Some(last_sent) => now.duration_since(last_sent) >= config.retransmit_timeout,
                    None => false,
                };

                if due {
                    let newest = inner.send_index.prev();
                    if let Some(packet) = inner.unacknowledged.get(&newest) {
                        let framed = packet.framed.clone();
                        inner.last_sent_time = Some(now);
                        inner.binding.clone().map(|binding| (binding, framed))
                    } else {
                        None
                    }
                } else {
                    None
                }
            };

            if let Some((binding, framed)) = emission {
                trace!("retransmitting newest unacknowledged packet of {} bytes", framed.len());
                binding.continue_build(&framed).await;
            }
        }
    }

    async fn on_message_frame(&self, index: MessageIndex, payload: &[u8]) {
        let (binding, outcome) = {
            let mut inner = self.inner.write().await;
            let outcome = inner.receiver.on_message(index, payload);
            (inner.binding.clone(), outcome)
        };

        if let Some(binding) = binding {
            for delivery in &outcome.deliveries {
                binding.continue_read(delivery).await;
            }
            if let Some(response) = outcome.response {
                binding.continue_build(&response.to_frame_bytes()).await;
            }
        }
    }

    async fn on_acknowledgement(&self, index: MessageIndex) {
        let mut inner = self.inner.write().await;
        if index < inner.ack_index {
            trace!("stale acknowledgement for #{} - ignoring", index);
            return;
        }

        let now = Instant::now();
        while let Some((&key, _)) = inner.unacknowledged.first_key_value() {
            if key > index {
                break;
            }
            if let Some(packet) = inner.unacknowledged.remove(&key) {
                trace!("#{} acknowledged after {:?} in flight", key, now.duration_since(packet.sent_at));
            }
        }
        inner.ack_index = index.next();
    }

    async fn on_resend_request(&self, indexes: Vec<MessageIndex>) {
        let (binding, frames) = {
            let inner = self.inner.read().await;
            let mut frames = Vec::new();
            for index in indexes {
                if index < inner.ack_index {
                    continue;
                }
                match inner.unacknowledged.get(&index) {
                    Some(packet) => frames.push(packet.framed.clone()),
                    None => debug!("resend requested for #{} which is not held - ignoring", index),
                }
            }
            (inner.binding.clone(), frames)
        };

        if let Some(binding) = binding {
            for framed in frames {
                binding.continue_build(&framed).await;
            }
        }
    }
}

#[async_trait]
impl Module for StreamModule {
    async fn bind(&self, binding: ModuleBinding) {
        self.inner.write().await.binding = Some(binding);
    }

    async fn read(&self, frame: &[u8]) {
        if frame.len() < MIN_FRAME_LEN {
            trace!("ignoring frame of {} bytes", frame.len());
            return;
        }
        let parsed = match StreamFrame::deser(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("malformed frame - dropping: {}", e);
                return;
            }
        };

        match parsed {
            StreamFrame::Message { index, payload } => self.on_message_frame(index, payload).await,
            StreamFrame::Acknowledgement { index } => self.on_acknowledgement(index).await,
            StreamFrame::Resend { indexes } => self.on_resend_request(indexes).await,
        }
    }

    async fn build(&self, message: &[u8]) {
        let (binding, framed) = {
            let mut inner = self.inner.write().await;
            let index = inner.send_index;

            let mut framed = Vec::with_capacity(MIN_FRAME_LEN + message.len());
            StreamFrame::Message { index, payload: message }.ser(&mut framed);

            let now = Instant::now();
            inner.unacknowledged.insert(index, UnacknowledgedPacket { framed: framed.clone(), sent_at: now });
            inner.last_sent_time = Some(now);
            inner.send_index = index.next();

            trace!("sending message #{} of {} bytes", index, message.len());
            (inner.binding.clone(), framed)
        };

        if let Some(binding) = binding {
            binding.continue_build(&framed).await;
        }
    }
}
