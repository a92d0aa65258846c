use crate::config::DynamicStreamConfig;
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

const MIN_FRAME_LEN: usize = 5;

struct UnacknowledgedPacket {
    framed: Vec<u8>,
    /// refreshed when the packet is re-sent due to a resend request, so the next measurement
    ///  against it stays meaningful
    sent_at: Instant,
}

struct DynamicStreamModuleInner {
    binding: Option<ModuleBinding>,

    send_index: MessageIndex,
    ack_index: MessageIndex,
    unacknowledged: BTreeMap<MessageIndex, UnacknowledgedPacket>,
    last_sent_time: Option<Instant>,

    /// smallest acknowledgement latency observed in the most recent cumulative
    ///  acknowledgement; the retransmission timeout is derived from it
    measured_timeout: Option<Duration>,

    receiver: StreamReceiver,
}

/// The sliding-window stream of [crate::stream::StreamModule] with a retransmission timeout
///  that adapts to the observed acknowledgement latency.
///
/// A cumulative acknowledgement covers a range of packets; the smallest per-packet sample in
///  that range is taken as the new timeout base - under batched acknowledgements the smallest
///  sample is the one closest to the true round trip, and it avoids inflation from packets
///  that spent time queued behind their older siblings. Samples are measured against the
///  original send time even when other indexes were retransmitted in between, which
///  overestimates under loss; that is accepted as a coarse but stable estimator.
pub struct DynamicStreamModule {
    config: Arc<DynamicStreamConfig>,
    inner: Arc<RwLock<DynamicStreamModuleInner>>,
    timer_handle: Option<JoinHandle<()>>,
}

impl Drop for DynamicStreamModule {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }
    }
}

impl DynamicStreamModule {
    pub fn new(config: Arc<DynamicStreamConfig>) -> DynamicStreamModule {
        let inner = DynamicStreamModuleInner {
            binding: None,
            send_index: MessageIndex::ZERO,
            ack_index: MessageIndex::ZERO,
            unacknowledged: BTreeMap::default(),
            last_sent_time: None,
            measured_timeout: None,
            receiver: StreamReceiver::new(config.receive_buffer_size),
        };

        DynamicStreamModule {
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

    /// the current timeout base, if any acknowledgement has been measured yet
    pub async fn measured_timeout(&self) -> Option<Duration> {
        self.inner.read().await.measured_timeout
    }

    async fn do_loop(config: Arc<DynamicStreamConfig>, inner: Arc<RwLock<DynamicStreamModuleInner>>) {
        let mut tick = interval(TICK_INTERVAL);
        loop {
            tick.tick().await;

            let emission = {
                let mut inner = inner.write().await;
                let now = Instant::now();

                let due = match inner.last_sent_time {
                    Some(last_sent) => {
                        let elapsed = now.duration_since(last_sent);
                        let adaptive_due = match inner.measured_timeout {
                            Some(measured) => {
                                let timeout = measured.mul_f64(config.timeout_multiplier);
                                timeout >= config.min_timeout && elapsed >= timeout
                            }
                            None => false,
                        };
                        elapsed >= config.max_timeout || adaptive_due
                    }
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
        let mut smallest_sample: Option<Duration> = None;
        while let Some((&key, _)) = inner.unacknowledged.first_key_value() {
            if key > index {
                break;
            }
            if let Some(packet) = inner.unacknowledged.remove(&key) {
                let sample = now.duration_since(packet.sent_at);
                smallest_sample = Some(match smallest_sample {
                    Some(smallest) => smallest.min(sample),
                    None => sample,
                });
            }
        }
        inner.ack_index = index.next();

        if let Some(sample) = smallest_sample {
            trace!("acknowledgement up to #{} - new timeout base {:?}", index, sample);
            inner.measured_timeout = Some(sample);
        }
    }

    async fn on_resend_request(&self, indexes: Vec<MessageIndex>) {
        let (binding, frames) = {
            let mut inner = self.inner.write().await;
            let now = Instant::now();
            let mut frames = Vec::new();
            for index in indexes {
                if index < inner.ack_index {
                    continue;
                }
                match inner.unacknowledged.get_mut(&index) {
                    Some(packet) => {
                        packet.sent_at = now;
                        frames.push(packet.framed.clone());
                    }
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
impl Module for DynamicStreamModule {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::pipeline::Pipeline;
    use crate::transport_sink::MockTransportSink;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::time;

    async fn single_module_pipeline(
        config: DynamicStreamConfig,
        dispatcher: MockMessageDispatcher,
        sink: MockTransportSink,
    ) -> (Pipeline, Arc<DynamicStreamModule>) {
        let mut module = DynamicStreamModule::new(Arc::new(config));
        module.spawn_retransmit_loop();
        let module = Arc::new(module);

        let pipeline = Pipeline::new(Some(Arc::new(dispatcher)), Some(Arc::new(sink)));
        pipeline.set_modules(vec![module.clone() as Arc<dyn Module>]).await;
        (pipeline, module)
    }

    fn message_frame(index: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        StreamFrame::Message { index: MessageIndex::from_raw(index), payload }.ser(&mut buf);
        buf
    }

    fn ack_frame(index: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        StreamFrame::Acknowledgement { index: MessageIndex::from_raw(index) }.ser(&mut buf);
        buf
    }

    fn resend_frame(indexes: Vec<u32>) -> Vec<u8> {
        let mut buf = Vec::new();
        StreamFrame::Resend { indexes: indexes.into_iter().map(MessageIndex::from_raw).collect() }.ser(&mut buf);
        buf
    }

    #[rstest]
    fn test_smallest_sample_in_cumulative_acknowledgement_wins() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            sink.expect_send_frame().times(2).return_const(());

            let (pipeline, module) =
                single_module_pipeline(DynamicStreamConfig::default(), MockMessageDispatcher::new(), sink).await;

            // #0 has been in flight for 30ms when the acknowledgement arrives, #1 for 10ms -
            //  the smaller sample becomes the timeout base
            pipeline.build(b"A").await;
            time::sleep(Duration::from_millis(20)).await;
            pipeline.build(b"B").await;
            time::sleep(Duration::from_millis(10)).await;

            pipeline.read(&ack_frame(1)).await;

            assert_eq!(module.outstanding().await, 0);
            assert_eq!(module.measured_timeout().await, Some(Duration::from_millis(10)));
        });
    }

    #[rstest]
    fn test_no_retransmission_before_max_timeout_without_measurement() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            let expected = message_frame(0, b"A");
            sink.expect_send_frame()
                .once()
                .withf(move |frame| frame == expected.as_slice())
                .return_const(());

            let (pipeline, module) =
                single_module_pipeline(DynamicStreamConfig::default(), MockMessageDispatcher::new(), sink).await;

            pipeline.build(b"A").await;

            // just short of the 500ms ceiling - no measurement exists, so nothing fires
            time::sleep(Duration::from_millis(450)).await;
            assert_eq!(module.outstanding().await, 1);
        });
    }

    #[rstest]
    fn test_max_timeout_fires_without_measurement() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            let expected = message_frame(0, b"A");
            sink.expect_send_frame()
                .times(2)
                .withf(move |frame| frame == expected.as_slice())
                .return_const(());

            let (pipeline, _module) =
                single_module_pipeline(DynamicStreamConfig::default(), MockMessageDispatcher::new(), sink).await;

            pipeline.build(b"A").await;
            time::sleep(Duration::from_millis(550)).await;
        });
    }

    #[rstest]
    fn test_measured_timeout_drives_retransmission() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            let frame_a = message_frame(0, b"A");
            sink.expect_send_frame()
                .once()
                .withf(move |frame| frame == frame_a.as_slice())
                .return_const(());
            let frame_b = message_frame(1, b"B");
            sink.expect_send_frame()
                .times(2)
                .withf(move |frame| frame == frame_b.as_slice())
                .return_const(());

            let (pipeline, module) =
                single_module_pipeline(DynamicStreamConfig::default(), MockMessageDispatcher::new(), sink).await;

            // obtain a 25ms measurement
            pipeline.build(b"A").await;
            time::sleep(Duration::from_millis(25)).await;
            pipeline.read(&ack_frame(0)).await;
            assert_eq!(module.measured_timeout().await, Some(Duration::from_millis(25)));

            // effective timeout is 25ms * 2 = 50ms, far below the 500ms ceiling
            pipeline.build(b"B").await;
            time::sleep(Duration::from_millis(60)).await;
            assert_eq!(module.outstanding().await, 1);
        });
    }

    #[rstest]
    fn test_resend_refreshes_send_time() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            let frame_a = message_frame(0, b"A");
            sink.expect_send_frame()
                .times(2)
                .withf(move |frame| frame == frame_a.as_slice())
                .return_const(());
            let frame_b = message_frame(1, b"B");
            sink.expect_send_frame()
                .once()
                .withf(move |frame| frame == frame_b.as_slice())
                .return_const(());

            let (pipeline, module) =
                single_module_pipeline(DynamicStreamConfig::default(), MockMessageDispatcher::new(), sink).await;

            pipeline.build(b"A").await;
            pipeline.build(b"B").await;
            time::sleep(Duration::from_millis(40)).await;

            // the re-sent packet's clock restarts now: a measurement 10ms later reads 10ms,
            //  not the 50ms since the original transmission
            pipeline.read(&resend_frame(vec![0])).await;
            time::sleep(Duration::from_millis(10)).await;
            pipeline.read(&ack_frame(0)).await;

            assert_eq!(module.measured_timeout().await, Some(Duration::from_millis(10)));
        });
    }

    #[rstest]
    fn test_receiver_side_matches_fixed_stream_behavior() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            let mut seq = mockall::Sequence::new();
            for expected in [b"A", b"B", b"C"] {
                dispatcher.expect_on_message()
                    .once()
                    .in_sequence(&mut seq)
                    .withf(move |message| message == *expected)
                    .return_const(());
            }
            let mut sink = MockTransportSink::new();
            let mut sink_seq = mockall::Sequence::new();
            for expected in [ack_frame(0), resend_frame(vec![1]), ack_frame(2)] {
                sink.expect_send_frame()
                    .once()
                    .in_sequence(&mut sink_seq)
                    .withf(move |frame| frame == expected.as_slice())
                    .return_const(());
            }

            let (pipeline, _module) =
                single_module_pipeline(DynamicStreamConfig::default(), dispatcher, sink).await;

            pipeline.read(&message_frame(0, b"A")).await;
            pipeline.read(&message_frame(2, b"C")).await;
            pipeline.read(&message_frame(1, b"B")).await;
        });
    }
}
