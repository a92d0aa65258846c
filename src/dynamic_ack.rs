use crate::config::DynamicAckConfig;
use crate::frames::DynamicAckFrame;
use crate::payload_hash::PayloadHash;
use crate::pipeline::{Module, ModuleBinding};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::cmp::max;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(10);

struct PendingMessage {
    /// the original user payload - retransmissions are re-framed with a fresh iteration counter
    payload: Vec<u8>,
    /// 0 = original transmission, incremented for every retransmission. The counter wraps at
    ///  256 attempts; behavior beyond that point is undefined.
    iteration: u8,
    /// send timestamp per iteration, indexed by the iteration counter
    send_times: Vec<Instant>,
}

struct DynamicAckModuleInner {
    binding: Option<ModuleBinding>,
    pending: FxHashMap<PayloadHash, PendingMessage>,
    /// most recent round-trip measurement; the retransmission timeout is derived from it
    measured_timeout: Option<Duration>,
}

/// Hash-acknowledged retransmission with a timeout that adapts to the measured round trip.
///
/// Retransmissions carry an iteration counter, and acknowledgements echo it, so a measurement
///  is always attributed to the exact transmission attempt that triggered the acknowledgement
///  rather than to the original send. Until the first measurement exists, only the hard
///  `max_timeout` ceiling triggers retransmission.
pub struct DynamicAckModule {
    config: Arc<DynamicAckConfig>,
    inner: Arc<RwLock<DynamicAckModuleInner>>,
    timer_handle: Option<JoinHandle<()>>,
}

impl Drop for DynamicAckModule {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }
    }
}

impl DynamicAckModule {
    pub fn new(config: Arc<DynamicAckConfig>) -> DynamicAckModule {
        DynamicAckModule {
            config,
            inner: Arc::new(RwLock::new(DynamicAckModuleInner {
                binding: None,
                pending: FxHashMap::default(),
                measured_timeout: None,
            })),
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

    /// number of messages sent but not yet acknowledged
    pub async fn outstanding(&self) -> usize {
        self.inner.read().await.pending.len()
    }

    /// the most recent round-trip measurement, if any acknowledgement arrived yet
    pub async fn measured_timeout(&self) -> Option<Duration> {
        self.inner.read().await.measured_timeout
    }

    async fn do_loop(config: Arc<DynamicAckConfig>, inner: Arc<RwLock<DynamicAckModuleInner>>) {
        let mut tick = interval(TICK_INTERVAL);
        loop {
            tick.tick().await;

            let (binding, due) = {
                let mut inner = inner.write().await;
                let now = Instant::now();
                let effective_timeout = inner
                    .measured_timeout
                    .map(|measured| max(config.min_timeout, measured.mul_f64(config.timeout_multiplier)));

                let mut due = Vec::new();
                for pending in inner.pending.values_mut() {
                    let last_sent = pending
                        .send_times
                        .last()
                        .copied()
                        .expect("pending entry without a send time");
                    let elapsed = now.duration_since(last_sent);

                    let is_due = elapsed >= config.max_timeout
                        || effective_timeout.map(|timeout| elapsed >= timeout).unwrap_or(false);
                    if !is_due {
                        continue;
                    }

                    pending.iteration = pending.iteration.wrapping_add(1);
                    pending.send_times.push(now);

                    let mut framed = Vec::with_capacity(2 + pending.payload.len());
                    DynamicAckFrame::Resend {
                        iteration: pending.iteration,
                        payload: &pending.payload,
                    }
                    .ser(&mut framed);
                    due.push(framed);
                }
                (inner.binding.clone(), due)
            };

            if let Some(binding) = binding {
                for framed in due {
                    trace!("retransmitting unacknowledged message of {} bytes", framed.len());
                    binding.continue_build(&framed).await;
                }
            }
        }
    }

    async fn deliver_and_acknowledge(&self, payload: &[u8], iteration: u8) {
        let binding = self.inner.read().await.binding.clone();
        if let Some(binding) = binding {
            binding.continue_read(payload).await;

            let mut ack = Vec::with_capacity(2 + PayloadHash::SERIALIZED_LEN);
            DynamicAckFrame::Acknowledge {
                iteration,
                hash: PayloadHash::of(payload),
            }
            .ser(&mut ack);
            binding.continue_build(&ack).await;
        }
    }
}

#[async_trait]
impl Module for DynamicAckModule {
    async fn bind(&self, binding: ModuleBinding) {
        self.inner.write().await.binding = Some(binding);
    }

    async fn read(&self, frame: &[u8]) {
        let parsed = match DynamicAckFrame::deser(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("malformed frame - dropping: {}", e);
                return;
            }
        };

        match parsed {
            DynamicAckFrame::Data { payload } => {
                self.deliver_and_acknowledge(payload, 0).await;
            }
            DynamicAckFrame::Resend { iteration, payload } => {
                self.deliver_and_acknowledge(payload, iteration).await;
            }
            DynamicAckFrame::Acknowledge { iteration, hash } => {
                let mut inner = self.inner.write().await;
                match inner.pending.remove(&hash) {
                    Some(pending) => {
                        if let Some(&sent) = pending.send_times.get(iteration as usize) {
                            let measured = Instant::now().duration_since(sent);
                            trace!("acknowledgement for iteration {} - measured round trip {:?}", iteration, measured);
                            inner.measured_timeout = Some(measured);
                        } else {
                            debug!("acknowledgement for iteration {} with no recorded transmission - no measurement", iteration);
                        }
                    }
                    None => {
                        debug!("acknowledgement for unknown payload hash {:?} - ignoring", hash);
                    }
                }
            }
        }
    }

    async fn build(&self, message: &[u8]) {
        let mut framed = Vec::with_capacity(1 + message.len());
        DynamicAckFrame::Data { payload: message }.ser(&mut framed);

        let binding = {
            let mut inner = self.inner.write().await;
            inner.pending.insert(
                PayloadHash::of(message),
                PendingMessage {
                    payload: message.to_vec(),
                    iteration: 0,
                    send_times: vec![Instant::now()],
                },
            );
            inner.binding.clone()
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
        dispatcher: MockMessageDispatcher,
        sink: MockTransportSink,
    ) -> (Pipeline, Arc<DynamicAckModule>) {
        let mut module = DynamicAckModule::new(Arc::new(DynamicAckConfig::default()));
        module.spawn_retransmit_loop();
        let module = Arc::new(module);

        let pipeline = Pipeline::new(Some(Arc::new(dispatcher)), Some(Arc::new(sink)));
        pipeline.set_modules(vec![module.clone() as Arc<dyn Module>]).await;
        (pipeline, module)
    }

    fn ack_frame_for(payload: &[u8], iteration: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicAckFrame::Acknowledge { iteration, hash: PayloadHash::of(payload) }.ser(&mut buf);
        buf
    }

    #[rstest]
    #[case::original(vec![0x00, 0x41, 0x42], 0)]
    #[case::retransmission(vec![0x01, 3, 0x41, 0x42], 3)]
    fn test_inbound_data_is_delivered_and_acknowledged(#[case] frame: Vec<u8>, #[case] expected_iteration: u8) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message()
                .once()
                .withf(|message| message == [0x41, 0x42])
                .return_const(());
            let mut sink = MockTransportSink::new();
            let expected_ack = ack_frame_for(&[0x41, 0x42], expected_iteration);
            sink.expect_send_frame()
                .once()
                .withf(move |sent| sent == expected_ack.as_slice())
                .return_const(());

            let (pipeline, _module) = single_module_pipeline(dispatcher, sink).await;

            pipeline.read(&frame).await;
        });
    }

    #[rstest]
    fn test_no_retransmission_before_max_timeout_without_measurement() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            sink.expect_send_frame()
                .once()
                .withf(|frame| frame == [0x00, 0x41])
                .return_const(());

            let (pipeline, module) = single_module_pipeline(MockMessageDispatcher::new(), sink).await;

            pipeline.build(&[0x41]).await;
            time::sleep(Duration::from_millis(900)).await;
            assert_eq!(module.outstanding().await, 1);
        });
    }

    #[rstest]
    fn test_round_trip_is_attributed_to_the_acknowledged_iteration() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            sink.expect_send_frame()
                .once()
                .withf(|frame| frame == [0x00, 0x41, 0x42])
                .return_const(());
            sink.expect_send_frame()
                .once()
                .withf(|frame| frame == [0x01, 1, 0x41, 0x42])
                .return_const(());

            let (pipeline, module) = single_module_pipeline(MockMessageDispatcher::new(), sink).await;

            // the original transmission goes unacknowledged; the hard ceiling fires at 1000ms
            pipeline.build(&[0x41, 0x42]).await;
            time::sleep(Duration::from_millis(1100)).await;

            // the acknowledgement names iteration 1, so the measurement is taken against the
            //  retransmission at t=1000, not against the original send at t=0
            pipeline.read(&ack_frame_for(&[0x41, 0x42], 1)).await;

            assert_eq!(module.outstanding().await, 0);
            assert_eq!(module.measured_timeout().await, Some(Duration::from_millis(100)));
        });
    }

    #[rstest]
    fn test_measured_timeout_drives_retransmission() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            sink.expect_send_frame()
                .once()
                .withf(|frame| frame == [0x00, 0x41])
                .return_const(());
            let own_ack = ack_frame_for(&[0x41], 0);
            sink.expect_send_frame()
                .once()
                .withf(move |frame| frame == own_ack.as_slice())
                .return_const(());
            sink.expect_send_frame()
                .once()
                .withf(|frame| frame == [0x00, 0x51])
                .return_const(());
            sink.expect_send_frame()
                .once()
                .withf(|frame| frame == [0x01, 1, 0x51])
                .return_const(());
            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message().return_const(());

            let (pipeline, module) = single_module_pipeline(dispatcher, sink).await;

            // loop the first message back to ourselves to obtain a 100ms measurement
            pipeline.build(&[0x41]).await;
            time::sleep(Duration::from_millis(100)).await;
            pipeline.read(&[0x00, 0x41]).await;
            pipeline.read(&ack_frame_for(&[0x41], 0)).await;
            assert_eq!(module.measured_timeout().await, Some(Duration::from_millis(100)));

            // effective timeout is now max(1ms, 100ms * 2) = 200ms, well below the 1000ms ceiling
            pipeline.build(&[0x51]).await;
            time::sleep(Duration::from_millis(250)).await;
            assert_eq!(module.outstanding().await, 1);
        });
    }

    #[rstest]
    fn test_acknowledgement_without_recorded_iteration_clears_but_measures_nothing() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let mut sink = MockTransportSink::new();
            sink.expect_send_frame()
                .once()
                .withf(|frame| frame == [0x00, 0x41])
                .return_const(());

            let (pipeline, module) = single_module_pipeline(MockMessageDispatcher::new(), sink).await;

            pipeline.build(&[0x41]).await;
            pipeline.read(&ack_frame_for(&[0x41], 7)).await;

            assert_eq!(module.outstanding().await, 0);
            assert_eq!(module.measured_timeout().await, None);
        });
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_tag(vec![5, 1, 2])]
    #[case::resend_missing_iteration(vec![0x01])]
    #[case::truncated_ack(vec![0x02, 0, 0xaa])]
    fn test_malformed_frame_is_dropped(#[case] frame: Vec<u8>) {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (pipeline, _module) = single_module_pipeline(MockMessageDispatcher::new(), MockTransportSink::new()).await;

            pipeline.read(&frame).await;
        });
    }
}
