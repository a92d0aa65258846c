use crate::config::AckConfig;
use crate::frames::AckFrame;
use crate::payload_hash::PayloadHash;
use crate::pipeline::{Module, ModuleBinding};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, trace, warn};

/// cadence of the retransmission check - a design constant, not a tuning knob
const TICK_INTERVAL: Duration = Duration::from_millis(10);

struct PendingMessage {
    framed: Vec<u8>,
    last_sent: Instant,
}

struct AckModuleInner {
    binding: Option<ModuleBinding>,
    pending: FxHashMap<PayloadHash, PendingMessage>,
}

/// Hash-acknowledged stop-and-go retransmission with a fixed timeout.
///
/// Every outbound message is framed as `Data` and remembered under the SHA-1 digest of its
///  payload until a matching `Acknowledge` arrives; a background worker re-emits anything
///  unacknowledged for longer than the configured timeout. Delivery is at-least-once: the
///  receive side does not deduplicate, so a retransmission that crosses its acknowledgement
///  on the wire surfaces the payload upward twice.
pub struct AckModule {
    config: Arc<AckConfig>,
    inner: Arc<RwLock<AckModuleInner>>,
    timer_handle: Option<JoinHandle<()>>,
}

impl Drop for AckModule {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle.take() {
            handle.abort();
        }
    }
}

impl AckModule {
    pub fn new(config: Arc<AckConfig>) -> AckModule {
        AckModule {
            config,
            inner: Arc::new(RwLock::new(AckModuleInner {
                binding: None,
                pending: FxHashMap::default(),
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

    async fn do_loop(config: Arc<AckConfig>, inner: Arc<RwLock<AckModuleInner>>) {
        let mut tick = interval(TICK_INTERVAL);
        loop {
            tick.tick().await;

            // snapshot due frames under the lock, emit after releasing it - the continuation
            //  descends through lower modules and must not run under our lock
            let (binding, due) = {
                let mut inner = inner.write().await;
                let now = Instant::now();
                let mut due = Vec::new();
                for pending in inner.pending.values_mut() {
                    if now.duration_since(pending.last_sent) >= config.retransmit_timeout {
                        pending.last_sent = now;
                        due.push(pending.framed.clone());
                    }
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
}

#[async_trait]
impl Module for AckModule {
    async fn bind(&self, binding: ModuleBinding) {
        self.inner.write().await.binding = Some(binding);
    }

    async fn read(&self, frame: &[u8]) {
        let parsed = match AckFrame::deser(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("malformed frame - dropping: {}", e);
                return;
            }
        };

        match parsed {
            AckFrame::Data { payload } => {
                let binding = self.inner.read().await.binding.clone();
                if let Some(binding) = binding {
                    binding.continue_read(payload).await;

                    let mut ack = Vec::with_capacity(1 + PayloadHash::SERIALIZED_LEN);
                    AckFrame::Acknowledge { hash: PayloadHash::of(payload) }.ser(&mut ack);
                    binding.continue_build(&ack).await;
                }
            }
            AckFrame::Acknowledge { hash } => {
                let mut inner = self.inner.write().await;
                if inner.pending.remove(&hash).is_none() {
                    debug!("acknowledgement for unknown payload hash {:?} - ignoring", hash);
                }
            }
        }
    }

    async fn build(&self, message: &[u8]) {
        let mut framed = Vec::with_capacity(1 + message.len());
        AckFrame::Data { payload: message }.ser(&mut framed);

        let binding = {
            let mut inner = self.inner.write().await;
            // re-building a byte-identical payload replaces the previous entry - there is at
            //  most one pending entry per hash value
            inner.pending.insert(
                PayloadHash::of(message),
                PendingMessage { framed: framed.clone(), last_sent: Instant::now() },
            );
            inner.binding.clone()
        };

        if let Some(binding) = binding {
            binding.continue_build(&framed).await;
        }
    }
}
