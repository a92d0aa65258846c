//! In-memory plumbing for wiring two mirror pipelines together, used by the end-to-end tests.
//!  Frames leaving the bottom of one stack are pumped into the bottom of the other, with
//!  configurable link quality per direction.

use crate::message_dispatcher::MessageDispatcher;
use crate::pipeline::{Module, Pipeline};
use crate::transport_sink::TransportSink;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

/// how an in-memory link treats the frames passed through it
#[derive(Copy, Clone, Debug)]
pub enum LinkQuality {
    /// every frame is delivered exactly once, in order
    Perfect,
    /// the first `n` frames are swallowed; everything after is delivered
    DropFirst(usize),
}

/// records every fully reassembled message surfacing at the top of a pipeline
pub struct RecordingDispatcher {
    messages: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<RecordingDispatcher> {
        Arc::new(RecordingDispatcher {
            messages: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.messages.lock().await.clone()
    }

    /// waits until at least `count` messages have been recorded
    pub async fn await_message_count(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.messages.lock().await.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn on_message(&self, message: &[u8]) {
        self.messages.lock().await.push(message.to_vec());
        self.notify.notify_waiters();
    }
}

struct LinkSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl TransportSink for LinkSink {
    async fn send_frame(&self, frame: &[u8]) {
        // the peer may already be gone at test teardown
        let _ = self.tx.send(frame.to_vec());
    }
}

pub struct LinkedPeer {
    pub pipeline: Arc<Pipeline>,
    pub received: Arc<RecordingDispatcher>,
}

/// two mirror pipelines connected through an in-memory link
pub struct LinkedPair {
    pub left: LinkedPeer,
    pub right: LinkedPeer,
    pump_handles: Vec<JoinHandle<()>>,
}

impl Drop for LinkedPair {
    fn drop(&mut self) {
        for handle in &self.pump_handles {
            handle.abort();
        }
    }
}

pub async fn link_pipelines(
    left_modules: Vec<Arc<dyn Module>>,
    right_modules: Vec<Arc<dyn Module>>,
    left_to_right: LinkQuality,
    right_to_left: LinkQuality,
) -> LinkedPair {
    let (ltr_tx, ltr_rx) = mpsc::unbounded_channel();
    let (rtl_tx, rtl_rx) = mpsc::unbounded_channel();

    let left_received = RecordingDispatcher::new();
    let left_pipeline = Arc::new(Pipeline::new(
        Some(left_received.clone() as Arc<dyn MessageDispatcher>),
        Some(Arc::new(LinkSink { tx: ltr_tx })),
    ));
    left_pipeline.set_modules(left_modules).await;

    let right_received = RecordingDispatcher::new();
    let right_pipeline = Arc::new(Pipeline::new(
        Some(right_received.clone() as Arc<dyn MessageDispatcher>),
        Some(Arc::new(LinkSink { tx: rtl_tx })),
    ));
    right_pipeline.set_modules(right_modules).await;

    let pump_handles = vec![
        tokio::spawn(pump(ltr_rx, right_pipeline.clone(), left_to_right)),
        tokio::spawn(pump(rtl_rx, left_pipeline.clone(), right_to_left)),
    ];

    LinkedPair {
        left: LinkedPeer { pipeline: left_pipeline, received: left_received },
        right: LinkedPeer { pipeline: right_pipeline, received: right_received },
        pump_handles,
    }
}

async fn pump(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, into: Arc<Pipeline>, quality: LinkQuality) {
    let mut frame_counter = 0usize;
    while let Some(frame) = rx.recv().await {
        let deliver = match quality {
            LinkQuality::Perfect => true,
            LinkQuality::DropFirst(n) => frame_counter >= n,
        };
        frame_counter += 1;

        if deliver {
            into.read(&frame).await;
        } else {
            trace!("link dropping frame #{} of {} bytes", frame_counter - 1, frame.len());
        }
    }
}
