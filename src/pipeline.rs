use crate::message_dispatcher::MessageDispatcher;
use crate::transport_sink::TransportSink;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{trace, warn};

/// A transformer in the stack, responsible for exactly one protocol concern. Modules see whole
///  byte messages and may emit zero, one or many messages toward either neighbor through their
///  [ModuleBinding], synchronously during [Module::read] / [Module::build] or later from a
///  background task of their own (e.g. a retransmission timer).
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// called by the pipeline when a module list is assigned, stamping the module with its
    ///  position in the stack. A module keeps only the most recent binding.
    async fn bind(&self, binding: ModuleBinding);

    /// a frame arriving from the transport side, to be parsed / reassembled and passed upward
    async fn read(&self, frame: &[u8]);

    /// a message arriving from the application side, to be framed and passed downward
    async fn build(&self, message: &[u8]);
}

/// A module's handle into the pipeline it is part of: its position, plus the continuation
///  entry points that advance a payload to the next module in either direction.
///
/// The handle is deliberately non-owning - the pipeline owns its modules, and a binding held
///  by a module (or by its timer task) does not keep the pipeline alive. Continuations after
///  the pipeline is gone are silently dropped.
#[derive(Clone)]
pub struct ModuleBinding {
    index: usize,
    core: Weak<PipelineCore>,
}

impl ModuleBinding {
    /// hand `data` to the next module further up, or to the message dispatcher if this
    ///  module is at the top of the stack
    pub async fn continue_read(&self, data: &[u8]) {
        if let Some(core) = self.core.upgrade() {
            core.dispatch_read(data, self.index + 1).await;
        }
    }

    /// hand `data` to the next module further down, or to the transport sink if this
    ///  module is at the bottom of the stack
    pub async fn continue_build(&self, data: &[u8]) {
        if let Some(core) = self.core.upgrade() {
            core.dispatch_build(data, self.index.checked_sub(1)).await;
        }
    }
}

/// An ordered stack of [Module]s: index 0 is closest to the transport, the highest index
///  closest to the application. [Pipeline::read] enters at the bottom and ascends,
///  [Pipeline::build] enters at the top and descends; whatever falls off either end is
///  delivered to the corresponding event sink.
///
/// The pipeline performs no buffering, ordering or threading of its own - continuations run
///  on the caller's task, and concurrent entries from application, transport and module timer
///  contexts are the modules' business to tolerate.
pub struct Pipeline {
    core: Arc<PipelineCore>,
}

struct PipelineCore {
    modules: RwLock<Vec<Arc<dyn Module>>>,
    message_dispatcher: Option<Arc<dyn MessageDispatcher>>,
    transport_sink: Option<Arc<dyn TransportSink>>,
}

impl Pipeline {
    /// Either sink may be absent, in which case payloads reaching that end of the stack are
    ///  discarded.
    pub fn new(
        message_dispatcher: Option<Arc<dyn MessageDispatcher>>,
        transport_sink: Option<Arc<dyn TransportSink>>,
    ) -> Pipeline {
        Pipeline {
            core: Arc::new(PipelineCore {
                modules: RwLock::new(Vec::new()),
                message_dispatcher,
                transport_sink,
            }),
        }
    }

    /// Assigns the module stack, re-stamping every module with its position. A previously
    ///  assigned list is no longer driven by this pipeline.
    pub async fn set_modules(&self, modules: Vec<Arc<dyn Module>>) {
        for (index, module) in modules.iter().enumerate() {
            module
                .bind(ModuleBinding {
                    index,
                    core: Arc::downgrade(&self.core),
                })
                .await;
        }
        *self.core.modules.write().await = modules;
    }

    /// inject a frame from the transport at the bottom of the stack
    pub async fn read(&self, frame: &[u8]) {
        self.core.dispatch_read(frame, 0).await;
    }

    /// hand an application message to the top of the stack for transmission
    pub async fn build(&self, message: &[u8]) {
        let top = self.core.modules.read().await.len().checked_sub(1);
        self.core.dispatch_build(message, top).await;
    }
}

impl PipelineCore {
    async fn dispatch_read(&self, data: &[u8], index: usize) {
        // the stack length is captured together with the lookup: only the index one past the
        //  current top is a completed read, anything further is a stale continuation
        let (module, stack_len) = {
            let modules = self.modules.read().await;
            (modules.get(index).cloned(), modules.len())
        };
        match module {
            Some(module) => module.read(data).await,
            None if index == stack_len => match &self.message_dispatcher {
                Some(dispatcher) => dispatcher.on_message(data).await,
                None => trace!("no message dispatcher - discarding fully read message of {} bytes", data.len()),
            },
            None => warn!("read continuation into index {} which is no longer part of the stack - discarding", index),
        }
    }

    async fn dispatch_build(&self, data: &[u8], index: Option<usize>) {
        match index {
            Some(index) => {
                let module = self.modules.read().await.get(index).cloned();
                match module {
                    Some(module) => module.build(data).await,
                    None => warn!("build continuation into index {} which is no longer part of the stack - discarding", index),
                }
            }
            None => match &self.transport_sink {
                Some(sink) => sink.send_frame(data).await,
                None => trace!("no transport sink - discarding fully built frame of {} bytes", data.len()),
            },
        }
    }
}
