use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Upward terminal of a pipeline: called with every message that traversed the full module
///  stack, i.e. the reassembled application-level bytes.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, message: &[u8]);
}
