use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// Downward terminal of a pipeline: called with every fully framed byte string that left the
///  bottom of the module stack, to be handed to whatever actually ships bytes between peers.
///
/// This is an abstraction over the real transport, introduced to keep the pipeline independent
///  of I/O and to facilitate mocking in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportSink: Send + Sync + 'static {
    async fn send_frame(&self, frame: &[u8]);
}
