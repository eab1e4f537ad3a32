use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation flag polled at pipeline checkpoints.
///
/// Setting the flag never interrupts work in progress; it is observed at the
/// next checkpoint. Backoff waits additionally wake early through the watch
/// channel. One token belongs to exactly one generation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    signal: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal: Arc::new(signal),
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.signal.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Named pipeline checkpoints, used in logs when cancellation is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    BeforeCapture,
    AfterCapture,
    BeforeAssembly,
    BeforePageWrite(usize),
    BeforeBackoff,
    BeforePersistChunk,
}
