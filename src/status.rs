//! Generation status and its publisher.
//!
//! The current [`GenerationStatus`] is replaced wholesale on every transition
//! and handed synchronously to every subscriber. Progress never decreases
//! while a generation is running.

use crate::util::lock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub const CAPTURE_END: f64 = 40.0;
pub const ASSEMBLY_END: f64 = 80.0;
pub const ENCODE_END: f64 = 90.0;
pub const DONE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Capturing,
    Assembling,
    Encoding,
    Retrying,
    Completed,
    Cancelled,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Cancelled | Stage::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub is_generating: bool,
    pub progress: f64,
    pub error: Option<String>,
    pub completed: bool,
    pub stage: Stage,
    pub attempt: u32,
}
impl Default for GenerationStatus {
    fn default() -> Self {
        Self {
            is_generating: false,
            progress: 0.0,
            error: None,
            completed: false,
            stage: Stage::Idle,
            attempt: 0,
        }
    }
}

impl GenerationStatus {
    pub fn is_cancelled(&self) -> bool {
        self.stage == Stage::Cancelled
            && !self.is_generating
            && !self.completed
            && self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&GenerationStatus) + Send + Sync>;

pub struct StatusPublisher {
    current: Mutex<GenerationStatus>,
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
    watch: watch::Sender<GenerationStatus>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (watch, _) = watch::channel(GenerationStatus::default());
        Self {
            current: Mutex::new(GenerationStatus::default()),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            watch,
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&GenerationStatus) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push((id, Arc::new(callback)));
        id
    }

    /// Returns false when the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.subscribers);
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn watch(&self) -> watch::Receiver<GenerationStatus> {
        self.watch.subscribe()
    }

    pub fn current(&self) -> GenerationStatus {
        lock(&self.current).clone()
    }

    /// Fresh status for a new generation; the previous one is superseded.
    pub fn begin(&self) {
        self.replace(GenerationStatus {
            is_generating: true,
            progress: 0.0,
            error: None,
            completed: false,
            stage: Stage::Capturing,
            attempt: 1,
        });
    }

    pub fn advance(&self, stage: Stage, progress: f64, attempt: u32) {
        self.publish(GenerationStatus {
            is_generating: true,
            progress,
            error: None,
            completed: false,
            stage,
            attempt,
        });
    }

    pub fn complete(&self, attempt: u32) {
        self.publish(GenerationStatus {
            is_generating: false,
            progress: DONE,
            error: None,
            completed: true,
            stage: Stage::Completed,
            attempt,
        });
    }

    pub fn cancel(&self, attempt: u32) {
        let progress = self.current().progress;
        self.publish(GenerationStatus {
            is_generating: false,
            progress,
            error: None,
            completed: false,
            stage: Stage::Cancelled,
            attempt,
        });
    }

    pub fn fail(&self, message: impl Into<String>, attempt: u32) {
        let progress = self.current().progress;
        self.publish(GenerationStatus {
            is_generating: false,
            progress,
            error: Some(message.into()),
            completed: false,
            stage: Stage::Failed,
            attempt,
        });
    }

    /// Back to `Idle` after a terminal state has been consumed.
    pub fn reset(&self) {
        self.replace(GenerationStatus::default());
    }

    fn publish(&self, mut next: GenerationStatus) {
        let prev = self.current();
        if prev.is_generating {
            next.progress = next.progress.max(prev.progress);
        }
        next.progress = next.progress.clamp(0.0, DONE);
        self.replace(next);
    }

    fn replace(&self, next: GenerationStatus) {
        *lock(&self.current) = next.clone();
        self.watch.send_replace(next.clone());
        let subs: Vec<Callback> = lock(&self.subscribers)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in subs {
            cb(&next);
        }
    }
}
