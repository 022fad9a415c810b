//! Stream bridge between engine callbacks and one caller's stream.
//!
//! An [`EventSink`] wraps the sending half of a bounded channel. Engine reader
//! tasks call into it concurrently; a mutex around the sender makes delivery
//! single-writer, so messages leave in the order the callbacks ran. The
//! terminal result closes the sink and everything emitted afterwards is
//! dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::engine::{
    BuildEnvironment, GradleProject, InvocationListener, OutputChunk, ProgressEvent,
};
use crate::error::OperationError;

/// Non-terminal message on an operation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    Progress(ProgressEvent),
    Output(OutputChunk),
    Environment(BuildEnvironment),
}

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationPayload {
    Environment(BuildEnvironment),
    ProjectModel(GradleProject),
    TasksCompleted,
}

pub type OperationResult = Result<OperationPayload, OperationError>;

/// Item received by the caller. `Terminal` is always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(OperationEvent),
    Terminal(OperationResult),
}

/// Receiving half handed to the transport.
pub type OperationStream = mpsc::Receiver<StreamItem>;

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    streaming: AtomicBool,
}

/// Ordered, single-writer sink for one operation.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Arc<Mutex<Option<mpsc::Sender<StreamItem>>>>,
    counters: Arc<Counters>,
}

impl EventSink {
    /// Create a sink and the stream it feeds. `buffer` must be non-zero.
    pub fn channel(buffer: usize) -> (EventSink, OperationStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let sink = EventSink {
            tx: Arc::new(Mutex::new(Some(tx))),
            counters: Arc::new(Counters::default()),
        };
        (sink, rx)
    }

    /// Deliver one event. Suspends while the stream is full.
    ///
    /// Returns `false` when the sink is closed or the caller went away.
    pub async fn emit(&self, event: OperationEvent) -> bool {
        let mut guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if tx.send(StreamItem::Event(event)).await.is_err() {
            // receiver is gone; nothing else will get through
            *guard = None;
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.counters.streaming.store(true, Ordering::Relaxed);
        true
    }

    /// Deliver the terminal result and close the sink.
    ///
    /// Only the first call has any effect.
    pub async fn complete(&self, result: OperationResult) -> bool {
        let tx = self.tx.lock().await.take();
        match tx {
            Some(tx) => tx.send(StreamItem::Terminal(result)).await.is_ok(),
            None => false,
        }
    }

    /// Resolves when the sink can no longer deliver: completed, or the
    /// receiving side dropped.
    pub async fn closed(&self) {
        let tx = self.tx.lock().await.clone();
        if let Some(tx) = tx {
            tx.closed().await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        match self.tx.lock().await.as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }

    /// Whether at least one event reached the stream.
    pub fn has_streamed(&self) -> bool {
        self.counters.streaming.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.counters.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl InvocationListener for EventSink {
    async fn on_progress(&self, event: ProgressEvent) {
        self.emit(OperationEvent::Progress(event)).await;
    }

    async fn on_output(&self, chunk: OutputChunk) {
        self.emit(OperationEvent::Output(chunk)).await;
    }
}
