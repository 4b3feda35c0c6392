//! `EventSink` implementations.

use tokio::sync::broadcast;

use crate::domain::TaskEvent;
use crate::ports::EventSink;

/// Fans events out to any number of `broadcast` receivers.
///
/// Slow receivers lag and lose the oldest events; emitters never wait.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<TaskEvent>,
}

impl BroadcastEventSink {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: TaskEvent) {
        tracing::trace!(event = event.name(), "emit");
        // no receivers is fine
        let _ = self.tx.send(event);
    }
}

/// Drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: TaskEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskRecord;

    #[tokio::test]
    async fn subscribers_see_emitted_events() {
        let sink = BroadcastEventSink::default();
        let mut rx = sink.subscribe();

        sink.emit(TaskEvent::Created {
            task: TaskRecord::new().with_id("t1"),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "task.created");
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let sink = BroadcastEventSink::new(4);
        sink.emit(TaskEvent::Failed {
            task: TaskRecord::new(),
        });
        NoopEventSink.emit(TaskEvent::Failed {
            task: TaskRecord::new(),
        });
    }
}
