//! EventSink port.

use crate::domain::TaskEvent;

/// Receives lifecycle notifications (`task.created`, `task.ran`, ...).
///
/// Emitting never fails and never blocks; a sink with no listeners drops events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TaskEvent);
}
