use crate::model::MonitorEvent;
use tokio::sync::mpsc;

/// Append-only destination for core events. `emit` must not block: it is
/// called while the scheduler holds its state lock.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MonitorEvent);
}

impl EventSink for mpsc::UnboundedSender<MonitorEvent> {
    fn emit(&self, event: MonitorEvent) {
        // A closed receiver means the front end is gone; nothing left to tell.
        self.send(event).ok();
    }
}
