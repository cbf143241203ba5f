//! Native change notifications raised by entity objects.
//!
//! Entities that can report their own mutations receive a
//! [`NotificationSink`] when they start being tracked. Notifications are
//! queued on a channel owned by the state manager and applied the next time
//! the manager processes notifications.

use crate::entry::EntryId;
use crate::value::Value;
use std::sync::mpsc::{self, Receiver, Sender};

/// Phase of a property notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationPhase {
    /// Raised before the member is written.
    ///
    /// Carries the scalar value about to be replaced; `None` for navigations.
    Changing(Option<Value>),
    /// Raised after the member was written.
    Changed,
}

/// A notification raised by an entity object about one of its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyNotification {
    /// Entry tracking the object that raised the notification.
    pub entry: EntryId,
    /// Property or navigation name.
    pub member: String,
    /// Phase of the change.
    pub phase: NotificationPhase,
}

/// Sending half handed to an entity object at subscription time.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    entry: EntryId,
    sender: Sender<PropertyNotification>,
}

impl NotificationSink {
    pub(crate) fn new(entry: EntryId, sender: Sender<PropertyNotification>) -> Self {
        Self { entry, sender }
    }

    /// Returns the entry this sink reports for.
    #[must_use]
    pub fn entry(&self) -> EntryId {
        self.entry
    }

    /// Reports that `member` is about to change from `previous`.
    pub fn property_changing(&self, member: &str, previous: Option<Value>) {
        self.send(member, NotificationPhase::Changing(previous));
    }

    /// Reports that `member` has changed.
    pub fn property_changed(&self, member: &str) {
        self.send(member, NotificationPhase::Changed);
    }

    fn send(&self, member: &str, phase: NotificationPhase) {
        // A closed channel means the manager is gone; nothing left to notify.
        let _ = self.sender.send(PropertyNotification {
            entry: self.entry,
            member: member.to_string(),
            phase,
        });
    }
}

/// Receiving half owned by the state manager.
#[derive(Debug)]
pub(crate) struct NotificationQueue {
    sender: Sender<PropertyNotification>,
    receiver: Receiver<PropertyNotification>,
}

impl NotificationQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }

    pub(crate) fn sink(&self, entry: EntryId) -> NotificationSink {
        NotificationSink::new(entry, self.sender.clone())
    }

    /// Takes every queued notification in arrival order.
    pub(crate) fn drain(&self) -> Vec<PropertyNotification> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_delivers_in_order() {
        let queue = NotificationQueue::new();
        let entry = EntryId::new(1, 1);
        let sink = queue.sink(entry);

        sink.property_changing("Name", Some(Value::from("old")));
        sink.property_changed("Name");

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(
            drained[0].phase,
            NotificationPhase::Changing(Some(Value::from("old")))
        );
        assert_eq!(drained[1].phase, NotificationPhase::Changed);
        assert_eq!(drained[1].entry, entry);
        assert!(queue.drain().is_empty());
    }
}
