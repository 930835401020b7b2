// Process-local event publisher bridge.
//
// One slot: an external subscriber (the live-event push path) registers a
// handler and the store invokes it after every successful append. The hook
// is best-effort; the subscriber owns any queueing and drop policy, and the
// core never blocks on it.

use std::sync::{Arc, RwLock};

use crate::store::NetworkEvent;

/// Receives every event the store successfully appends.
///
/// Implementations must return promptly; a subscriber with a full queue
/// should drop the event rather than block the writer.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &NetworkEvent);
}

static SLOT: RwLock<Option<Arc<dyn EventPublisher>>> = RwLock::new(None);

/// Register the subscriber, replacing any previous registration.
pub fn set_publisher(publisher: Arc<dyn EventPublisher>) {
    *SLOT.write().expect("publisher slot poisoned") = Some(publisher);
}

/// Remove the current subscriber, if any.
pub fn clear_publisher() {
    *SLOT.write().expect("publisher slot poisoned") = None;
}

/// Invoke the registered subscriber. A no-op when none is registered.
pub(crate) fn publish(event: &NetworkEvent) {
    let slot = SLOT.read().expect("publisher slot poisoned");
    if let Some(publisher) = slot.as_ref() {
        publisher.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // The slot is process-global; serialize the tests that touch it.
    static SLOT_TEST_LOCK: Mutex<()> = Mutex::new(());

    struct Recorder {
        count: AtomicUsize,
        last_type: Mutex<String>,
    }

    impl EventPublisher for Recorder {
        fn publish(&self, event: &NetworkEvent) {
            // Only count this module's marker events; store tests running in
            // parallel also publish.
            if event.interface == "pub-test" {
                self.count.fetch_add(1, Ordering::SeqCst);
                *self.last_type.lock().unwrap() = event.event_type.as_str().to_string();
            }
        }
    }

    #[test]
    fn publishes_to_registered_subscriber() {
        let _guard = SLOT_TEST_LOCK.lock().unwrap();
        let recorder = Arc::new(Recorder {
            count: AtomicUsize::new(0),
            last_type: Mutex::new(String::new()),
        });
        set_publisher(recorder.clone());

        let mut ev = NetworkEvent::default();
        ev.event_type = crate::store::EventType::TcpStart;
        ev.interface = "pub-test".to_string();
        publish(&ev);

        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        assert_eq!(&*recorder.last_type.lock().unwrap(), "TCP_START");

        clear_publisher();
        publish(&ev);
        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_without_subscriber_is_noop() {
        let _guard = SLOT_TEST_LOCK.lock().unwrap();
        clear_publisher();
        publish(&NetworkEvent::default()); // must not panic
    }
}
