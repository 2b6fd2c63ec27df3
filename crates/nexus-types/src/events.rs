use crate::batch::{BatchSubtaskStatus, BatchTaskStatus};
use crate::transfer::{TransferSubtaskStatus, TransferTaskStatus};
use serde::Serialize;
use std::sync::RwLock;
use uuid::Uuid;

// ── Domain events ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    LoginSuccess {
        user_id: Uuid,
        username: String,
    },
    LoginFailure {
        username: String,
        ip: String,
    },
    PasskeyRegistered {
        user_id: Uuid,
        passkey_name: String,
    },
    BatchStarted {
        task_id: Uuid,
        targets: usize,
    },
    BatchSubtaskUpdate {
        task_id: Uuid,
        subtask_id: Uuid,
        status: BatchSubtaskStatus,
        progress: u8,
    },
    BatchSubtaskLog {
        task_id: Uuid,
        subtask_id: Uuid,
        chunk: String,
    },
    BatchCompleted {
        task_id: Uuid,
        status: BatchTaskStatus,
    },
    TransferStarted {
        task_id: Uuid,
        targets: usize,
        items: usize,
    },
    TransferSubtaskUpdate {
        task_id: Uuid,
        subtask_id: Uuid,
        status: TransferSubtaskStatus,
        progress: u8,
    },
    TransferCompleted {
        task_id: Uuid,
        status: TransferTaskStatus,
    },
}

// ── Event Bus ────────────────────────────────────────────────────
//
// In-process pub/sub. Delivery is synchronous on the publisher's
// thread so per-event-type ordering is preserved; handlers must not
// block. Subscribers register at startup and are never removed.

type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .expect("event bus lock poisoned")
            .push(Box::new(handler));
    }

    pub fn publish(&self, event: &Event) {
        let subscribers = self.subscribers.read().expect("event bus lock poisoned");
        for handler in subscribers.iter() {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let seen = seen.clone();
            bus.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish(&Event::BatchStarted {
            task_id: Uuid::new_v4(),
            targets: 2,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delivery_order_is_publish_order() {
        let bus = EventBus::new();
        let order = Arc::new(RwLock::new(Vec::new()));
        let sink = order.clone();
        bus.subscribe(move |event| {
            if let Event::BatchSubtaskUpdate { progress, .. } = event {
                sink.write().unwrap().push(*progress);
            }
        });

        let (task_id, subtask_id) = (Uuid::new_v4(), Uuid::new_v4());
        for progress in [10u8, 50, 100] {
            bus.publish(&Event::BatchSubtaskUpdate {
                task_id,
                subtask_id,
                status: BatchSubtaskStatus::Running,
                progress,
            });
        }
        assert_eq!(*order.read().unwrap(), vec![10, 50, 100]);
    }
}
