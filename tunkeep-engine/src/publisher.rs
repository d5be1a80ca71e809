//! Status event publisher
//!
//! Holds at most one observer. Events are handed to a single dispatcher
//! task, so the observer always runs on the same context and sees events in
//! the order they were published, whatever thread published them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::event::{StatusEvent, StatusObserver};

type Delivery = (Arc<dyn StatusObserver>, StatusEvent);

pub struct StatusPublisher {
    observer: Mutex<Option<Arc<dyn StatusObserver>>>,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl StatusPublisher {
    /// Create a publisher whose dispatcher runs on `runtime`
    pub fn new(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        runtime.spawn(async move {
            while let Some((observer, event)) = rx.recv().await {
                observer.on_status(event).await;
            }
            log::debug!("Status dispatcher stopped");
        });

        Self {
            observer: Mutex::new(None),
            tx,
        }
    }

    /// Replace the current observer
    pub fn attach(&self, observer: Arc<dyn StatusObserver>) {
        if self.observer.lock().replace(observer).is_some() {
            log::debug!("Replaced status observer");
        }
    }

    /// Drop the current observer
    pub fn detach(&self) {
        self.observer.lock().take();
    }

    pub fn has_observer(&self) -> bool {
        self.observer.lock().is_some()
    }

    /// Queue an event for the current observer. Without one the event is
    /// dropped.
    pub fn publish(&self, event: StatusEvent) {
        let observer = self.observer.lock().clone();
        match observer {
            Some(observer) => {
                if self.tx.send((observer, event)).is_err() {
                    log::warn!("Status dispatcher is gone, event dropped");
                }
            }
            None => {
                log::warn!("No status observer attached, dropping '{}' event", event.status);
            }
        }
    }
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("attached", &self.has_observer())
            .finish()
    }
}
