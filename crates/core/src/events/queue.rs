use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use super::{EventSink, PlayerEvent};
use crate::Result;

#[derive(Debug)]
pub(crate) enum QueueMessage {
    Event(PlayerEvent),
    /// Synthetic message that unblocks the consumer during termination.
    Wakeup,
}

/// Consumer of dispatched events. Runs on the queue's dedicated thread.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: PlayerEvent);
}

/// Unbounded many-producer, single-consumer FIFO of [`PlayerEvent`]s with
/// one dedicated consumer thread.
pub struct EventDispatchQueue {
    tx: Sender<QueueMessage>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatchQueue {
    /// Spawns the consumer thread. `name` becomes the thread name.
    pub fn start(name: impl Into<String>, handler: Arc<dyn EventHandler>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let stopped = Arc::new(AtomicBool::new(false));
        let worker = {
            let stopped = stopped.clone();
            thread::Builder::new()
                .name(name.into())
                .spawn(move || run(rx, stopped, handler))?
        };

        Ok(Self {
            tx,
            stopped,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Returns a producer handle for native callbacks and internal components.
    pub fn sink(&self) -> EventSink {
        EventSink::new(self.tx.clone())
    }

    /// Enqueues an event without blocking.
    pub fn post_event(&self, event: PlayerEvent) -> bool {
        !self.is_terminated() && self.sink().post(event)
    }

    pub fn is_terminated(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops the consumer. Idempotent.
    ///
    /// Events still queued, or posted concurrently, are discarded. When
    /// called from the consumer thread itself (a listener tearing its session
    /// down) the thread is left to exit on its own instead of being joined.
    pub fn terminate(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // Unbounded send only fails once the consumer is gone, which is fine.
        let _ = self.tx.send(QueueMessage::Wakeup);

        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            debug!("event queue terminated from its own consumer");
            return;
        }
        if worker.join().is_err() {
            error!("event queue consumer panicked");
        }
    }
}

impl Drop for EventDispatchQueue {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for EventDispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatchQueue")
            .field("pending", &self.tx.len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

fn run(rx: Receiver<QueueMessage>, stopped: Arc<AtomicBool>, handler: Arc<dyn EventHandler>) {
    while let Ok(message) = rx.recv() {
        if stopped.load(Ordering::Acquire) {
            break;
        }
        let QueueMessage::Event(event) = message else {
            continue;
        };
        trace!(?event, "dispatching");
        if panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event))).is_err() {
            error!("event handler panicked; continuing with next event");
        }
    }

    let discarded = rx.try_iter().count();
    debug!(discarded, "event queue consumer exiting");
}
