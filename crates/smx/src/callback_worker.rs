//! User callback worker
//!
//! User callbacks run on their own thread so the I/O thread never blocks on
//! user code, and so callbacks can call back into the public getters without
//! deadlocking. Events are delivered strictly in the order the I/O thread
//! posted them.

use std::thread::{JoinHandle, ThreadId};

use flume::{Receiver, Sender};

use crate::types::UpdateReason;

/// The user's update callback. Receives the pad number and the reason.
pub type UpdateCallback = dyn Fn(usize, UpdateReason) + Send + Sync;

/// Messages to the worker thread.
pub(crate) enum WorkerEvent {
    /// Invoke the user callback.
    Callback(usize, UpdateReason),
    /// Stop after everything queued ahead of this has been delivered.
    Shutdown,
}

/// Worker thread dispatching queued events to the user callback.
pub(crate) struct CallbackWorker {
    tx: Option<Sender<WorkerEvent>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl CallbackWorker {
    pub fn new(callback: Box<UpdateCallback>) -> CallbackWorker {
        let (tx, rx) = flume::unbounded();

        let thread = std::thread::Builder::new()
            .name("smx-callback".into())
            .spawn(move || run(rx, callback))
            .expect("failed to spawn callback worker thread");
        let thread_id = thread.thread().id();

        CallbackWorker {
            tx: Some(tx),
            thread: Some(thread),
            thread_id,
        }
    }

    /// A sender for the I/O thread to post events with.
    pub fn sender(&self) -> Sender<WorkerEvent> {
        self.tx.clone().expect("callback worker already shut down")
    }

    /// True when called from the worker thread itself. Used to detect a
    /// shutdown issued from inside a user callback, which would deadlock.
    pub fn is_current_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Stop the worker. Events already queued are delivered before this
    /// returns; nothing is delivered after.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WorkerEvent::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CallbackWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(rx: Receiver<WorkerEvent>, callback: Box<UpdateCallback>) {
    log::debug!("Callback worker started");
    while let Ok(event) = rx.recv() {
        match event {
            WorkerEvent::Callback(pad, reason) => callback(pad, reason),
            WorkerEvent::Shutdown => break,
        }
    }
    log::debug!("Callback worker stopped");
}
