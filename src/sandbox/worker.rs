//! The owning thread of a sandbox: one long-lived worker fed through a channel.

use std::any::Any;
use std::io;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Sender};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct OwningThread {
    sender: Sender<Job>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl OwningThread {
    pub(crate) fn spawn(name: String) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let handle = thread::Builder::new().name(name).spawn(move || {
            for job in receiver {
                job();
            }
        })?;
        let thread_id = handle.thread().id();
        Ok(Self {
            sender,
            handle: Some(handle),
            thread_id,
        })
    }

    pub(crate) fn sender(&self) -> Sender<Job> {
        self.sender.clone()
    }

    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Closes the queue and waits for queued jobs to finish. A worker stopping itself is
    /// detached instead.
    pub(crate) fn stop(mut self) {
        let current = self.is_current();
        let handle = self.handle.take();
        drop(self);
        if let Some(handle) = handle {
            if !current {
                let _ = handle.join();
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
