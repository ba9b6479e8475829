//! Broadcast shutdown signal.
//!
//! Every background loop owns a [`ShutdownSignal`] and does all of its
//! sleeping through [`ShutdownSignal::wait`], so dropping the single
//! [`ShutdownTrigger`] wakes every loop at once.

use {
    crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError},
    std::time::Duration,
};

/// Fires the shutdown when triggered or dropped.
#[derive(Debug)]
pub struct ShutdownTrigger {
    sender: Option<Sender<()>>,
}

impl ShutdownTrigger {
    pub fn trigger(&mut self) {
        self.sender.take();
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: Receiver<()>,
}

impl ShutdownSignal {
    /// Sleep for up to `timeout`. Returns `true` if shutdown was signalled.
    pub fn wait(&self, timeout: Duration) -> bool {
        !matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Timeout)
        )
    }

    pub fn is_triggered(&self) -> bool {
        !matches!(self.receiver.try_recv(), Err(TryRecvError::Empty))
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    // Nothing is ever sent; the channel only exists to be disconnected.
    let (sender, receiver) = bounded(0);
    (
        ShutdownTrigger {
            sender: Some(sender),
        },
        ShutdownSignal { receiver },
    )
}
