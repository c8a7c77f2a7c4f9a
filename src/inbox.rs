// src/inbox.rs
use std::sync::mpsc;

/// Callback shipped to the loop from another thread.
pub(crate) type ThreadsafeFn = Box<dyn FnOnce() + Send>;

/// Capacity of the cross-thread inbox. A full inbox blocks the sender.
const INBOX_CAP: usize = 100;

#[derive(Clone)]
pub(crate) struct InboxTx {
    tx: mpsc::SyncSender<ThreadsafeFn>,
}

pub(crate) struct InboxRx {
    rx: mpsc::Receiver<ThreadsafeFn>,
}

pub(crate) fn inbox_channel() -> (InboxTx, InboxRx) {
    let (tx, rx) = mpsc::sync_channel(INBOX_CAP);
    (InboxTx { tx }, InboxRx { rx })
}

impl InboxTx {
    /// Blocking send; returns false if the loop side is gone.
    #[inline]
    pub(crate) fn send(&self, f: ThreadsafeFn) -> bool {
        self.tx.send(f).is_ok()
    }
}

impl InboxRx {
    #[inline]
    pub(crate) fn try_recv(&self) -> Option<ThreadsafeFn> {
        self.rx.try_recv().ok()
    }
}
